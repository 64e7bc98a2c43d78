// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Low-level stream framing

pub mod compression;
mod xmpp_codec;
mod xmpp_stream;

pub use xmpp_codec::{CodecError, Packet, TraceHook, Traffic, XmppCodec};
pub(crate) use xmpp_stream::stream_error;
pub use xmpp_stream::XmppStream;

/// XML namespaces used by the stream negotiation
pub mod ns {
    /// Default namespace of client streams
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// Stream namespace (`stream:` prefix)
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error conditions
    pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Legacy session establishment
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stream management (XEP-0198)
    pub const SM: &str = "urn:xmpp:sm:3";
    /// Stream compression feature (XEP-0138)
    pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
    /// Stream compression protocol (XEP-0138)
    pub const COMPRESS: &str = "http://jabber.org/protocol/compress";
}
