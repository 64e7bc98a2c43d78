// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Client-side [XMPP](https://xmpp.org/) engine with asynchronous I/O using [tokio](https://tokio.rs/).
//!
//! # Getting started
//!
//! Create a [`Client`], call [`Client::connect`] with some [`ClientOptions`], then
//! poll the client as a [`Stream`](futures::Stream) of [`Event`]s. The client finds
//! the server through SRV records, reaches it directly or through a SOCKS5 or HTTP
//! CONNECT proxy, negotiates STARTTLS, compression, SASL, resource binding and
//! stream management acknowledgements, and then routes stanzas both ways. You can
//! find a complete example in the `examples/echo_bot.rs` file in the repository.
//!
//! Every failure ends in exactly one [`Event::Disconnected`] carrying a
//! [`ClientError`]; a disconnect requested with [`Client::disconnect`] carries
//! none.
//!
//! # Features
//!
//! Supported transports:
//! - [x] Plaintext TCP (IPv4/IPv6), upgraded with StartTLS
//! - [x] SOCKS5 and HTTP CONNECT proxies, configured manually or from the environment
//! - [x] zlib stream compression
//! - [x] Custom transports via the [`connect::ConnectionFactory`] trait
//! - [ ] Websockets
//! - [ ] BOSH
//!
//! Not supported: stream resumption, components, servers.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod credentials;
mod event;
mod observer;
mod session;

pub mod channel;
pub mod connect;
pub mod options;
pub mod proto;
pub mod tls;

mod client;
pub use client::iq::{IqFailure, IqRequest, IqResponse, IqResponseToken};
pub use client::Client;

/// Detailed error types
pub mod error;

pub use channel::StanzaChannel;
pub use credentials::Password;
#[doc(inline)]
pub use error::ClientError;
pub use event::{Event, InvalidStanza, Stanza};
pub use observer::{Observers, Subscription};
pub use options::{ClientOptions, HttpTrafficFilter, ProxyCredentials, ProxyType, UseTls};
pub use tls::{CertificateTrustChecker, ClientCertificate};

// Re-exports
pub use minidom;
pub use xmpp_parsers as parsers;
pub use xmpp_parsers::jid;
