// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Acquiring raw connections to an XMPP server
//!
//! A [`Connector`] resolves the server and walks through an ordered list of
//! [`ConnectionFactory`] implementations: plain TCP, or TCP through a proxy
//! whose handshake is a pluggable [`proxy::ProxyHandshake`] strategy.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

mod connector;
pub mod dns;
pub mod proxy;
mod tcp;

pub use connector::{Connector, ConnectorHandle};
pub use dns::{Resolver, ServerLocator, SrvRecord};
pub use tcp::TcpConnectionFactory;

/// Transport a session runs on
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// A raw, established byte connection
pub type Connection = Box<dyn AsyncReadAndWrite>;

/// Opens raw connections to resolved addresses
pub trait ConnectionFactory: fmt::Debug + Send + Sync {
    /// Connect to `target`, performing whatever handshake this factory needs
    /// before application bytes can flow.
    fn connect(&self, target: SocketAddr) -> BoxFuture<'_, io::Result<Connection>>;
}
