// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Connections tunnelled through a proxy
//!
//! [`ProxiedConnectionFactory`] opens a connection to the proxy with an
//! inner [`ConnectionFactory`] and then runs a [`ProxyHandshake`] strategy
//! on it; once the handshake has succeeded the connection is handed out as
//! if it went to the target directly.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};
use log::debug;

use crate::connect::dns::Resolver;
use crate::connect::{Connection, ConnectionFactory};
use crate::options::ProxyCredentials;

mod http_connect;
mod provider;
mod socks5;

pub use http_connect::{HttpConnectHandshake, HttpConnectNegotiation, Progress};
pub use provider::{EnvironmentProxyProvider, NoProxyProvider, ProxyProvider};
pub use socks5::Socks5Handshake;

/// Default port of SOCKS5 proxies
pub const DEFAULT_SOCKS5_PORT: u16 = 1080;

/// Default port of HTTP proxies
pub const DEFAULT_HTTP_PROXY_PORT: u16 = 8080;

/// Address of a proxy server
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    /// Proxy host name or IP literal
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Credentials, if the proxy wants any
    pub credentials: Option<ProxyCredentials>,
}

impl PartialEq for ProxyEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && match (&self.credentials, &other.credentials) {
                (None, None) => true,
                (Some(a), Some(b)) => a.id == b.id && a.password.expose() == b.password.expose(),
                _ => false,
            }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Failure of a proxy handshake
#[derive(Debug)]
pub enum ProxyError {
    /// Reading from or writing to the proxy failed
    Io(io::Error),
    /// The proxy closed the connection mid-handshake
    UnexpectedEof,
    /// The proxy spoke something other than the expected protocol
    Protocol(String),
    /// The proxy refused the credentials
    AuthenticationFailed,
    /// The proxy refused to connect to the target
    Refused(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProxyError::Io(e) => write!(fmt, "proxy I/O error: {}", e),
            ProxyError::UnexpectedEof => write!(fmt, "proxy closed the connection"),
            ProxyError::Protocol(e) => write!(fmt, "proxy protocol error: {}", e),
            ProxyError::AuthenticationFailed => write!(fmt, "proxy authentication failed"),
            ProxyError::Refused(e) => write!(fmt, "proxy refused the connection: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProxyError::UnexpectedEof
        } else {
            ProxyError::Io(e)
        }
    }
}

impl From<ProxyError> for io::Error {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Io(e) => e,
            ProxyError::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, e),
            ProxyError::AuthenticationFailed => {
                io::Error::new(io::ErrorKind::PermissionDenied, e)
            }
            ProxyError::Refused(_) => io::Error::new(io::ErrorKind::ConnectionRefused, e),
            ProxyError::Protocol(_) => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

/// A proxy protocol, run on a fresh connection to the proxy
pub trait ProxyHandshake: fmt::Debug + Send + Sync {
    /// Protocol name for logs
    fn name(&self) -> &'static str;

    /// Ask the proxy to connect `io` through to `target`.
    fn initialize<'a>(
        &'a self,
        io: &'a mut Connection,
        target: SocketAddr,
    ) -> BoxFuture<'a, Result<(), ProxyError>>;
}

/// Connects to targets through a proxy
#[derive(Debug)]
pub struct ProxiedConnectionFactory {
    endpoint: ProxyEndpoint,
    resolver: Arc<dyn Resolver>,
    inner: Arc<dyn ConnectionFactory>,
    handshake: Arc<dyn ProxyHandshake>,
}

impl ProxiedConnectionFactory {
    /// Reach the proxy at `endpoint` with `inner` and tunnel with `handshake`.
    pub fn new(
        endpoint: ProxyEndpoint,
        resolver: Arc<dyn Resolver>,
        inner: Arc<dyn ConnectionFactory>,
        handshake: Arc<dyn ProxyHandshake>,
    ) -> Self {
        ProxiedConnectionFactory {
            endpoint,
            resolver,
            inner,
            handshake,
        }
    }

    async fn connect_to_proxy(&self) -> io::Result<Connection> {
        let addresses = self
            .resolver
            .lookup_addresses(&self.endpoint.host)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;
        let mut last_error = io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for proxy {}", self.endpoint),
        );
        for ip in addresses {
            match self
                .inner
                .connect(SocketAddr::new(ip, self.endpoint.port))
                .await
            {
                Ok(connection) => return Ok(connection),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

impl ConnectionFactory for ProxiedConnectionFactory {
    fn connect(&self, target: SocketAddr) -> BoxFuture<'_, io::Result<Connection>> {
        async move {
            let mut connection = self.connect_to_proxy().await?;
            debug!(
                "Connected to {} proxy {}, requesting {}",
                self.handshake.name(),
                self.endpoint,
                target
            );
            self.handshake.initialize(&mut connection, target).await?;
            Ok(connection)
        }
        .boxed()
    }
}
