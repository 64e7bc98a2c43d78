// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Options applied by [`Client::connect`](crate::Client::connect).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::Password;

/// Overall time budget for finding and connecting to the server
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// When to encrypt the stream with STARTTLS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UseTls {
    /// Encrypt if the server offers STARTTLS
    #[default]
    WhenAvailable,
    /// Never encrypt, even if offered
    Never,
    /// Fail the session unless the server offers STARTTLS
    Required,
}

/// Which proxy, if any, to connect through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyType {
    /// Always connect directly
    None,
    /// Use the proxies found in the system configuration, then fall back to
    /// a direct connection
    #[default]
    SystemConfigured,
    /// Only connect through a SOCKS5 proxy
    Socks5,
    /// Only connect through an HTTP proxy using CONNECT
    HttpConnect,
}

/// Credentials presented to a proxy
#[derive(Debug, Clone)]
pub struct ProxyCredentials {
    /// User name
    pub id: String,
    /// Password
    pub password: Password,
}

impl ProxyCredentials {
    /// Both parts are non-empty.
    pub fn is_complete(&self) -> bool {
        !self.id.is_empty() && !self.password.is_empty()
    }
}

/// Hook inspecting the response headers of an HTTP CONNECT proxy.
///
/// Returning a non-empty header list makes the client send a new CONNECT
/// request carrying those headers, which allows for challenge/response
/// schemes with the proxy.
pub trait HttpTrafficFilter: fmt::Debug + Send + Sync {
    /// Inspect one complete response header block.
    fn filter_response_headers(
        &self,
        status_line: &str,
        headers: &[(String, String)],
    ) -> Vec<(String, String)>;
}

/// Connection options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Negotiate zlib stream compression when offered
    pub use_stream_compression: bool,
    /// STARTTLS policy
    pub use_tls: UseTls,
    /// Permit SASL PLAIN on an unencrypted stream
    pub allow_plain_without_tls: bool,
    /// Wipe the stored password once it has been used
    pub forget_password: bool,
    /// Enable stream management acknowledgements when offered
    pub use_acks: bool,
    /// Authenticate with SASL EXTERNAL using the client certificate
    pub single_sign_on: bool,
    /// Connect to this host instead of discovering it through SRV records
    pub manual_hostname: Option<String>,
    /// Connect to this port instead of discovering it through SRV records.
    ///
    /// Without [`manual_hostname`](Self::manual_hostname), the JID's domain
    /// is dialled directly on this port.
    pub manual_port: Option<u16>,
    /// Proxy selection
    pub proxy_type: ProxyType,
    /// Overrides the system-discovered proxy host
    pub manual_proxy_hostname: Option<String>,
    /// Overrides the system-discovered proxy port
    pub manual_proxy_port: Option<u16>,
    /// Credentials for a manually configured proxy
    pub proxy_credentials: Option<ProxyCredentials>,
    /// Hook for HTTP CONNECT response headers
    pub http_traffic_filter: Option<Arc<dyn HttpTrafficFilter>>,
    /// Overall bound on name resolution and connection attempts
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            use_stream_compression: true,
            use_tls: UseTls::default(),
            allow_plain_without_tls: false,
            forget_password: false,
            use_acks: true,
            single_sign_on: false,
            manual_hostname: None,
            manual_port: None,
            proxy_type: ProxyType::default(),
            manual_proxy_hostname: None,
            manual_proxy_port: None,
            proxy_credentials: None,
            http_traffic_filter: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}
