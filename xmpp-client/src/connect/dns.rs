// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Server discovery: SRV records and address lookups

use std::fmt;
use std::net::IpAddr;

use futures::future::BoxFuture;
use futures::FutureExt;
#[cfg(feature = "dns")]
use hickory_resolver::{
    config::LookupIpStrategy, name_server::TokioConnectionProvider, TokioAsyncResolver,
};

/// SRV service prefix for client-to-server streams
pub const CLIENT_SRV_PREFIX: &str = "_xmpp-client._tcp.";

/// Port used when neither SRV records nor the configuration name one
pub const DEFAULT_CLIENT_PORT: u16 = 5222;

/// Where to look for the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerLocator {
    /// Hostname (or IP literal) to resolve
    pub host: String,
    /// Port for the direct lookup of `host`, 5222 when unset
    pub port: Option<u16>,
    /// SRV service prefix, eg. `_xmpp-client._tcp.`; `None` disables SRV
    pub srv_prefix: Option<String>,
}

impl ServerLocator {
    /// Discover the client service of `host` through SRV records
    pub fn srv_default_client(host: &str) -> Self {
        ServerLocator {
            host: host.to_owned(),
            port: None,
            srv_prefix: Some(CLIENT_SRV_PREFIX.to_owned()),
        }
    }

    /// Connect to `host` directly, without SRV discovery
    pub fn no_srv(host: &str, port: Option<u16>) -> Self {
        ServerLocator {
            host: host.to_owned(),
            port,
            srv_prefix: None,
        }
    }

    /// The SRV name to query, if SRV discovery applies
    pub fn srv_name(&self) -> Option<String> {
        self.srv_prefix
            .as_ref()
            .map(|prefix| format!("{}{}", prefix, self.host))
    }

    /// Port for the direct lookup of [`host`](Self::host)
    pub fn fallback_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_CLIENT_PORT)
    }
}

impl fmt::Display for ServerLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

/// One SRV answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SrvRecord {
    /// Lower is preferred
    pub priority: u16,
    /// Higher is preferred among equal priorities
    pub weight: u16,
    /// Service port
    pub port: u16,
    /// Host providing the service
    pub target: String,
}

/// Order SRV answers by preference.
pub fn sort_srv_records(records: &mut [SrvRecord]) {
    records.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.weight.cmp(&a.weight))
    });
}

/// Name resolution failure
#[derive(Debug, Clone)]
pub struct ResolveError(pub String);

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "name resolution failed: {}", self.0)
    }
}

impl std::error::Error for ResolveError {}

#[cfg(feature = "dns")]
impl From<hickory_resolver::error::ResolveError> for ResolveError {
    fn from(e: hickory_resolver::error::ResolveError) -> Self {
        ResolveError(e.to_string())
    }
}

/// Name resolver used by the [`Connector`](crate::connect::Connector)
pub trait Resolver: fmt::Debug + Send + Sync {
    /// Look up SRV records for a fully prefixed service name
    fn lookup_srv<'a>(&'a self, name: &'a str)
        -> BoxFuture<'a, Result<Vec<SrvRecord>, ResolveError>>;

    /// Look up the addresses of a host
    fn lookup_addresses<'a>(&'a self, host: &'a str)
        -> BoxFuture<'a, Result<Vec<IpAddr>, ResolveError>>;
}

#[cfg(feature = "dns")]
fn to_ascii(name: &str) -> Result<String, ResolveError> {
    idna::domain_to_ascii(name).map_err(|e| ResolveError(format!("IDNA error: {}", e)))
}

/// System resolver backed by hickory
#[cfg(feature = "dns")]
#[derive(Debug, Clone, Default)]
pub struct HickoryResolver;

#[cfg(feature = "dns")]
impl Resolver for HickoryResolver {
    fn lookup_srv<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SrvRecord>, ResolveError>> {
        async move {
            let ascii_name = to_ascii(name)?;
            let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
            let lookup = resolver.srv_lookup(format!("{}.", ascii_name)).await?;
            Ok(lookup
                .iter()
                .map(|srv| SrvRecord {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    port: srv.port(),
                    target: srv.target().to_ascii().trim_end_matches('.').to_owned(),
                })
                .collect())
        }
        .boxed()
    }

    fn lookup_addresses<'a>(
        &'a self,
        host: &'a str,
    ) -> BoxFuture<'a, Result<Vec<IpAddr>, ResolveError>> {
        async move {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(vec![ip]);
            }
            let ascii_host = to_ascii(host)?;
            let (config, mut options) = hickory_resolver::system_conf::read_system_conf()?;
            options.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
            let resolver =
                TokioAsyncResolver::new(config, options, TokioConnectionProvider::default());
            let ips = resolver.lookup_ip(ascii_host).await?;
            Ok(ips.iter().collect())
        }
        .boxed()
    }
}

/// Resolver using the operating system's `getaddrinfo`, without SRV support
#[derive(Debug, Clone, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn lookup_srv<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SrvRecord>, ResolveError>> {
        async move {
            log::debug!("SRV lookup for {name} not supported by the system resolver");
            Ok(Vec::new())
        }
        .boxed()
    }

    fn lookup_addresses<'a>(
        &'a self,
        host: &'a str,
    ) -> BoxFuture<'a, Result<Vec<IpAddr>, ResolveError>> {
        async move {
            let addrs = tokio::net::lookup_host((host, 0))
                .await
                .map_err(|e| ResolveError(e.to_string()))?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        }
        .boxed()
    }
}

/// The resolver used when none is configured
pub fn default_resolver() -> std::sync::Arc<dyn Resolver> {
    #[cfg(feature = "dns")]
    {
        std::sync::Arc::new(HickoryResolver)
    }
    #[cfg(not(feature = "dns"))]
    {
        std::sync::Arc::new(SystemResolver)
    }
}
