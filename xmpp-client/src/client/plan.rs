// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Turning [`ClientOptions`] into an ordered list of connection paths

use std::sync::Arc;

use log::debug;

use crate::connect::proxy::{
    HttpConnectHandshake, ProxiedConnectionFactory, ProxyEndpoint, ProxyProvider,
    Socks5Handshake, DEFAULT_HTTP_PROXY_PORT, DEFAULT_SOCKS5_PORT,
};
use crate::connect::{ConnectionFactory, Resolver, ServerLocator};
use crate::options::{ClientOptions, HttpTrafficFilter, ProxyType};

/// One way of reaching the server
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Route {
    Direct,
    Socks5(ProxyEndpoint),
    HttpConnect(ProxyEndpoint),
}

impl Route {
    pub fn is_proxy(&self) -> bool {
        !matches!(self, Route::Direct)
    }
}

/// Where the server is, and the routes to try for every address, in order
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConnectionPlan {
    pub locator: ServerLocator,
    pub routes: Vec<Route>,
}

impl ConnectionPlan {
    pub fn build(domain: &str, options: &ClientOptions, proxies: &dyn ProxyProvider) -> Self {
        // Either manual setting skips SRV discovery; a port alone dials the
        // domain itself on that port.
        let locator = match (&options.manual_hostname, options.manual_port) {
            (Some(host), port) if !host.is_empty() => ServerLocator::no_srv(host, port),
            (_, Some(port)) => ServerLocator::no_srv(domain, Some(port)),
            (_, None) => ServerLocator::srv_default_client(domain),
        };

        let routes = match options.proxy_type {
            ProxyType::None => vec![Route::Direct],
            ProxyType::SystemConfigured => {
                let mut routes = Vec::new();
                if let Some(endpoint) = proxies.socks5_proxy() {
                    routes.push(Route::Socks5(endpoint));
                }
                if let Some(endpoint) = proxies.http_connect_proxy() {
                    routes.push(Route::HttpConnect(endpoint));
                }
                routes.push(Route::Direct);
                routes
            }
            ProxyType::Socks5 => manual_endpoint(options, proxies.socks5_proxy(), DEFAULT_SOCKS5_PORT)
                .map(Route::Socks5)
                .into_iter()
                .collect(),
            ProxyType::HttpConnect => {
                manual_endpoint(options, proxies.http_connect_proxy(), DEFAULT_HTTP_PROXY_PORT)
                    .map(Route::HttpConnect)
                    .into_iter()
                    .collect()
            }
        };
        debug!("Connection plan for {}: {:?}", locator, routes);
        ConnectionPlan { locator, routes }
    }

    /// One factory per route, sharing `direct` for the raw connections.
    pub fn factories(
        &self,
        resolver: &Arc<dyn Resolver>,
        direct: &Arc<dyn ConnectionFactory>,
        filter: Option<&Arc<dyn HttpTrafficFilter>>,
    ) -> Vec<Arc<dyn ConnectionFactory>> {
        self.routes
            .iter()
            .map(|route| -> Arc<dyn ConnectionFactory> {
                match route {
                    Route::Direct => direct.clone(),
                    Route::Socks5(endpoint) => Arc::new(ProxiedConnectionFactory::new(
                        endpoint.clone(),
                        resolver.clone(),
                        direct.clone(),
                        Arc::new(Socks5Handshake::new(endpoint.credentials.clone())),
                    )),
                    Route::HttpConnect(endpoint) => Arc::new(ProxiedConnectionFactory::new(
                        endpoint.clone(),
                        resolver.clone(),
                        direct.clone(),
                        Arc::new(HttpConnectHandshake::new(
                            endpoint.credentials.clone(),
                            filter.cloned(),
                        )),
                    )),
                }
            })
            .collect()
    }
}

/// The manually configured proxy: the manual host and port override the
/// system-discovered ones.
fn manual_endpoint(
    options: &ClientOptions,
    system: Option<ProxyEndpoint>,
    default_port: u16,
) -> Option<ProxyEndpoint> {
    let host = options
        .manual_proxy_hostname
        .clone()
        .filter(|host| !host.is_empty())
        .or_else(|| system.as_ref().map(|endpoint| endpoint.host.clone()))?;
    let port = options
        .manual_proxy_port
        .or_else(|| system.as_ref().map(|endpoint| endpoint.port))
        .unwrap_or(default_port);
    let credentials = options
        .proxy_credentials
        .clone()
        .or_else(|| system.and_then(|endpoint| endpoint.credentials));
    Some(ProxyEndpoint {
        host,
        port,
        credentials,
    })
}
