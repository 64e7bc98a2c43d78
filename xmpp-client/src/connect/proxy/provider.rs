// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Discovery of system-configured proxies

use std::env;
use std::fmt;

use log::{debug, warn};
use url::Url;

use super::{ProxyEndpoint, DEFAULT_HTTP_PROXY_PORT, DEFAULT_SOCKS5_PORT};
use crate::credentials::Password;
use crate::options::ProxyCredentials;

/// Source of the proxies the platform is configured to use
pub trait ProxyProvider: fmt::Debug + Send + Sync {
    /// The SOCKS5 proxy, if any
    fn socks5_proxy(&self) -> Option<ProxyEndpoint>;

    /// The HTTP CONNECT proxy, if any
    fn http_connect_proxy(&self) -> Option<ProxyEndpoint>;
}

/// Knows of no proxies
#[derive(Debug, Clone, Default)]
pub struct NoProxyProvider;

impl ProxyProvider for NoProxyProvider {
    fn socks5_proxy(&self) -> Option<ProxyEndpoint> {
        None
    }

    fn http_connect_proxy(&self) -> Option<ProxyEndpoint> {
        None
    }
}

/// Reads the conventional `socks_proxy`, `all_proxy`, `https_proxy` and
/// `http_proxy` environment variables (either case).
#[derive(Debug, Clone, Default)]
pub struct EnvironmentProxyProvider;

const SOCKS_VARIABLES: &[&str] = &["socks_proxy", "SOCKS_PROXY", "all_proxy", "ALL_PROXY"];
const HTTP_VARIABLES: &[&str] = &["https_proxy", "HTTPS_PROXY", "http_proxy", "HTTP_PROXY"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Socks5,
    Http,
}

/// Parse a proxy URL such as `socks5://user:pw@host:1080` or `host:3128`.
fn parse_proxy(value: &str, kind: Kind) -> Option<ProxyEndpoint> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let explicit_scheme = value.contains("://");
    let with_scheme = if explicit_scheme {
        value.to_owned()
    } else {
        match kind {
            Kind::Socks5 => format!("socks5://{}", value),
            Kind::Http => format!("http://{}", value),
        }
    };
    let url = match Url::parse(&with_scheme) {
        Ok(url) => url,
        Err(e) => {
            warn!("Ignoring invalid proxy setting {value:?}: {e}");
            return None;
        }
    };
    let scheme_kind = match url.scheme() {
        "socks" | "socks5" | "socks5h" => Kind::Socks5,
        "http" | "https" => Kind::Http,
        other => {
            debug!("Ignoring proxy with unsupported scheme {other}");
            return None;
        }
    };
    if scheme_kind != kind {
        return None;
    }
    let host = url.host_str()?.trim_matches(|c| c == '[' || c == ']');
    let port = if explicit_scheme {
        url.port_or_known_default()
    } else {
        url.port()
    };
    let port = port.unwrap_or(match kind {
        Kind::Socks5 => DEFAULT_SOCKS5_PORT,
        Kind::Http => DEFAULT_HTTP_PROXY_PORT,
    });
    let credentials = match url.username() {
        "" => None,
        id => Some(ProxyCredentials {
            id: id.to_owned(),
            password: Password::new(url.password().unwrap_or_default()),
        }),
    };
    Some(ProxyEndpoint {
        host: host.to_owned(),
        port,
        credentials,
    })
}

fn from_environment(variables: &[&str], kind: Kind) -> Option<ProxyEndpoint> {
    variables
        .iter()
        .filter_map(|name| env::var(name).ok())
        .find_map(|value| parse_proxy(&value, kind))
}

impl ProxyProvider for EnvironmentProxyProvider {
    fn socks5_proxy(&self) -> Option<ProxyEndpoint> {
        from_environment(SOCKS_VARIABLES, Kind::Socks5)
    }

    fn http_connect_proxy(&self) -> Option<ProxyEndpoint> {
        from_environment(HTTP_VARIABLES, Kind::Http)
    }
}
