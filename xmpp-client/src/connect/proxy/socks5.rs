// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SOCKS5 proxies (RFC 1928), with optional username/password
//! authentication (RFC 1929)

use std::net::SocketAddr;

use futures::{future::BoxFuture, FutureExt};
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{ProxyError, ProxyHandshake};
use crate::connect::Connection;
use crate::options::ProxyCredentials;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const AUTH_PASSWORD_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;

fn reply_message(rep: u8) -> &'static str {
    match rep {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// [`ProxyHandshake`] for SOCKS5 proxies
#[derive(Debug, Clone, Default)]
pub struct Socks5Handshake {
    credentials: Option<ProxyCredentials>,
}

impl Socks5Handshake {
    /// Offer username/password authentication if `credentials` are complete.
    pub fn new(credentials: Option<ProxyCredentials>) -> Self {
        Socks5Handshake {
            credentials: credentials.filter(|c| c.is_complete()),
        }
    }

    fn greeting(&self) -> Vec<u8> {
        if self.credentials.is_some() {
            vec![SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
        } else {
            vec![SOCKS5_VERSION, 1, AUTH_NONE]
        }
    }

    async fn authenticate(&self, io: &mut Connection) -> Result<(), ProxyError> {
        let Some(credentials) = &self.credentials else {
            return Err(ProxyError::Protocol(
                "proxy selected password authentication which was not offered".into(),
            ));
        };
        let username = credentials.id.as_bytes();
        let password = credentials.password.expose().as_bytes();
        let (Ok(username_len), Ok(password_len)) =
            (u8::try_from(username.len()), u8::try_from(password.len()))
        else {
            return Err(ProxyError::Protocol("proxy credentials too long".into()));
        };

        let mut request = Vec::with_capacity(3 + username.len() + password.len());
        request.push(AUTH_PASSWORD_VERSION);
        request.push(username_len);
        request.extend_from_slice(username);
        request.push(password_len);
        request.extend_from_slice(password);
        io.write_all(&request).await?;

        let mut response = [0u8; 2];
        io.read_exact(&mut response).await?;
        if response[1] != 0x00 {
            return Err(ProxyError::AuthenticationFailed);
        }
        Ok(())
    }
}

fn connect_request(target: SocketAddr) -> Vec<u8> {
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match target {
        SocketAddr::V4(v4) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.ip().octets());
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    request
}

impl ProxyHandshake for Socks5Handshake {
    fn name(&self) -> &'static str {
        "SOCKS5"
    }

    fn initialize<'a>(
        &'a self,
        io: &'a mut Connection,
        target: SocketAddr,
    ) -> BoxFuture<'a, Result<(), ProxyError>> {
        async move {
            io.write_all(&self.greeting()).await?;

            let mut response = [0u8; 2];
            io.read_exact(&mut response).await?;
            if response[0] != SOCKS5_VERSION {
                return Err(ProxyError::Protocol(format!(
                    "unexpected SOCKS version {}",
                    response[0]
                )));
            }
            match response[1] {
                AUTH_NONE => (),
                AUTH_PASSWORD => self.authenticate(io).await?,
                AUTH_NO_ACCEPTABLE => return Err(ProxyError::AuthenticationFailed),
                other => {
                    return Err(ProxyError::Protocol(format!(
                        "proxy selected unoffered method {other}"
                    )))
                }
            }

            io.write_all(&connect_request(target)).await?;

            let mut reply = [0u8; 4];
            io.read_exact(&mut reply).await?;
            if reply[0] != SOCKS5_VERSION {
                return Err(ProxyError::Protocol(format!(
                    "unexpected SOCKS version {}",
                    reply[0]
                )));
            }
            if reply[1] != REP_SUCCESS {
                return Err(ProxyError::Refused(reply_message(reply[1]).into()));
            }

            // Skip the bound address.
            let skip = match reply[3] {
                ATYP_IPV4 => 4 + 2,
                ATYP_IPV6 => 16 + 2,
                ATYP_DOMAIN => usize::from(io.read_u8().await?) + 2,
                other => {
                    return Err(ProxyError::Protocol(format!(
                        "unknown address type {other}"
                    )))
                }
            };
            let mut bound = vec![0u8; skip];
            io.read_exact(&mut bound).await?;

            debug!("SOCKS5 tunnel to {target} established");
            Ok(())
        }
        .boxed()
    }
}
