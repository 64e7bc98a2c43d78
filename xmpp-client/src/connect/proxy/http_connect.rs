// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! HTTP proxies using the CONNECT method (RFC 9110 §9.3.6)

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use futures::{future::BoxFuture, FutureExt};
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{ProxyError, ProxyHandshake};
use crate::connect::Connection;
use crate::options::{HttpTrafficFilter, ProxyCredentials};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// What to do after feeding proxy bytes into a [`HttpConnectNegotiation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// The response headers are incomplete
    NeedMore,
    /// Send this request and keep waiting
    Resend(String),
    /// The proxy accepted (`true`) or refused (`false`) the tunnel
    Finished(bool),
}

/// The CONNECT exchange without any I/O
pub struct HttpConnectNegotiation {
    target: SocketAddr,
    credentials: Option<ProxyCredentials>,
    filter: Option<Arc<dyn HttpTrafficFilter>>,
    buffer: Vec<u8>,
}

impl fmt::Debug for HttpConnectNegotiation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HttpConnectNegotiation")
            .field("target", &self.target)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl HttpConnectNegotiation {
    /// Prepare to tunnel to `target`.
    pub fn new(
        target: SocketAddr,
        credentials: Option<ProxyCredentials>,
        filter: Option<Arc<dyn HttpTrafficFilter>>,
    ) -> Self {
        HttpConnectNegotiation {
            target,
            credentials,
            filter,
            buffer: Vec::new(),
        }
    }

    fn request_line(&self) -> String {
        format!("CONNECT {} HTTP/1.1\r\n", self.target)
    }

    /// The first request sent to the proxy
    pub fn initial_request(&self) -> String {
        let mut request = self.request_line();
        if let Some(credentials) = self.credentials.as_ref().filter(|c| c.is_complete()) {
            let token = Base64.encode(format!(
                "{}:{}",
                credentials.id,
                credentials.password.expose()
            ));
            request.push_str("Proxy-Authorization: Basic ");
            request.push_str(&token);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        request
    }

    /// Account for bytes received from the proxy.
    pub fn feed(&mut self, data: &[u8]) -> Progress {
        self.buffer.extend_from_slice(data);

        let Some(end) = self
            .buffer
            .windows(HEADER_TERMINATOR.len())
            .position(|w| w == HEADER_TERMINATOR)
        else {
            if self.buffer.len() > 4 && !self.buffer.starts_with(b"HTTP") {
                debug!("Proxy does not answer with HTTP");
                return Progress::Finished(false);
            }
            return Progress::NeedMore;
        };

        let header_block = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
        if self.buffer.len() > end + HEADER_TERMINATOR.len() {
            warn!("Ignoring data sent by the proxy after its response headers");
        }
        self.buffer.clear();

        let (status_line, headers) = parse_header_block(&header_block);

        if let Some(filter) = &self.filter {
            let rewritten = filter.filter_response_headers(status_line, &headers);
            if !rewritten.is_empty() {
                let mut request = self.request_line();
                for (name, value) in rewritten {
                    request.push_str(&format!("{}: {}\r\n", name, value));
                }
                request.push_str("\r\n");
                return Progress::Resend(request);
            }
        }

        match status_line
            .split(' ')
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
        {
            Some(status) if status / 100 == 2 => Progress::Finished(true),
            Some(status) => {
                debug!("HTTP proxy returned status {status}");
                Progress::Finished(false)
            }
            None => {
                debug!("Unexpected HTTP proxy status line: {status_line}");
                Progress::Finished(false)
            }
        }
    }
}

fn parse_header_block(block: &str) -> (&str, Vec<(String, String)>) {
    let mut lines = block.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
        .collect();
    (status_line, headers)
}

/// [`ProxyHandshake`] for HTTP CONNECT proxies
#[derive(Debug, Clone, Default)]
pub struct HttpConnectHandshake {
    credentials: Option<ProxyCredentials>,
    filter: Option<Arc<dyn HttpTrafficFilter>>,
}

impl HttpConnectHandshake {
    /// Authenticate with `credentials` and consult `filter` on responses.
    pub fn new(
        credentials: Option<ProxyCredentials>,
        filter: Option<Arc<dyn HttpTrafficFilter>>,
    ) -> Self {
        HttpConnectHandshake {
            credentials,
            filter,
        }
    }
}

impl ProxyHandshake for HttpConnectHandshake {
    fn name(&self) -> &'static str {
        "HTTP CONNECT"
    }

    fn initialize<'a>(
        &'a self,
        io: &'a mut Connection,
        target: SocketAddr,
    ) -> BoxFuture<'a, Result<(), ProxyError>> {
        async move {
            let mut negotiation =
                HttpConnectNegotiation::new(target, self.credentials.clone(), self.filter.clone());
            io.write_all(negotiation.initial_request().as_bytes())
                .await?;
            io.flush().await?;

            let mut buf = [0u8; 1024];
            loop {
                let read = io.read(&mut buf).await?;
                if read == 0 {
                    return Err(ProxyError::UnexpectedEof);
                }
                match negotiation.feed(&buf[..read]) {
                    Progress::NeedMore => (),
                    Progress::Resend(request) => {
                        io.write_all(request.as_bytes()).await?;
                        io.flush().await?;
                    }
                    Progress::Finished(true) => return Ok(()),
                    Progress::Finished(false) => {
                        return Err(ProxyError::Refused(format!(
                            "HTTP proxy refused to connect to {target}"
                        )))
                    }
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Password;
    use std::sync::Mutex;

    fn target() -> SocketAddr {
        "192.0.2.7:5222".parse().unwrap()
    }

    #[test]
    fn request_without_credentials() {
        let negotiation = HttpConnectNegotiation::new(target(), None, None);
        assert_eq!(
            negotiation.initial_request(),
            "CONNECT 192.0.2.7:5222 HTTP/1.1\r\n\r\n"
        );
    }

    #[test]
    fn request_with_credentials() {
        let credentials = ProxyCredentials {
            id: "user".into(),
            password: Password::from("secret"),
        };
        let negotiation = HttpConnectNegotiation::new(target(), Some(credentials), None);
        assert_eq!(
            negotiation.initial_request(),
            "CONNECT 192.0.2.7:5222 HTTP/1.1\r\nProxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n\r\n"
        );
    }

    #[test]
    fn incomplete_credentials_are_not_sent() {
        let credentials = ProxyCredentials {
            id: "user".into(),
            password: Password::default(),
        };
        let negotiation = HttpConnectNegotiation::new(target(), Some(credentials), None);
        assert!(!negotiation.initial_request().contains("Proxy-Authorization"));
    }

    #[test]
    fn ipv6_target_is_bracketed() {
        let negotiation =
            HttpConnectNegotiation::new("[2001:db8::1]:5222".parse().unwrap(), None, None);
        assert!(negotiation
            .initial_request()
            .starts_with("CONNECT [2001:db8::1]:5222 HTTP/1.1\r\n"));
    }

    #[test]
    fn success_across_chunks() {
        let mut negotiation = HttpConnectNegotiation::new(target(), None, None);
        assert_eq!(negotiation.feed(b"HT"), Progress::NeedMore);
        assert_eq!(
            negotiation.feed(b"TP/1.1 200 Connection established\r\n"),
            Progress::NeedMore
        );
        assert_eq!(negotiation.feed(b"\r\n"), Progress::Finished(true));
    }

    #[test]
    fn non_2xx_fails() {
        let mut negotiation = HttpConnectNegotiation::new(target(), None, None);
        assert_eq!(
            negotiation.feed(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n"),
            Progress::Finished(false)
        );
    }

    #[test]
    fn unparsable_status_fails() {
        let mut negotiation = HttpConnectNegotiation::new(target(), None, None);
        assert_eq!(
            negotiation.feed(b"HTTP/1.1 abc\r\n\r\n"),
            Progress::Finished(false)
        );
        let mut negotiation = HttpConnectNegotiation::new(target(), None, None);
        assert_eq!(negotiation.feed(b"HTTP/1.1\r\n\r\n"), Progress::Finished(false));
    }

    #[test]
    fn non_http_fails_fast() {
        let mut negotiation = HttpConnectNegotiation::new(target(), None, None);
        assert_eq!(negotiation.feed(b"SSH-"), Progress::NeedMore);
        assert_eq!(negotiation.feed(b"2"), Progress::Finished(false));
    }

    #[derive(Debug, Default)]
    struct Challenge {
        seen: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl HttpTrafficFilter for Challenge {
        fn filter_response_headers(
            &self,
            status_line: &str,
            headers: &[(String, String)],
        ) -> Vec<(String, String)> {
            let mut seen = self.seen.lock().unwrap();
            seen.push((status_line.to_owned(), headers.to_vec()));
            if seen.len() == 1 {
                vec![("Proxy-Authorization".into(), "Negotiate abc".into())]
            } else {
                vec![]
            }
        }
    }

    #[test]
    fn filter_triggers_resend_then_status_decides() {
        let filter = Arc::new(Challenge::default());
        let mut negotiation = HttpConnectNegotiation::new(target(), None, Some(filter.clone()));
        assert_eq!(
            negotiation.feed(
                b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Negotiate\r\n\r\n"
            ),
            Progress::Resend(
                "CONNECT 192.0.2.7:5222 HTTP/1.1\r\nProxy-Authorization: Negotiate abc\r\n\r\n"
                    .into()
            )
        );
        assert_eq!(
            negotiation.feed(b"HTTP/1.1 200 OK\r\n\r\n"),
            Progress::Finished(true)
        );
        let seen = filter.seen.lock().unwrap();
        assert_eq!(seen[0].0, "HTTP/1.1 407 Proxy Authentication Required");
        assert_eq!(
            seen[0].1,
            [("Proxy-Authenticate".to_owned(), "Negotiate".to_owned())]
        );
        assert_eq!(seen[1].0, "HTTP/1.1 200 OK");
    }

    #[tokio::test]
    async fn handshake_over_a_pipe() {
        let (client, mut proxy) = tokio::io::duplex(256);
        let mut client: Connection = Box::new(client);
        let server = tokio::spawn(async move {
            let mut request = Vec::new();
            let mut buf = [0u8; 256];
            while !request.ends_with(b"\r\n\r\n") {
                let n = proxy.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
            }
            proxy
                .write_all(b"HTTP/1.0 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            request
        });
        HttpConnectHandshake::default()
            .initialize(&mut client, target())
            .await
            .unwrap();
        assert_eq!(
            server.await.unwrap(),
            b"CONNECT 192.0.2.7:5222 HTTP/1.1\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn handshake_refused() {
        let (client, mut proxy) = tokio::io::duplex(256);
        let mut client: Connection = Box::new(client);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = proxy.read(&mut buf).await;
            proxy
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });
        let result = HttpConnectHandshake::default()
            .initialize(&mut client, target())
            .await;
        assert!(matches!(result, Err(ProxyError::Refused(_))));
    }
}
