// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::{FutureExt, StreamExt};
use tokio::io::DuplexStream;

use super::*;
use crate::connect::dns::{ResolveError, SrvRecord};
use crate::connect::proxy::NoProxyProvider;
use crate::minidom::Element;
use crate::options::ProxyType;
use crate::session::tests::{Server, BIND_FEATURES};

const PLAIN_FEATURES: &str = "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>";

#[derive(Debug)]
struct Localhost;

impl Resolver for Localhost {
    fn lookup_srv<'a>(
        &'a self,
        _name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SrvRecord>, ResolveError>> {
        future::ready(Err(ResolveError("NXDOMAIN".into()))).boxed()
    }

    fn lookup_addresses<'a>(
        &'a self,
        _host: &'a str,
    ) -> BoxFuture<'a, Result<Vec<IpAddr>, ResolveError>> {
        future::ready(Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])).boxed()
    }
}

#[derive(Debug)]
struct Unresolvable;

impl Resolver for Unresolvable {
    fn lookup_srv<'a>(
        &'a self,
        _name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SrvRecord>, ResolveError>> {
        future::ready(Err(ResolveError("NXDOMAIN".into()))).boxed()
    }

    fn lookup_addresses<'a>(
        &'a self,
        _host: &'a str,
    ) -> BoxFuture<'a, Result<Vec<IpAddr>, ResolveError>> {
        future::ready(Err(ResolveError("NXDOMAIN".into()))).boxed()
    }
}

/// Hands out prepared pipes, then hangs
#[derive(Debug, Default)]
struct Pipes {
    ends: Mutex<Vec<DuplexStream>>,
}

impl Pipes {
    fn with(end: DuplexStream) -> Self {
        Pipes {
            ends: Mutex::new(vec![end]),
        }
    }
}

impl ConnectionFactory for Pipes {
    fn connect(&self, _target: SocketAddr) -> BoxFuture<'_, io::Result<Connection>> {
        match self.ends.lock().unwrap().pop() {
            Some(end) => future::ready(Ok(Box::new(end) as Connection)).boxed(),
            None => future::pending().boxed(),
        }
    }
}

fn client(resolver: Arc<dyn Resolver>, factory: Pipes) -> Client {
    let _ = env_logger::builder().is_test(true).try_init();
    Client::new_with_network(
        "juliet@example.org/balcony".parse::<Jid>().unwrap(),
        "pencil",
        resolver,
        Arc::new(factory),
        Arc::new(NoProxyProvider),
    )
}

fn options() -> ClientOptions {
    ClientOptions {
        proxy_type: ProxyType::None,
        allow_plain_without_tls: true,
        use_stream_compression: false,
        ..ClientOptions::default()
    }
}

async fn next(client: &mut Client) -> Event {
    tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("no client event")
        .expect("client stream ended")
}

/// Serve a PLAIN login and a resource binding.
async fn log_in(server: &mut Server) {
    server.open(PLAIN_FEATURES).await;
    let auth = server.expect("</auth>").await;
    assert!(auth.contains("AGp1bGlldABwZW5jaWw="));
    server
        .send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
        .await;
    server.open(BIND_FEATURES).await;
    server.bind().await;
}

#[test]
fn disconnect_when_idle_is_a_no_op() {
    let mut client = client(Arc::new(Localhost), Pipes::default());
    assert!(!client.is_active());
    client.disconnect();
    client.disconnect();
    assert!(!client.is_active());
    assert!(!client.is_available());
    assert_eq!(client.jid().to_string(), "juliet@example.org/balcony");
}

#[tokio::test]
async fn unresolvable_domain() {
    let mut client = client(Arc::new(Unresolvable), Pipes::default());
    client.connect(options());
    assert!(client.is_active());
    assert!(matches!(
        next(&mut client).await,
        Event::Disconnected(Some(ClientError::DomainNameResolve))
    ));
    assert!(!client.is_active());
}

#[tokio::test]
async fn disconnect_cancels_the_connector() {
    let mut client = client(Arc::new(Localhost), Pipes::default());
    client.connect(options());
    client.disconnect();
    assert!(matches!(
        next(&mut client).await,
        Event::Disconnected(None)
    ));
    assert!(!client.is_active());
}

#[tokio::test]
async fn force_reset_silences_the_previous_attempt() {
    let mut client = client(Arc::new(Localhost), Pipes::default());
    client.connect(options());
    client.force_reset();
    assert!(!client.is_active());
    assert!(
        tokio::time::timeout(Duration::from_millis(100), client.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn unreadable_client_certificate() {
    let mut client = client(Arc::new(Localhost), Pipes::default());
    client.set_certificate(Some(ClientCertificate::from_pem_files(
        "/nonexistent/client.pem",
        "/nonexistent/client.key",
    )));
    client.connect(options());
    assert!(matches!(
        next(&mut client).await,
        Event::Disconnected(Some(ClientError::ClientCertificateLoad))
    ));
}

#[tokio::test]
async fn connect_send_and_disconnect() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let mut client = client(Arc::new(Localhost), Pipes::with(ours));
    let written = Arc::new(Mutex::new(Vec::new()));
    let written2 = written.clone();
    let _trace = client.on_data_written(move |data| {
        written2.lock().unwrap().extend_from_slice(data);
    });

    let server = tokio::spawn(async move {
        let mut server = Server::new(theirs);
        log_in(&mut server).await;
        server.expect("<message").await;
        server.expect("</stream:stream>").await;
        server.send("</stream:stream>").await;
    });

    client.connect(ClientOptions {
        forget_password: true,
        ..options()
    });
    match next(&mut client).await {
        Event::Connected { bound_jid } => {
            assert_eq!(bound_jid.to_string(), "juliet@example.org/balcony")
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(client.is_available());
    assert!(!client.is_stream_encrypted());
    // The password was used once and is gone.
    assert!(!client.credentials.has_password());
    let written = String::from_utf8_lossy(&written.lock().unwrap()).into_owned();
    assert!(written.contains("<stream:stream"));

    let message = Message::new(Some("romeo@example.net".parse().unwrap()));
    client.send_message(message).unwrap();
    client.disconnect();
    assert!(!client.is_available());
    assert!(client.send_message(Message::new(None)).is_err());

    assert!(matches!(
        next(&mut client).await,
        Event::Disconnected(None)
    ));
    assert!(!client.is_active());
    server.await.unwrap();
}

#[tokio::test]
async fn asks_for_credentials_without_a_stored_password() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let _ = env_logger::builder().is_test(true).try_init();
    let mut client = Client::new_with_network(
        "juliet@example.org/balcony".parse::<Jid>().unwrap(),
        "",
        Arc::new(Localhost),
        Arc::new(Pipes::with(ours)),
        Arc::new(NoProxyProvider),
    );
    let server = tokio::spawn(async move {
        let mut server = Server::new(theirs);
        log_in(&mut server).await;
        server
    });

    client.connect(options());
    assert!(matches!(next(&mut client).await, Event::NeedCredentials));
    client.send_credentials("pencil");
    assert!(next(&mut client).await.is_connected());
    let _server = server.await.unwrap();
}

#[tokio::test]
async fn iq_responses_reach_the_request() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let mut client = client(Arc::new(Localhost), Pipes::with(ours));
    let server = tokio::spawn(async move {
        let mut server = Server::new(theirs);
        log_in(&mut server).await;
        server.expect("<iq").await;
        let rest = server.expect("</iq>").await;
        let request: Element = format!("<iq{}", rest).parse().unwrap();
        let id = request.attr("id").unwrap().to_owned();
        server
            .send(&format!("<iq type='result' from='example.org' id='{}'/>", id))
            .await;
        server
    });

    client.connect(options());
    assert!(next(&mut client).await.is_connected());

    let mut token = client.send_iq(
        None,
        IqRequest::Get(Element::builder("ping", "urn:xmpp:ping").build()),
    );
    let response = loop {
        tokio::select! {
            response = &mut token => break response,
            event = next(&mut client) => panic!("unexpected event {:?}", event),
        }
    };
    assert!(matches!(response, Ok(iq::IqResponse::Result(None))));

    // Pending requests fail when the channel goes away.
    let token = client.send_iq(
        None,
        IqRequest::Get(Element::builder("ping", "urn:xmpp:ping").build()),
    );
    client.disconnect();
    assert!(matches!(token.await, Err(IqFailure::ChannelUnavailable)));
    let _server = server.await.unwrap();
}

#[tokio::test]
async fn authentication_failure_is_reported_once() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let mut client = client(Arc::new(Localhost), Pipes::with(ours));
    let server = tokio::spawn(async move {
        let mut server = Server::new(theirs);
        server.open(PLAIN_FEATURES).await;
        server.expect("</auth>").await;
        server
            .send("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>")
            .await;
        server
    });

    client.connect(options());
    assert!(matches!(
        next(&mut client).await,
        Event::Disconnected(Some(ClientError::AuthenticationFailed))
    ));
    assert!(!client.is_active());
    let _server = server.await.unwrap();
}

#[tokio::test]
async fn unmatched_iq_response_is_dropped() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let mut client = client(Arc::new(Localhost), Pipes::with(ours));
    let server = tokio::spawn(async move {
        let mut server = Server::new(theirs);
        log_in(&mut server).await;
        server
            .send("<iq type='result' from='example.org' id='bogus'/>")
            .await;
        server
    });

    client.connect(options());
    assert!(next(&mut client).await.is_connected());
    assert!(
        tokio::time::timeout(Duration::from_millis(500), client.next())
            .await
            .is_err()
    );
    let _server = server.await.unwrap();
}
