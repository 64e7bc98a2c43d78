// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `XmppStream` provides encoding/decoding for XMPP

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::task::Context;

use futures::{
    sink::{Send, SinkExt},
    stream::StreamExt,
    task::Poll,
    Sink, Stream,
};
use log::warn;
use tokio_rustls::rustls;
use tokio_util::codec::{Framed, FramedParts};

use super::{ns, CodecError, Packet, XmppCodec};
use crate::connect::Connection;
use crate::error::{Error, SessionError, SessionStreamError, TlsError};
use crate::minidom::Element;

fn is_tls_failure(e: &io::Error) -> bool {
    e.get_ref()
        .map_or(false, |inner| inner.is::<rustls::Error>())
}

fn read_error(e: CodecError) -> Error {
    match e {
        CodecError::Io(e) if is_tls_failure(&e) => {
            SessionStreamError::Tls(TlsError::Protocol(e)).into()
        }
        CodecError::Io(e) => SessionStreamError::ConnectionRead(e).into(),
        CodecError::Parse(e) => SessionStreamError::Parse(e).into(),
    }
}

fn write_error(e: CodecError) -> Error {
    match e {
        CodecError::Io(e) if is_tls_failure(&e) => {
            SessionStreamError::Tls(TlsError::Protocol(e)).into()
        }
        CodecError::Io(e) => SessionStreamError::ConnectionWrite(e).into(),
        CodecError::Parse(e) => SessionStreamError::Parse(e).into(),
    }
}

fn disconnected() -> Error {
    SessionStreamError::ConnectionRead(io::ErrorKind::UnexpectedEof.into()).into()
}

/// Wraps a raw [`Connection`] to decode and encode XMPP packets.
///
/// Implements `Sink + Stream`
pub struct XmppStream {
    /// Domain the stream is addressed to
    pub domain: String,
    /// Codec instance
    pub stream: Framed<Connection, XmppCodec>,
    /// `<stream:features/>` the server announced after its stream header
    pub features: Element,
    /// Stream `id` attribute
    pub id: Option<String>,
}

impl XmppStream {
    /// Send a `<stream:stream>` start tag and wait for the server's header
    /// and features.
    pub async fn start(
        connection: Connection,
        codec: XmppCodec,
        domain: String,
    ) -> Result<Self, Error> {
        let mut stream = Framed::new(connection, codec);
        let attrs: BTreeMap<String, String> = [
            ("to".to_owned(), domain.clone()),
            ("version".to_owned(), "1.0".to_owned()),
        ]
        .into_iter()
        .collect();
        stream
            .send(Packet::StreamStart(attrs))
            .await
            .map_err(write_error)?;

        let stream_attrs = loop {
            match stream.next().await {
                Some(Ok(Packet::StreamStart(attrs))) => break attrs,
                Some(Ok(Packet::StreamEnd)) | None => return Err(disconnected()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(read_error(e)),
            }
        };
        let id = stream_attrs.get("id").cloned();

        loop {
            match stream.next().await {
                Some(Ok(Packet::Stanza(element))) if element.is("features", ns::STREAM) => {
                    return Ok(XmppStream {
                        domain,
                        stream,
                        features: element,
                        id,
                    });
                }
                Some(Ok(Packet::Stanza(element))) if element.is("error", ns::STREAM) => {
                    return Err(stream_error(element).into());
                }
                Some(Ok(Packet::Stanza(element))) => {
                    return Err(SessionError::UnexpectedElement(element.name().to_owned()).into());
                }
                Some(Ok(Packet::StreamEnd)) | None => return Err(disconnected()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(read_error(e)),
            }
        }
    }

    /// Unwraps the connection and the codec, to layer TLS or compression
    /// underneath.
    pub fn into_parts(self) -> (Connection, XmppCodec) {
        let FramedParts {
            io, codec, read_buf, ..
        } = self.stream.into_parts();
        if !read_buf.is_empty() {
            warn!(
                "Discarding {} bytes received before the stream was restarted",
                read_buf.len()
            );
        }
        (io, codec)
    }

    /// Re-run `start()` on the same connection
    pub async fn restart(self) -> Result<Self, Error> {
        let domain = self.domain.clone();
        let (connection, codec) = self.into_parts();
        Self::start(connection, codec, domain).await
    }

    /// Does the server announce the feature `name` in namespace `ns`?
    pub fn has_feature(&self, name: &str, ns: &str) -> bool {
        self.features.get_child(name, ns).is_some()
    }

    /// Convenience method
    pub fn send_stanza<E: Into<Element>>(&mut self, e: E) -> Send<'_, Self, Packet> {
        self.send(Packet::Stanza(e.into()))
    }

    /// Wait for the next top-level element.
    ///
    /// A `<stream:error/>` or the end of the stream is reported as error.
    pub async fn next_element(&mut self) -> Result<Element, Error> {
        loop {
            match self.next().await {
                Some(Ok(Packet::Stanza(element))) if element.is("error", ns::STREAM) => {
                    return Err(stream_error(element).into());
                }
                Some(Ok(Packet::Stanza(element))) => return Ok(element),
                Some(Ok(Packet::StreamEnd)) | None => return Err(disconnected()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
            }
        }
    }
}

/// Turn a `<stream:error/>` into an error naming its condition.
pub(crate) fn stream_error(element: Element) -> SessionError {
    let condition = element
        .children()
        .find(|child| child.ns() == ns::XMPP_STREAMS && child.name() != "text")
        .map(|child| child.name().to_owned())
        .unwrap_or_else(|| "undefined-condition".to_owned());
    SessionError::StreamError(condition)
}

/// Proxy to self.stream
impl Sink<Packet> for XmppStream {
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.stream)
            .poll_ready(cx)
            .map_err(write_error)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Packet) -> Result<(), Self::Error> {
        Pin::new(&mut self.stream)
            .start_send(item)
            .map_err(write_error)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.stream)
            .poll_flush(cx)
            .map_err(write_error)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.stream)
            .poll_close(cx)
            .map_err(write_error)
    }
}

/// Proxy to self.stream
impl Stream for XmppStream {
    type Item = Result<Packet, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream)
            .poll_next(cx)
            .map(|result| result.map(|result| result.map_err(read_error)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='example.org' version='1.0'>";

    #[tokio::test]
    async fn start_reads_header_and_features() {
        let (client, mut server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            XmppStream::start(Box::new(client), XmppCodec::new(), "example.org".into()).await
        });
        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        let header = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(header.contains("to='example.org'"));
        assert!(header.contains("version='1.0'"));
        server.write_all(HEADER.as_bytes()).await.unwrap();
        server
            .write_all(b"<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>")
            .await
            .unwrap();

        let stream = task.await.unwrap().unwrap();
        assert_eq!(stream.id.as_deref(), Some("s1"));
        assert!(stream.has_feature("bind", ns::BIND));
        assert!(!stream.has_feature("starttls", ns::TLS));
    }

    #[tokio::test]
    async fn stream_error_instead_of_features() {
        let (client, mut server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            XmppStream::start(Box::new(client), XmppCodec::new(), "example.org".into()).await
        });
        let mut buf = vec![0u8; 1024];
        let _ = server.read(&mut buf).await.unwrap();
        server.write_all(HEADER.as_bytes()).await.unwrap();
        server
            .write_all(b"<stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>")
            .await
            .unwrap();

        match task.await.unwrap() {
            Err(Error::Session(SessionError::StreamError(condition))) => {
                assert_eq!(condition, "host-unknown")
            }
            other => panic!("unexpected result: {:?}", other.map(|s| s.id)),
        }
    }

    #[tokio::test]
    async fn eof_before_header_is_a_read_error() {
        let (client, server) = tokio::io::duplex(4096);
        drop(server);
        let result =
            XmppStream::start(Box::new(client), XmppCodec::new(), "example.org".into()).await;
        assert!(matches!(
            result,
            Err(Error::Stream(
                SessionStreamError::ConnectionWrite(_) | SessionStreamError::ConnectionRead(_)
            ))
        ));
    }

    #[tokio::test]
    async fn garbage_is_a_parse_error() {
        let (client, mut server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            XmppStream::start(Box::new(client), XmppCodec::new(), "example.org".into()).await
        });
        let mut buf = vec![0u8; 1024];
        let _ = server.read(&mut buf).await.unwrap();
        server.write_all(HEADER.as_bytes()).await.unwrap();
        server.write_all(b"<a></b>").await.unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(Error::Stream(SessionStreamError::Parse(_)))
        ));
    }
}
