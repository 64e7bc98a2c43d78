// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The client session: stream negotiation and the established stream
//!
//! A [`SessionHandle`] owns a background task that takes a raw connection
//! through STARTTLS, compression, SASL, resource binding and stream
//! management, then shuttles stanzas both ways until either side closes the
//! stream. Everything the task learns is reported through an [`EventSink`];
//! it is controlled through [`SessionCommand`]s.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connect::Connection;
use crate::credentials::Password;
use crate::error::{Error, SessionError, TlsError};
use crate::event::is_stanza;
use crate::jid::Jid;
use crate::minidom::Element;
use crate::options::UseTls;
use crate::proto::compression::ZlibStream;
use crate::proto::{ns, Packet, XmppCodec, XmppStream};
use crate::tls::TlsContext;
use xmpp_parsers::sm;

mod auth;
mod bind;
mod stream_management;

use auth::AuthPolicy;
use stream_management::SmState;

/// How long to wait for the server's `</stream:stream>` after sending ours
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Negotiation state, in order of progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the server's stream header
    StreamStart,
    /// Looking at `<stream:features/>`
    Negotiating,
    /// STARTTLS in progress
    Tls,
    /// Setting up stream compression
    Compressing,
    /// Waiting for the application to supply a password
    WaitingForCredentials,
    /// SASL exchange in progress
    Authenticating,
    /// Binding a resource
    BindingResource,
    /// Enabling acknowledgements
    EnablingStreamManagement,
    /// Legacy session establishment
    StartingSession,
    /// Stanzas flow
    Established,
    /// Closing the stream
    Finishing,
    /// Done
    Finished,
}

/// Negotiation settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionOptions {
    pub use_tls: UseTls,
    pub use_compression: bool,
    pub allow_plain_without_tls: bool,
    pub single_sign_on: bool,
    pub use_acks: bool,
}

/// Requests from the client to the session task
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Send a stanza, or any other element
    Send(Element),
    /// Send raw data
    SendRaw(String),
    /// Close the stream
    Finish,
}

/// What the session task reports back
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// A password is needed to continue authenticating
    NeedCredentials,
    /// Negotiation is over
    Established {
        bound_jid: Jid,
        sm_enabled: bool,
        encrypted: bool,
    },
    /// A stanza arrived
    Stanza(Element),
    /// The server acknowledged a stanza we sent
    Acked(Element),
    /// The task has ended, with the reason unless it was a clean close
    Finished(Option<Error>),
}

/// Receives [`SessionEvent`]s, from the session task
pub(crate) type EventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Everything a session needs besides its connection
pub(crate) struct SessionConfig {
    pub jid: Jid,
    pub options: SessionOptions,
    pub tls: TlsContext,
}

/// Control of a running session task
///
/// Dropping the handle aborts the task.
pub(crate) struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    credentials: mpsc::UnboundedSender<Password>,
    task: JoinHandle<()>,
    finishing: bool,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("finishing", &self.finishing)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl SessionHandle {
    /// Spawn the session task on `connection`.
    pub fn start(
        config: SessionConfig,
        connection: Connection,
        codec: XmppCodec,
        events: EventSink,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (credentials, credentials_rx) = mpsc::unbounded_channel();
        let session = Session {
            config,
            events,
            credentials: credentials_rx,
            state: SessionState::StreamStart,
            encrypted: false,
        };
        let task = tokio::spawn(session.run(connection, codec, commands_rx));
        SessionHandle {
            commands,
            credentials,
            task,
            finishing: false,
        }
    }

    /// A sender for commands, for routing stanzas from elsewhere.
    pub fn commands(&self) -> mpsc::UnboundedSender<SessionCommand> {
        self.commands.clone()
    }

    /// Answer [`SessionEvent::NeedCredentials`].
    pub fn send_credentials(&self, password: Password) {
        if self.credentials.send(password).is_err() {
            debug!("Dropping credentials for a session that has ended");
        }
    }

    /// Ask the session to close the stream gracefully.
    pub fn finish(&mut self) {
        if !self.finishing {
            self.finishing = true;
            let _ = self.commands.send(SessionCommand::Finish);
        }
    }

    /// Has [`finish`](Self::finish) been called?
    pub fn is_finishing(&self) -> bool {
        self.finishing
    }

    /// Has the task ended?
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Established {
    stream: XmppStream,
    sm: Option<SmState>,
}

struct Session {
    config: SessionConfig,
    events: EventSink,
    credentials: mpsc::UnboundedReceiver<Password>,
    state: SessionState,
    encrypted: bool,
}

impl Session {
    fn set_state(&mut self, state: SessionState) {
        trace!("Session state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn domain(&self) -> String {
        self.config.jid.domain().to_string()
    }

    async fn run(
        mut self,
        connection: Connection,
        codec: XmppCodec,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        let result = self.run_inner(connection, codec, &mut commands).await;
        self.set_state(SessionState::Finished);
        if let Err(e) = &result {
            info!("Session ended: {}", e);
        }
        (self.events)(SessionEvent::Finished(result.err()));
    }

    async fn run_inner(
        &mut self,
        connection: Connection,
        codec: XmppCodec,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<(), Error> {
        let established = {
            let negotiation = self.negotiate(connection, codec);
            tokio::pin!(negotiation);
            loop {
                tokio::select! {
                    result = &mut negotiation => break result?,
                    command = commands.recv() => match command {
                        Some(SessionCommand::Finish) | None => {
                            debug!("Session finished during negotiation");
                            return Ok(());
                        }
                        Some(other) => {
                            warn!("Dropping {:?} sent before the session was established", other)
                        }
                    },
                }
            }
        };
        self.serve(established, commands).await
    }

    async fn negotiate(
        &mut self,
        connection: Connection,
        codec: XmppCodec,
    ) -> Result<Established, Error> {
        let domain = self.domain();
        let options = self.config.options;

        let mut stream = XmppStream::start(connection, codec, domain.clone()).await?;
        self.set_state(SessionState::Negotiating);

        if options.use_tls != UseTls::Never && stream.has_feature("starttls", ns::TLS) {
            self.set_state(SessionState::Tls);
            stream = self.starttls(stream).await?;
            self.encrypted = true;
            self.set_state(SessionState::Negotiating);
        } else if options.use_tls == UseTls::Required {
            return Err(SessionError::TlsNotAvailable.into());
        }

        if options.use_compression && offers_zlib(&stream.features) {
            self.set_state(SessionState::Compressing);
            stream = compress(stream).await?;
            self.set_state(SessionState::Negotiating);
        }

        let offered = auth::offered_mechanisms(&stream.features);
        if offered.is_empty() {
            debug!("Server offers no SASL mechanisms, skipping authentication");
        } else {
            let choice = auth::select_mechanism(
                &offered,
                AuthPolicy {
                    single_sign_on: options.single_sign_on,
                    encrypted: self.encrypted,
                    allow_plain_without_tls: options.allow_plain_without_tls,
                    has_username: self.config.jid.node().is_some(),
                },
            )?;
            let mut password = if choice.needs_password() {
                Some(self.obtain_password().await?)
            } else {
                None
            };
            self.set_state(SessionState::Authenticating);
            let username = self
                .config
                .jid
                .node()
                .map(|node| node.to_string())
                .unwrap_or_default();
            let result =
                auth::authenticate(&mut stream, choice, &username, password.as_mut()).await;
            drop(password);
            result?;
            stream = stream.restart().await?;
        }

        let mut bound_jid = self.config.jid.clone();
        if stream.has_feature("bind", ns::BIND) {
            self.set_state(SessionState::BindingResource);
            bound_jid = bind::bind(&mut stream, &self.config.jid).await?;
        }

        let mut sm = None;
        if options.use_acks && stream.has_feature("sm", ns::SM) {
            self.set_state(SessionState::EnablingStreamManagement);
            sm = enable_stream_management(&mut stream).await?;
        }

        if bind::needs_session(&stream.features) {
            self.set_state(SessionState::StartingSession);
            bind::start_session(&mut stream).await?;
        }

        self.set_state(SessionState::Established);
        info!("Session established as {}", bound_jid);
        (self.events)(SessionEvent::Established {
            bound_jid,
            sm_enabled: sm.is_some(),
            encrypted: self.encrypted,
        });
        Ok(Established { stream, sm })
    }

    async fn starttls(&mut self, mut stream: XmppStream) -> Result<XmppStream, Error> {
        stream
            .send(Packet::Stanza(Element::builder("starttls", ns::TLS).build()))
            .await?;
        let element = stream.next_element().await?;
        if element.is("failure", ns::TLS) {
            return Err(TlsError::Protocol(io::Error::new(
                io::ErrorKind::Other,
                "server refused STARTTLS",
            ))
            .into());
        } else if !element.is("proceed", ns::TLS) {
            return Err(SessionError::UnexpectedElement(element.name().to_owned()).into());
        }
        let domain = stream.domain.clone();
        let (connection, codec) = stream.into_parts();
        let connection = self.config.tls.connect(&domain, connection).await?;
        XmppStream::start(connection, codec, domain).await
    }

    async fn obtain_password(&mut self) -> Result<Password, Error> {
        self.set_state(SessionState::WaitingForCredentials);
        (self.events)(SessionEvent::NeedCredentials);
        self.credentials
            .recv()
            .await
            .ok_or_else(|| SessionError::AuthenticationFailed(None).into())
    }

    async fn serve(
        &mut self,
        established: Established,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<(), Error> {
        let Established { mut stream, mut sm } = established;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Send(element)) => {
                        let track = sm.is_some() && is_stanza(&element);
                        stream.send(Packet::Stanza(element.clone())).await?;
                        if let (true, Some(sm)) = (track, sm.as_mut()) {
                            sm.enqueue(element);
                            stream.send_stanza(sm::R).await?;
                        }
                    }
                    Some(SessionCommand::SendRaw(data)) => {
                        stream.send(Packet::Text(data)).await?;
                    }
                    Some(SessionCommand::Finish) | None => {
                        return self.finish(stream).await;
                    }
                },
                packet = stream.next() => match packet {
                    Some(Ok(Packet::Stanza(element))) => {
                        self.handle_element(&mut stream, &mut sm, element).await?;
                    }
                    Some(Ok(Packet::StreamEnd)) | None => {
                        info!("Server closed the stream");
                        let _ = stream.send(Packet::StreamEnd).await;
                        let _ = stream.close().await;
                        return Ok(());
                    }
                    Some(Ok(_)) => (),
                    Some(Err(e)) => return Err(e),
                },
            }
        }
    }

    async fn handle_element(
        &mut self,
        stream: &mut XmppStream,
        sm: &mut Option<SmState>,
        element: Element,
    ) -> Result<(), Error> {
        if element.ns() == ns::SM {
            let Some(sm) = sm.as_mut() else {
                return Err(SessionError::UnexpectedElement(element.name().to_owned()).into());
            };
            if sm::R::try_from(element.clone()).is_ok() {
                stream.send_stanza(sm::A::new(sm.inbound_ctr())).await?;
            } else if element.name() == "a" {
                let answer = sm::A::try_from(element).map_err(|e| {
                    SessionError::StreamManagement(format!("invalid acknowledgement: {}", e))
                })?;
                let acked = sm
                    .remote_acked(answer.h)
                    .map_err(|e| SessionError::StreamManagement(e.to_string()))?
                    .collect::<Vec<_>>();
                for stanza in acked {
                    (self.events)(SessionEvent::Acked(stanza));
                }
            } else {
                debug!("Ignoring stream management element <{}/>", element.name());
            }
            Ok(())
        } else if element.is("error", ns::STREAM) {
            Err(crate::proto::stream_error(element).into())
        } else if is_stanza(&element) {
            if let Some(sm) = sm.as_mut() {
                sm.handled();
            }
            (self.events)(SessionEvent::Stanza(element));
            Ok(())
        } else {
            Err(SessionError::UnexpectedElement(element.name().to_owned()).into())
        }
    }

    async fn finish(&mut self, mut stream: XmppStream) -> Result<(), Error> {
        self.set_state(SessionState::Finishing);
        stream.send(Packet::StreamEnd).await?;
        let closed = tokio::time::timeout(CLOSE_TIMEOUT, async {
            loop {
                match stream.next().await {
                    Some(Ok(Packet::StreamEnd)) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => (),
                }
            }
        })
        .await;
        if closed.is_err() {
            debug!("Server did not close the stream within {:?}", CLOSE_TIMEOUT);
        }
        let _ = stream.close().await;
        Ok(())
    }
}

fn offers_zlib(features: &Element) -> bool {
    features
        .get_child("compression", ns::COMPRESS_FEATURE)
        .map_or(false, |compression| {
            compression
                .children()
                .any(|method| method.is("method", ns::COMPRESS_FEATURE) && method.text() == "zlib")
        })
}

async fn compress(mut stream: XmppStream) -> Result<XmppStream, Error> {
    stream
        .send(Packet::Stanza(
            Element::builder("compress", ns::COMPRESS)
                .append(Element::builder("method", ns::COMPRESS).append("zlib"))
                .build(),
        ))
        .await?;
    let element = stream.next_element().await?;
    if !element.is("compressed", ns::COMPRESS) {
        debug!("Compression refused with <{}/>", element.name());
        return Err(SessionError::CompressionFailed.into());
    }
    let domain = stream.domain.clone();
    let (connection, codec) = stream.into_parts();
    let connection: Connection = Box::new(ZlibStream::new(connection));
    XmppStream::start(connection, codec, domain).await
}

async fn enable_stream_management(stream: &mut XmppStream) -> Result<Option<SmState>, Error> {
    stream.send_stanza(sm::Enable::new()).await?;
    let element = stream.next_element().await?;
    if let Ok(enabled) = sm::Enabled::try_from(element.clone()) {
        debug!("Stream management enabled: {:?}", enabled);
        Ok(Some(SmState::new()))
    } else if let Ok(failed) = sm::Failed::try_from(element.clone()) {
        info!("Server refused to enable stream management: {:?}", failed.error);
        Ok(None)
    } else {
        Err(SessionError::UnexpectedElement(element.name().to_owned()).into())
    }
}
