// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use xmpp_parsers::{message::Message, presence::Presence};

use crate::channel::StanzaChannel;
use crate::connect::proxy::{EnvironmentProxyProvider, ProxyProvider};
use crate::connect::{
    dns::default_resolver, Connection, ConnectionFactory, Connector, ConnectorHandle, Resolver,
    TcpConnectionFactory,
};
use crate::credentials::{CredentialStore, Password};
use crate::error::{ClientError, ConnectorError, Error};
use crate::event::{Event, Stanza};
use crate::jid::Jid;
use crate::observer::{Observers, Subscription};
use crate::options::ClientOptions;
use crate::proto::{TraceHook, Traffic, XmppCodec};
use crate::session::{EventSink, SessionConfig, SessionEvent, SessionHandle, SessionOptions};
use crate::tls::{CertificateTrustChecker, ClientCertificate, TlsContext};

pub mod iq;
mod plan;
mod stream;

use iq::{IqFailure, IqRequest, IqResponseToken, IqRouter};
use plan::ConnectionPlan;

/// Completion reported by a background task, tagged with the generation of
/// the connection attempt it belongs to.
enum Internal {
    Connected(Result<Connection, ConnectorError>),
    Failed(Error),
    Session(SessionEvent),
    Traffic(Traffic, Vec<u8>),
}

type Tagged = (u64, Internal);

/// XMPP client connection and state
///
/// This implements the `futures` crate's [`Stream`](#impl-Stream) to receive
/// connection state changes as well as stanzas received via the stream. All
/// observer callbacks run from within that `Stream`, on the task polling
/// the client.
///
/// Nothing happens until [`connect`](Client::connect) is called.
pub struct Client {
    jid: Jid,
    bound_jid: Option<Jid>,
    options: ClientOptions,
    credentials: CredentialStore,
    certificate: Option<ClientCertificate>,
    trust_checker: Option<Arc<dyn CertificateTrustChecker>>,
    resolver: Arc<dyn Resolver>,
    direct: Arc<dyn ConnectionFactory>,
    proxies: Arc<dyn ProxyProvider>,
    generation: u64,
    connector: Option<ConnectorHandle>,
    session: Option<SessionHandle>,
    disconnect_requested: bool,
    channel: StanzaChannel,
    iq_router: IqRouter,
    data_read: Observers<Vec<u8>>,
    data_written: Observers<Vec<u8>>,
    tx: mpsc::UnboundedSender<Tagged>,
    rx: mpsc::UnboundedReceiver<Tagged>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("jid", &self.jid)
            .field("bound_jid", &self.bound_jid)
            .field("generation", &self.generation)
            .field("connector", &self.connector)
            .field("session", &self.session)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Client for `jid`, reaching the network through TCP, the system DNS
    /// and the proxies named in the environment.
    ///
    /// An empty password makes the client ask for one with
    /// [`Event::NeedCredentials`] when the server needs it.
    pub fn new<J: Into<Jid>, P: Into<Password>>(jid: J, password: P) -> Self {
        Self::new_with_network(
            jid,
            password,
            default_resolver(),
            Arc::new(TcpConnectionFactory),
            Arc::new(EnvironmentProxyProvider),
        )
    }

    /// Client using the given name resolution, raw connections and proxy
    /// discovery.
    pub fn new_with_network<J: Into<Jid>, P: Into<Password>>(
        jid: J,
        password: P,
        resolver: Arc<dyn Resolver>,
        direct: Arc<dyn ConnectionFactory>,
        proxies: Arc<dyn ProxyProvider>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Client {
            jid: jid.into(),
            bound_jid: None,
            options: ClientOptions::default(),
            credentials: CredentialStore::new(Some(password.into())),
            certificate: None,
            trust_checker: None,
            resolver,
            direct,
            proxies,
            generation: 0,
            connector: None,
            session: None,
            disconnect_requested: false,
            channel: StanzaChannel::new(),
            iq_router: IqRouter::new(),
            data_read: Observers::new(),
            data_written: Observers::new(),
            tx,
            rx,
        }
    }

    /// Start connecting with `options`.
    ///
    /// Any previous connection attempt or session is torn down first. The
    /// outcome is reported through the [`Stream`](#impl-Stream) as
    /// [`Event::Connected`] or [`Event::Disconnected`].
    pub fn connect(&mut self, options: ClientOptions) {
        if self.is_active() {
            warn!("Connecting while a previous connection is still active, resetting it");
        }
        self.force_reset();
        self.credentials.set_forget(options.forget_password);
        self.options = options;
        self.disconnect_requested = false;

        if let Some(certificate) = &self.certificate {
            if let Err(e) = certificate.load() {
                warn!("Cannot load client certificate: {}", e);
                self.enqueue(Internal::Failed(Error::ClientCertificateLoad(e)));
                return;
            }
        }

        let domain = self.jid.domain().to_string();
        let plan = ConnectionPlan::build(&domain, &self.options, self.proxies.as_ref());
        let factories = plan.factories(
            &self.resolver,
            &self.direct,
            self.options.http_traffic_filter.as_ref(),
        );
        let mut connector = Connector::new(plan.locator, self.resolver.clone(), factories);
        connector.set_timeout(self.options.connect_timeout);

        info!("Connecting to {}", domain);
        let tx = self.tx.clone();
        let generation = self.generation;
        self.connector = Some(connector.start(move |result| {
            let _ = tx.send((generation, Internal::Connected(result)));
        }));
    }

    /// Close the connection.
    ///
    /// A session is finished gracefully; a pending connection attempt is
    /// cancelled. Does nothing when already disconnected. The resulting
    /// [`Event::Disconnected`] carries no error.
    pub fn disconnect(&mut self) {
        if let Some(session) = &mut self.session {
            if !session.is_finishing() {
                self.disconnect_requested = true;
                session.finish();
                self.channel_unavailable();
            }
        } else if let Some(connector) = &self.connector {
            self.disconnect_requested = true;
            connector.stop();
        }
    }

    /// Is a connection attempt running or a session alive?
    pub fn is_active(&self) -> bool {
        self.connector.is_some()
            || self
                .session
                .as_ref()
                .map_or(false, |session| !session.is_finished())
    }

    /// Can stanzas be sent?
    pub fn is_available(&self) -> bool {
        self.channel.is_available()
    }

    /// Drop the connector and session without any further event.
    ///
    /// Nothing queued by them is delivered afterwards.
    pub fn force_reset(&mut self) {
        if self.connector.take().is_some() {
            debug!("Dropping connector");
        }
        if self.session.take().is_some() {
            debug!("Dropping session");
        }
        self.channel_unavailable();
        self.bound_jid = None;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Tear everything down now, and wipe the stored password if it is to
    /// be forgotten.
    pub fn shutdown(&mut self) {
        self.force_reset();
        self.credentials.purge();
    }

    /// Answer [`Event::NeedCredentials`].
    pub fn send_credentials<P: Into<Password>>(&mut self, password: P) {
        match &self.session {
            Some(session) => session.send_credentials(password.into()),
            None => debug!("Dropping credentials, there is no session"),
        }
    }

    /// Send a stanza, assigning an `id` if it has none.
    pub fn send_stanza(&mut self, stanza: Stanza) -> io::Result<()> {
        self.channel.send(stanza.into())
    }

    /// Send a message.
    pub fn send_message(&mut self, message: Message) -> io::Result<()> {
        self.send_stanza(Stanza::Message(message))
    }

    /// Send a presence.
    pub fn send_presence(&mut self, presence: Presence) -> io::Result<()> {
        self.send_stanza(Stanza::Presence(presence))
    }

    /// Send an IQ request to `to` (the account's server when `None`) and
    /// get a handle for its response.
    pub fn send_iq(&mut self, to: Option<Jid>, request: IqRequest) -> IqResponseToken {
        let (iq, token) = self.iq_router.allocate_iq_handle(None, to, request);
        match self.channel.send(iq.into()) {
            Ok(()) => token,
            Err(e) => {
                drop(token);
                IqResponseToken::failed(IqFailure::SendError(e))
            }
        }
    }

    /// Send raw data, as is.
    pub fn send_data(&mut self, data: String) -> io::Result<()> {
        self.channel.send_raw(data)
    }

    /// Present `certificate` in the TLS handshake of the next connection.
    pub fn set_certificate(&mut self, certificate: Option<ClientCertificate>) {
        self.certificate = certificate;
    }

    /// Consult `checker` for server certificates that fail verification on
    /// the next connection.
    pub fn set_certificate_trust_checker(
        &mut self,
        checker: Option<Arc<dyn CertificateTrustChecker>>,
    ) {
        self.trust_checker = checker;
    }

    /// The bound JID once connected, the configured one otherwise
    pub fn jid(&self) -> &Jid {
        self.bound_jid.as_ref().unwrap_or(&self.jid)
    }

    /// Options of the current or last connection attempt
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Is the session encrypted?
    pub fn is_stream_encrypted(&self) -> bool {
        self.channel.is_stream_encrypted()
    }

    /// Are stanza acknowledgements enabled?
    pub fn stream_management_enabled(&self) -> bool {
        self.channel.stream_management_enabled()
    }

    /// Availability and stanza observers
    pub fn channel(&self) -> &StanzaChannel {
        &self.channel
    }

    /// Observe the XML received, after decryption and decompression.
    pub fn on_data_read<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.data_read.subscribe(move |data: &Vec<u8>| callback(data))
    }

    /// Observe the XML sent, before compression and encryption.
    pub fn on_data_written<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.data_written.subscribe(move |data: &Vec<u8>| callback(data))
    }

    fn enqueue(&self, internal: Internal) {
        let _ = self.tx.send((self.generation, internal));
    }

    fn channel_unavailable(&mut self) {
        if self.channel.detach() {
            debug!("Stanza channel closed");
        }
        self.iq_router.fail_all();
    }

    fn start_session(&mut self, connection: Connection) {
        let generation = self.generation;
        let tx = self.tx.clone();
        let trace: TraceHook = Arc::new(move |direction, data: &[u8]| {
            let _ = tx.send((generation, Internal::Traffic(direction, data.to_vec())));
        });
        let tx = self.tx.clone();
        let events: EventSink = Arc::new(move |event| {
            let _ = tx.send((generation, Internal::Session(event)));
        });
        let config = SessionConfig {
            jid: self.jid.clone(),
            options: SessionOptions {
                use_tls: self.options.use_tls,
                use_compression: self.options.use_stream_compression,
                allow_plain_without_tls: self.options.allow_plain_without_tls,
                single_sign_on: self.options.single_sign_on,
                use_acks: self.options.use_acks,
            },
            tls: TlsContext::new(self.trust_checker.clone(), self.certificate.clone()),
        };
        self.session = Some(SessionHandle::start(
            config,
            connection,
            XmppCodec::new().with_trace(trace),
            events,
        ));
    }

    fn disconnected(&mut self, error: Option<Error>) -> Event {
        self.credentials.purge();
        let error = match error {
            _ if self.disconnect_requested => None,
            Some(e) => {
                info!("Disconnected: {}", e);
                Some(ClientError::from(&e))
            }
            None => None,
        };
        self.disconnect_requested = false;
        Event::Disconnected(error)
    }

    /// Apply a completion from a background task, possibly producing an
    /// event for the application.
    fn process(&mut self, internal: Internal) -> Option<Event> {
        match internal {
            Internal::Connected(Ok(connection)) => {
                self.connector = None;
                self.start_session(connection);
                None
            }
            Internal::Connected(Err(e)) => {
                self.connector = None;
                Some(self.disconnected(Some(e.into())))
            }
            Internal::Failed(e) => Some(self.disconnected(Some(e))),
            Internal::Traffic(Traffic::Read, data) => {
                self.data_read.notify(&data);
                None
            }
            Internal::Traffic(Traffic::Written, data) => {
                self.data_written.notify(&data);
                None
            }
            Internal::Session(event) => self.process_session_event(event),
        }
    }

    fn process_session_event(&mut self, event: SessionEvent) -> Option<Event> {
        match event {
            SessionEvent::NeedCredentials => match (self.credentials.provide(), &self.session) {
                (Some(password), Some(session)) => {
                    session.send_credentials(password);
                    None
                }
                _ => Some(Event::NeedCredentials),
            },
            SessionEvent::Established {
                bound_jid,
                sm_enabled,
                encrypted,
            } => {
                self.credentials.purge();
                let session = self.session.as_ref()?;
                self.channel.attach(session.commands(), encrypted, sm_enabled);
                self.bound_jid = Some(bound_jid.clone());
                Some(Event::Connected { bound_jid })
            }
            SessionEvent::Stanza(element) => {
                let stanza = match Stanza::try_from(element) {
                    Ok(stanza) => stanza,
                    Err(e) => {
                        warn!("Ignoring inbound element: {}", e);
                        return None;
                    }
                };
                let stanza = match stanza {
                    Stanza::Iq(iq) => match self.iq_router.handle_iq(iq, self.jid()) {
                        ControlFlow::Break(()) => return None,
                        ControlFlow::Continue(iq) => Stanza::Iq(iq),
                    },
                    other => other,
                };
                self.channel.deliver(&stanza);
                Some(Event::Stanza(stanza))
            }
            SessionEvent::Acked(element) => match Stanza::try_from(element) {
                Ok(stanza) => {
                    self.channel.acked(&stanza);
                    Some(Event::StanzaAcked(stanza))
                }
                Err(e) => {
                    warn!("Acknowledged element is not a stanza: {}", e);
                    None
                }
            },
            SessionEvent::Finished(error) => {
                self.session = None;
                self.channel_unavailable();
                self.bound_jid = None;
                Some(self.disconnected(error))
            }
        }
    }

    fn accept(&mut self, (generation, internal): Tagged) -> Option<Event> {
        if generation != self.generation {
            trace!("Dropping completion from a previous connection attempt");
            return None;
        }
        self.process(internal)
    }
}

#[cfg(test)]
mod tests;
