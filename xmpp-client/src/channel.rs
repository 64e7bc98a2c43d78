// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stanza routing over the current session

use std::io;

use log::{debug, warn};
use tokio::sync::mpsc;
use xmpp_parsers::{message::Message, presence::Presence};

use crate::event::{ensure_element_id, Stanza};
use crate::minidom::Element;
use crate::observer::{Observers, Subscription};
use crate::session::SessionCommand;

/// Availability and observers of the stanza flow.
///
/// The channel is backed by at most one session at a time. It is available
/// from the moment that session is established until it starts finishing
/// or ends.
pub struct StanzaChannel {
    outbound: Option<mpsc::UnboundedSender<SessionCommand>>,
    available: bool,
    encrypted: bool,
    sm_enabled: bool,
    on_message: Observers<Message>,
    on_presence: Observers<Presence>,
    on_stanza_acked: Observers<Stanza>,
    on_available_changed: Observers<bool>,
}

impl StanzaChannel {
    pub(crate) fn new() -> Self {
        StanzaChannel {
            outbound: None,
            available: false,
            encrypted: false,
            sm_enabled: false,
            on_message: Observers::new(),
            on_presence: Observers::new(),
            on_stanza_acked: Observers::new(),
            on_available_changed: Observers::new(),
        }
    }

    /// Can stanzas be sent right now?
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Is the current session encrypted with TLS?
    pub fn is_stream_encrypted(&self) -> bool {
        self.available && self.encrypted
    }

    /// Are stanza acknowledgements enabled on the current session?
    pub fn stream_management_enabled(&self) -> bool {
        self.available && self.sm_enabled
    }

    /// Call `callback` for every received message.
    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on_message.subscribe(callback)
    }

    /// Call `callback` for every received presence.
    pub fn on_presence<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Presence) + Send + Sync + 'static,
    {
        self.on_presence.subscribe(callback)
    }

    /// Call `callback` for every stanza the server acknowledged, in the
    /// order they were sent.
    pub fn on_stanza_acked<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Stanza) + Send + Sync + 'static,
    {
        self.on_stanza_acked.subscribe(callback)
    }

    /// Call `callback` whenever availability changes.
    pub fn on_available_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.on_available_changed.subscribe(callback)
    }

    /// Route outbound stanzas to a newly established session.
    pub(crate) fn attach(
        &mut self,
        outbound: mpsc::UnboundedSender<SessionCommand>,
        encrypted: bool,
        sm_enabled: bool,
    ) {
        self.outbound = Some(outbound);
        self.encrypted = encrypted;
        self.sm_enabled = sm_enabled;
        self.set_available(true);
    }

    /// Stop routing; returns whether the channel was available before.
    pub(crate) fn detach(&mut self) -> bool {
        let was_available = self.available;
        self.outbound = None;
        self.encrypted = false;
        self.sm_enabled = false;
        self.set_available(false);
        was_available
    }

    fn set_available(&mut self, available: bool) {
        if self.available != available {
            debug!("Stanza channel available: {}", available);
            self.available = available;
            self.on_available_changed.notify(&available);
        }
    }

    /// Send an element, giving it an `id` first if it is missing one.
    pub(crate) fn send(&self, mut element: Element) -> io::Result<()> {
        let outbound = match (&self.outbound, self.available) {
            (Some(outbound), true) => outbound,
            _ => {
                warn!("Trying to send <{}/> while unavailable", element.name());
                return Err(io::ErrorKind::NotConnected.into());
            }
        };
        ensure_element_id(&mut element);
        outbound
            .send(SessionCommand::Send(element))
            .map_err(|_| io::ErrorKind::NotConnected.into())
    }

    /// Send raw data, bypassing the stanza checks.
    pub(crate) fn send_raw(&self, data: String) -> io::Result<()> {
        match &self.outbound {
            Some(outbound) if self.available => outbound
                .send(SessionCommand::SendRaw(data))
                .map_err(|_| io::ErrorKind::NotConnected.into()),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Hand an inbound stanza to the message or presence observers.
    pub(crate) fn deliver(&self, stanza: &Stanza) {
        match stanza {
            Stanza::Message(message) => self.on_message.notify(message),
            Stanza::Presence(presence) => self.on_presence.notify(presence),
            Stanza::Iq(_) => (),
        }
    }

    pub(crate) fn acked(&self, stanza: &Stanza) {
        self.on_stanza_acked.notify(stanza);
    }
}

impl Default for StanzaChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StanzaChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("StanzaChannel")
            .field("available", &self.available)
            .field("encrypted", &self.encrypted)
            .field("sm_enabled", &self.sm_enabled)
            .finish_non_exhaustive()
    }
}
