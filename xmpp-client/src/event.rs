// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;

use rand::{thread_rng, Rng};
use xmpp_parsers::{iq::Iq, jid::Jid, message::Message, presence::Presence};

use crate::error::ClientError;
use crate::minidom::Element;
use crate::proto::ns;

pub(crate) fn make_id() -> String {
    let id: u64 = thread_rng().gen();
    format!("{}", id)
}

/// Assign a random `id` attribute to an element which has none.
pub(crate) fn ensure_element_id(element: &mut Element) {
    if element.attr("id").map_or(true, str::is_empty) {
        element.set_attr("id", make_id());
    }
}

/// A stanza sent/received over the stream.
#[derive(Debug, Clone)]
pub enum Stanza {
    /// IQ stanza
    Iq(Iq),

    /// Message stanza
    Message(Message),

    /// Presence stanza
    Presence(Presence),
}

/// Reason an element is not a [`Stanza`]
#[derive(Debug)]
pub enum InvalidStanza {
    /// Not a `jabber:client` message, presence or iq
    NotAStanza(String),
    /// Right name, wrong content
    Malformed(String),
}

impl fmt::Display for InvalidStanza {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InvalidStanza::NotAStanza(name) => write!(f, "<{}/> is not a stanza", name),
            InvalidStanza::Malformed(e) => write!(f, "malformed stanza: {}", e),
        }
    }
}

impl std::error::Error for InvalidStanza {}

/// Is this element one of the three stanza kinds?
pub(crate) fn is_stanza(element: &Element) -> bool {
    element.ns() == ns::JABBER_CLIENT
        && matches!(element.name(), "message" | "presence" | "iq")
}

impl TryFrom<Element> for Stanza {
    type Error = InvalidStanza;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        if element.ns() != ns::JABBER_CLIENT {
            return Err(InvalidStanza::NotAStanza(element.name().to_owned()));
        }
        let malformed = |e: &dyn fmt::Display| InvalidStanza::Malformed(e.to_string());
        match element.name() {
            "message" => Message::try_from(element)
                .map(Stanza::Message)
                .map_err(|e| malformed(&e)),
            "presence" => Presence::try_from(element)
                .map(Stanza::Presence)
                .map_err(|e| malformed(&e)),
            "iq" => Iq::try_from(element)
                .map(Stanza::Iq)
                .map_err(|e| malformed(&e)),
            other => Err(InvalidStanza::NotAStanza(other.to_owned())),
        }
    }
}

impl From<Stanza> for Element {
    fn from(other: Stanza) -> Self {
        match other {
            Stanza::Iq(st) => st.into(),
            Stanza::Message(st) => st.into(),
            Stanza::Presence(st) => st.into(),
        }
    }
}

impl From<Iq> for Stanza {
    fn from(other: Iq) -> Self {
        Self::Iq(other)
    }
}

impl From<Presence> for Stanza {
    fn from(other: Presence) -> Self {
        Self::Presence(other)
    }
}

impl From<Message> for Stanza {
    fn from(other: Message) -> Self {
        Self::Message(other)
    }
}

impl TryFrom<Stanza> for Message {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Message(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Presence {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Presence(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Iq {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Iq(st) => Ok(st),
            other => Err(other),
        }
    }
}

/// High-level event on the Stream implemented by [`Client`](crate::Client)
#[derive(Debug)]
pub enum Event {
    /// Stream is connected, authenticated and bound
    Connected {
        /// Server-set Jabber-Id for your session
        ///
        /// This may turn out to be a different JID resource than
        /// expected, so use this one instead of the JID with which
        /// the connection was setup.
        bound_jid: Jid,
    },
    /// The connection attempt or the session ended.
    ///
    /// `None` means the disconnect was requested by the application.
    Disconnected(Option<ClientError>),
    /// The session waits for [`Client::send_credentials`](crate::Client::send_credentials)
    NeedCredentials,
    /// Received stanza
    Stanza(Stanza),
    /// The server acknowledged one of our stanzas
    StanzaAcked(Stanza),
}

impl Event {
    /// `Connected` event?
    pub fn is_connected(&self) -> bool {
        matches!(self, Event::Connected { .. })
    }

    /// Get the server-assigned JID for the `Connected` event
    pub fn get_jid(&self) -> Option<&Jid> {
        match *self {
            Event::Connected { ref bound_jid } => Some(bound_jid),
            _ => None,
        }
    }

    /// If this is a `Stanza` event, get its data
    pub fn as_stanza(&self) -> Option<&Stanza> {
        match *self {
            Event::Stanza(ref stanza) => Some(stanza),
            _ => None,
        }
    }

    /// If this is a `Stanza` event, unwrap into its data
    pub fn into_stanza(self) -> Option<Stanza> {
        match self {
            Event::Stanza(stanza) => Some(stanza),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_on_element_name() {
        let element: Element = "<message xmlns='jabber:client' to='a@b' type='chat'><body>hi</body></message>"
            .parse()
            .unwrap();
        assert!(matches!(Stanza::try_from(element), Ok(Stanza::Message(_))));

        let element: Element = "<presence xmlns='jabber:client'/>".parse().unwrap();
        assert!(matches!(Stanza::try_from(element), Ok(Stanza::Presence(_))));

        let element: Element = "<r xmlns='urn:xmpp:sm:3'/>".parse().unwrap();
        assert!(matches!(
            Stanza::try_from(element),
            Err(InvalidStanza::NotAStanza(_))
        ));
    }

    #[test]
    fn ensure_id_keeps_existing_id() {
        let mut element: Element = "<presence xmlns='jabber:client' id='abc'/>".parse().unwrap();
        ensure_element_id(&mut element);
        assert_eq!(element.attr("id"), Some("abc"));

        let mut element: Element = "<presence xmlns='jabber:client'/>".parse().unwrap();
        ensure_element_id(&mut element);
        assert!(!element.attr("id").unwrap().is_empty());
    }

    #[test]
    fn stanza_detection() {
        let element: Element = "<iq xmlns='jabber:client' type='get' id='1'/>".parse().unwrap();
        assert!(is_stanza(&element));
        let element: Element = "<a xmlns='urn:xmpp:sm:3' h='1'/>".parse().unwrap();
        assert!(!is_stanza(&element));
    }
}
