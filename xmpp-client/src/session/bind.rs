// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use futures::SinkExt;
use log::debug;
use xmpp_parsers::bind::{BindQuery, BindResponse};
use xmpp_parsers::iq::{Iq, IqType};

use crate::error::{Error, SessionError};
use crate::jid::Jid;
use crate::minidom::Element;
use crate::proto::{ns, Packet, XmppStream};

const BIND_REQ_ID: &str = "resource-bind";
const SESSION_REQ_ID: &str = "session-start";

/// Wait for the `<iq/>` answering `id`, skipping anything else.
async fn iq_response(stream: &mut XmppStream, id: &str) -> Result<Element, Error> {
    loop {
        let element = stream.next_element().await?;
        if element.is("iq", ns::JABBER_CLIENT) && element.attr("id") == Some(id) {
            return Ok(element);
        }
        debug!("Ignoring <{}/> while waiting for {}", element.name(), id);
    }
}

/// Bind a resource, asking for the one in `jid` if it has one.
pub(crate) async fn bind(stream: &mut XmppStream, jid: &Jid) -> Result<Jid, Error> {
    let resource = jid.resource().map(|resource| resource.to_string());
    let iq = Iq::from_set(BIND_REQ_ID, BindQuery::new(resource));
    stream.send(Packet::Stanza(iq.into())).await?;

    let element = iq_response(stream, BIND_REQ_ID).await?;
    match Iq::try_from(element) {
        Ok(Iq {
            payload: IqType::Result(Some(payload)),
            ..
        }) => BindResponse::try_from(payload)
            .map(Jid::from)
            .map_err(|_| SessionError::ResourceBind.into()),
        _ => Err(SessionError::ResourceBind.into()),
    }
}

/// Does the server ask for legacy session establishment (RFC 3921)?
pub(crate) fn needs_session(features: &Element) -> bool {
    features
        .get_child("session", ns::SESSION)
        .map_or(false, |session| !session.has_child("optional", ns::SESSION))
}

/// Legacy session establishment
pub(crate) async fn start_session(stream: &mut XmppStream) -> Result<(), Error> {
    let iq = Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "set")
        .attr("id", SESSION_REQ_ID)
        .append(Element::builder("session", ns::SESSION))
        .build();
    stream.send(Packet::Stanza(iq)).await?;

    let element = iq_response(stream, SESSION_REQ_ID).await?;
    if element.attr("type") == Some("result") {
        Ok(())
    } else {
        Err(SessionError::SessionStart.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_session_is_skipped() {
        let features: Element = "<features xmlns='http://etherx.jabber.org/streams'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session></features>"
            .parse()
            .unwrap();
        assert!(!needs_session(&features));

        let features: Element = "<features xmlns='http://etherx.jabber.org/streams'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></features>"
            .parse()
            .unwrap();
        assert!(needs_session(&features));

        let features: Element = "<features xmlns='http://etherx.jabber.org/streams'/>"
            .parse()
            .unwrap();
        assert!(!needs_session(&features));
    }
}
