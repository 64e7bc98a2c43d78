// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SASL authentication (RFC 6120 §6)

use futures::SinkExt;
use log::debug;
use sasl::client::mechanisms::{Anonymous, Plain, Scram};
use sasl::client::Mechanism as _;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::Credentials;
use xmpp_parsers::sasl::{Auth, Challenge, Failure, Mechanism as XmppMechanism, Response, Success};

use crate::credentials::Password;
use crate::error::{Error, SessionError};
use crate::minidom::Element;
use crate::proto::{ns, Packet, XmppStream};

/// The mechanisms we know, most preferred first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MechanismChoice {
    External,
    ScramSha256,
    ScramSha1,
    Plain,
    Anonymous,
}

impl MechanismChoice {
    pub fn name(self) -> &'static str {
        match self {
            MechanismChoice::External => "EXTERNAL",
            MechanismChoice::ScramSha256 => "SCRAM-SHA-256",
            MechanismChoice::ScramSha1 => "SCRAM-SHA-1",
            MechanismChoice::Plain => "PLAIN",
            MechanismChoice::Anonymous => "ANONYMOUS",
        }
    }

    /// `None` for EXTERNAL, which xmpp-parsers does not list.
    fn as_xmpp(self) -> Option<XmppMechanism> {
        match self {
            MechanismChoice::External => None,
            MechanismChoice::ScramSha256 => Some(XmppMechanism::ScramSha256),
            MechanismChoice::ScramSha1 => Some(XmppMechanism::ScramSha1),
            MechanismChoice::Plain => Some(XmppMechanism::Plain),
            MechanismChoice::Anonymous => Some(XmppMechanism::Anonymous),
        }
    }

    pub fn needs_password(self) -> bool {
        matches!(
            self,
            MechanismChoice::ScramSha256 | MechanismChoice::ScramSha1 | MechanismChoice::Plain
        )
    }
}

/// Mechanism names listed in `<stream:features/>`
pub(crate) fn offered_mechanisms(features: &Element) -> Vec<String> {
    features
        .get_child("mechanisms", ns::SASL)
        .map(|mechanisms| {
            mechanisms
                .children()
                .filter(|child| child.is("mechanism", ns::SASL))
                .map(|child| child.text().trim().to_owned())
                .collect()
        })
        .unwrap_or_default()
}

/// What the local side is willing to do
#[derive(Debug, Clone, Copy)]
pub(crate) struct AuthPolicy {
    pub single_sign_on: bool,
    pub encrypted: bool,
    pub allow_plain_without_tls: bool,
    pub has_username: bool,
}

/// Pick the best mechanism both sides support.
pub(crate) fn select_mechanism(
    offered: &[String],
    policy: AuthPolicy,
) -> Result<MechanismChoice, SessionError> {
    let offers = |choice: MechanismChoice| offered.iter().any(|name| name == choice.name());

    if policy.single_sign_on && offers(MechanismChoice::External) {
        return Ok(MechanismChoice::External);
    }
    if !policy.has_username {
        return if offers(MechanismChoice::Anonymous) {
            Ok(MechanismChoice::Anonymous)
        } else {
            Err(SessionError::NoSupportedAuthMechanisms)
        };
    }
    for choice in [MechanismChoice::ScramSha256, MechanismChoice::ScramSha1] {
        if offers(choice) {
            return Ok(choice);
        }
    }
    if offers(MechanismChoice::Plain) {
        if policy.encrypted || policy.allow_plain_without_tls {
            return Ok(MechanismChoice::Plain);
        }
        return Err(SessionError::PlainWithoutTlsNotAllowed);
    }
    Err(SessionError::NoSupportedAuthMechanisms)
}

/// A running client mechanism
enum Exchange {
    Sasl(Box<dyn sasl::client::Mechanism + Send + Sync>),
    /// Identity comes from the TLS client certificate.
    External,
}

impl Exchange {
    /// Set up `choice`, then wipe `password`: the mechanism keeps the only
    /// copy until the exchange is dropped.
    fn new(
        choice: MechanismChoice,
        username: &str,
        password: Option<&mut Password>,
    ) -> Result<Self, SessionError> {
        let exchange = Self::build(
            choice,
            username,
            password.as_deref().map(Password::expose).unwrap_or_default(),
        );
        if let Some(password) = password {
            password.clear();
        }
        exchange
    }

    fn build(choice: MechanismChoice, username: &str, secret: &str) -> Result<Self, SessionError> {
        let credentials = || {
            Credentials::default()
                .with_username(username)
                .with_password(secret)
        };
        let unusable = |e| {
            debug!("Cannot set up {}: {:?}", choice.name(), e);
            SessionError::NoSupportedAuthMechanisms
        };
        Ok(match choice {
            MechanismChoice::External => Exchange::External,
            MechanismChoice::ScramSha256 => Exchange::Sasl(Box::new(
                Scram::<Sha256>::from_credentials(credentials()).map_err(unusable)?,
            )),
            MechanismChoice::ScramSha1 => Exchange::Sasl(Box::new(
                Scram::<Sha1>::from_credentials(credentials()).map_err(unusable)?,
            )),
            MechanismChoice::Plain => Exchange::Sasl(Box::new(
                Plain::from_credentials(credentials()).map_err(unusable)?,
            )),
            MechanismChoice::Anonymous => Exchange::Sasl(Box::new(Anonymous::new())),
        })
    }

    fn initial(&mut self) -> Vec<u8> {
        match self {
            Exchange::Sasl(mechanism) => mechanism.initial(),
            Exchange::External => Vec::new(),
        }
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SessionError> {
        match self {
            Exchange::Sasl(mechanism) => mechanism
                .response(challenge)
                .map_err(|e| SessionError::AuthenticationFailed(Some(format!("{:?}", e)))),
            Exchange::External => Ok(Vec::new()),
        }
    }

    fn success(&mut self, data: &[u8]) -> Result<(), SessionError> {
        match self {
            Exchange::Sasl(mechanism) => mechanism.success(data).map_err(|e| {
                debug!("Server signature did not verify: {:?}", e);
                SessionError::ServerVerificationFailed
            }),
            Exchange::External => Ok(()),
        }
    }
}

/// The initial `<auth/>`
fn auth_element(choice: MechanismChoice, initial: Vec<u8>) -> Element {
    match choice.as_xmpp() {
        Some(mechanism) => Auth {
            mechanism,
            data: initial,
        }
        .into(),
        // An empty initial response is sent as "=" (RFC 6120 §6.4.2).
        None => Element::builder("auth", ns::SASL)
            .attr("mechanism", choice.name())
            .append("=")
            .build(),
    }
}

/// Run the SASL exchange to completion.
///
/// The stream must be restarted by the caller on success.
pub(crate) async fn authenticate(
    stream: &mut XmppStream,
    choice: MechanismChoice,
    username: &str,
    password: Option<&mut Password>,
) -> Result<(), Error> {
    let mut exchange = Exchange::new(choice, username, password)?;
    let initial = exchange.initial();
    debug!("Authenticating with {}", choice.name());
    stream
        .send(Packet::Stanza(auth_element(choice, initial)))
        .await?;

    loop {
        let element = stream.next_element().await?;
        if let Ok(challenge) = Challenge::try_from(element.clone()) {
            let data = exchange.response(&challenge.data)?;
            stream
                .send(Packet::Stanza(Response { data }.into()))
                .await?;
        } else if let Ok(success) = Success::try_from(element.clone()) {
            exchange.success(&success.data)?;
            return Ok(());
        } else if let Ok(failure) = Failure::try_from(element.clone()) {
            let condition = Element::from(failure.defined_condition).name().to_owned();
            return Err(SessionError::AuthenticationFailed(Some(condition)).into());
        } else {
            return Err(SessionError::UnexpectedElement(element.name().to_owned()).into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offered(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn policy() -> AuthPolicy {
        AuthPolicy {
            single_sign_on: false,
            encrypted: true,
            allow_plain_without_tls: false,
            has_username: true,
        }
    }

    #[test]
    fn parse_offered_mechanisms() {
        let features: Element = "<stream:features xmlns:stream='http://etherx.jabber.org/streams'><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism><mechanism>SCRAM-SHA-1</mechanism></mechanisms></stream:features>"
            .parse()
            .unwrap();
        assert_eq!(offered_mechanisms(&features), ["PLAIN", "SCRAM-SHA-1"]);
    }

    #[test]
    fn scram_preferred() {
        assert_eq!(
            select_mechanism(&offered(&["PLAIN", "SCRAM-SHA-1", "SCRAM-SHA-256"]), policy())
                .unwrap(),
            MechanismChoice::ScramSha256
        );
        assert_eq!(
            select_mechanism(&offered(&["PLAIN", "SCRAM-SHA-1"]), policy()).unwrap(),
            MechanismChoice::ScramSha1
        );
    }

    #[test]
    fn plain_requires_tls_unless_allowed() {
        let unencrypted = AuthPolicy {
            encrypted: false,
            ..policy()
        };
        assert!(matches!(
            select_mechanism(&offered(&["PLAIN"]), unencrypted),
            Err(SessionError::PlainWithoutTlsNotAllowed)
        ));
        let allowed = AuthPolicy {
            allow_plain_without_tls: true,
            ..unencrypted
        };
        assert_eq!(
            select_mechanism(&offered(&["PLAIN"]), allowed).unwrap(),
            MechanismChoice::Plain
        );
        assert_eq!(
            select_mechanism(&offered(&["PLAIN"]), policy()).unwrap(),
            MechanismChoice::Plain
        );
    }

    #[test]
    fn external_only_with_single_sign_on() {
        let offers = offered(&["EXTERNAL", "SCRAM-SHA-1"]);
        assert_eq!(
            select_mechanism(&offers, policy()).unwrap(),
            MechanismChoice::ScramSha1
        );
        let sso = AuthPolicy {
            single_sign_on: true,
            ..policy()
        };
        assert_eq!(
            select_mechanism(&offers, sso).unwrap(),
            MechanismChoice::External
        );
        assert!(!MechanismChoice::External.needs_password());
    }

    #[test]
    fn anonymous_for_bare_domains() {
        let anonymous = AuthPolicy {
            has_username: false,
            ..policy()
        };
        assert_eq!(
            select_mechanism(&offered(&["SCRAM-SHA-1", "ANONYMOUS"]), anonymous).unwrap(),
            MechanismChoice::Anonymous
        );
        assert!(matches!(
            select_mechanism(&offered(&["SCRAM-SHA-1"]), anonymous),
            Err(SessionError::NoSupportedAuthMechanisms)
        ));
    }

    #[test]
    fn nothing_in_common() {
        assert!(matches!(
            select_mechanism(&offered(&["DIGEST-MD5", "X-OAUTH2"]), policy()),
            Err(SessionError::NoSupportedAuthMechanisms)
        ));
        assert!(matches!(
            select_mechanism(&[], policy()),
            Err(SessionError::NoSupportedAuthMechanisms)
        ));
    }

    #[test]
    fn auth_elements() {
        let auth = auth_element(MechanismChoice::Plain, b"\0juliet\0pencil".to_vec());
        assert!(auth.is("auth", ns::SASL));
        assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
        assert_eq!(auth.text(), "AGp1bGlldABwZW5jaWw=");

        let external = auth_element(MechanismChoice::External, Vec::new());
        assert_eq!(external.attr("mechanism"), Some("EXTERNAL"));
        assert_eq!(external.text(), "=");
    }

    #[test]
    fn plain_initial_response() {
        let mut password = Password::from("pencil");
        let mut exchange =
            Exchange::new(MechanismChoice::Plain, "juliet", Some(&mut password)).unwrap();
        // The session's copy is gone as soon as the mechanism holds one.
        assert!(password.is_empty());
        assert_eq!(exchange.initial(), b"\0juliet\0pencil");
    }
}
