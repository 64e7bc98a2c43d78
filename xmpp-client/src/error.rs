// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

/// Application-facing reason for a disconnection.
///
/// Every internal failure collapses into exactly one of these leaves, see
/// [`From<&Error>`](#impl-From%3C%26Error%3E-for-ClientError). A disconnect
/// requested by the application carries no error at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientError {
    /// The server name could not be resolved
    DomainNameResolve,
    /// Every connection attempt failed or the attempt timed out
    Connection,
    /// Reading from the established connection failed
    ConnectionRead,
    /// Writing to the established connection failed
    ConnectionWrite,
    /// The peer sent malformed XML
    Xml,
    /// SASL authentication was refused
    AuthenticationFailed,
    /// Stream compression could not be set up
    CompressionFailed,
    /// The server failed to prove its identity during SASL
    ServerVerificationFailed,
    /// No SASL mechanism usable by both sides
    NoSupportedAuthMechanisms,
    /// The peer sent an element that is not valid at this point
    UnexpectedElement,
    /// Resource binding failed
    ResourceBind,
    /// Session establishment failed
    SessionStart,
    /// The peer closed the stream with a stream error
    Stream,
    /// TLS negotiation failed or TLS was required but not offered
    Tls,
    /// The configured client certificate could not be read
    ClientCertificateLoad,
    /// The server refused the client certificate
    ClientCertificate,
    /// The smart card holding the client key went away
    CertificateCardRemoved,
    /// Certificate verification failed for an unknown reason
    UnknownCertificate,
    /// The server certificate has expired
    CertificateExpired,
    /// The server certificate is not valid yet
    CertificateNotYetValid,
    /// The server certificate is self-signed
    CertificateSelfSigned,
    /// The server certificate was explicitly rejected
    CertificateRejected,
    /// The server certificate does not chain to a trusted root
    CertificateUntrusted,
    /// The server certificate may not be used for this purpose
    InvalidCertificatePurpose,
    /// The certificate chain is longer than allowed
    CertificatePathLengthExceeded,
    /// A certificate signature does not verify
    InvalidCertificateSignature,
    /// An issuer in the chain is not a valid certificate authority
    InvalidCa,
    /// The certificate does not match the server's domain
    InvalidServerIdentity,
    /// The server certificate has been revoked
    Revoked,
    /// Revocation status could not be determined
    RevocationCheckFailed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ClientError::DomainNameResolve => "unable to find server",
            ClientError::Connection => "error connecting to server",
            ClientError::ConnectionRead => "error while receiving server data",
            ClientError::ConnectionWrite => "error while sending data to the server",
            ClientError::Xml => "error parsing server data",
            ClientError::AuthenticationFailed => "login/password invalid",
            ClientError::CompressionFailed => "error while compressing stream",
            ClientError::ServerVerificationFailed => "server verification failed",
            ClientError::NoSupportedAuthMechanisms => "authentication mechanisms not supported",
            ClientError::UnexpectedElement => "unexpected response",
            ClientError::ResourceBind => "error binding resource",
            ClientError::SessionStart => "error starting session",
            ClientError::Stream => "stream error",
            ClientError::Tls => "encryption error",
            ClientError::ClientCertificateLoad => "error loading certificate (invalid password?)",
            ClientError::ClientCertificate => "certificate not authorized",
            ClientError::CertificateCardRemoved => "certificate card removed",
            ClientError::UnknownCertificate => "unknown certificate",
            ClientError::CertificateExpired => "certificate has expired",
            ClientError::CertificateNotYetValid => "certificate is not yet valid",
            ClientError::CertificateSelfSigned => "certificate is self-signed",
            ClientError::CertificateRejected => "certificate has been rejected",
            ClientError::CertificateUntrusted => "certificate is not trusted",
            ClientError::InvalidCertificatePurpose => "certificate cannot be used for encrypting your connection",
            ClientError::CertificatePathLengthExceeded => "certificate path length constraint exceeded",
            ClientError::InvalidCertificateSignature => "invalid certificate signature",
            ClientError::InvalidCa => "invalid certificate authority",
            ClientError::InvalidServerIdentity => "certificate does not match the host identity",
            ClientError::Revoked => "certificate has been revoked",
            ClientError::RevocationCheckFailed => "unable to determine certificate revocation state",
        };
        fmt.write_str(text)
    }
}

impl StdError for ClientError {}

/// Reason a server certificate failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateVerificationError {
    /// Not classified any further
    Unknown,
    /// Past its validity period
    Expired,
    /// Before its validity period
    NotYetValid,
    /// Issued by itself
    SelfSigned,
    /// Rejected by local policy
    Rejected,
    /// No path to a trusted root
    Untrusted,
    /// Wrong extended key usage
    InvalidPurpose,
    /// Chain too long
    PathLengthExceeded,
    /// Bad signature somewhere in the chain
    InvalidSignature,
    /// An issuer is not allowed to sign certificates
    InvalidCa,
    /// Name mismatch
    InvalidServerIdentity,
    /// Revoked by its issuer
    Revoked,
    /// Revocation information unavailable or stale
    RevocationCheckFailed,
}

impl fmt::Display for CertificateVerificationError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        ClientError::from(*self).fmt(fmt)
    }
}

impl StdError for CertificateVerificationError {}

/// Failure of the connector to produce a raw connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorError {
    /// No lookup produced any address
    DomainNameResolve,
    /// Addresses were found but no factory could connect to any of them
    ConnectionFailed,
    /// The overall connect timeout elapsed
    Timeout,
    /// The connector was stopped
    Cancelled,
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectorError::DomainNameResolve => write!(fmt, "domain name resolution failed"),
            ConnectorError::ConnectionFailed => write!(fmt, "all connection attempts failed"),
            ConnectorError::Timeout => write!(fmt, "connection attempt timed out"),
            ConnectorError::Cancelled => write!(fmt, "connection attempt cancelled"),
        }
    }
}

impl StdError for ConnectorError {}

/// TLS layer failure
#[derive(Debug)]
pub enum TlsError {
    /// TLS protocol failure other than certificate verification
    Protocol(IoError),
    /// The TLS configuration could not be built
    Config(String),
    /// The hardware token holding the client key was removed
    CertificateCardRemoved,
}

impl fmt::Display for TlsError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlsError::Protocol(e) => write!(fmt, "TLS failure: {}", e),
            TlsError::Config(e) => write!(fmt, "TLS configuration error: {}", e),
            TlsError::CertificateCardRemoved => write!(fmt, "certificate card removed"),
        }
    }
}

impl StdError for TlsError {}

/// Failure of the framed stream underneath a session
#[derive(Debug)]
pub enum SessionStreamError {
    /// The peer sent data that is not well-formed XML
    Parse(String),
    /// TLS failure on the stream
    Tls(TlsError),
    /// The local TLS certificate was unusable
    InvalidTlsCertificate,
    /// Reading failed
    ConnectionRead(IoError),
    /// Writing failed
    ConnectionWrite(IoError),
}

impl fmt::Display for SessionStreamError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionStreamError::Parse(e) => write!(fmt, "XML parse error: {}", e),
            SessionStreamError::Tls(e) => write!(fmt, "{}", e),
            SessionStreamError::InvalidTlsCertificate => write!(fmt, "invalid TLS certificate"),
            SessionStreamError::ConnectionRead(e) => write!(fmt, "read error: {}", e),
            SessionStreamError::ConnectionWrite(e) => write!(fmt, "write error: {}", e),
        }
    }
}

impl StdError for SessionStreamError {}

/// Failure during stream negotiation or of the established session
#[derive(Debug)]
pub enum SessionError {
    /// The server answered our SASL exchange with `<failure/>`
    AuthenticationFailed(Option<String>),
    /// The server refused or botched compression setup
    CompressionFailed,
    /// The server's SASL success data did not verify
    ServerVerificationFailed,
    /// No mechanism offered by the server is usable
    NoSupportedAuthMechanisms,
    /// Only PLAIN was usable and the stream is not encrypted
    PlainWithoutTlsNotAllowed,
    /// The server sent an element that makes no sense here
    UnexpectedElement(String),
    /// Resource binding was refused or answered with garbage
    ResourceBind,
    /// Legacy session establishment was refused
    SessionStart,
    /// The server closed the stream with `<stream:error/>`
    StreamError(String),
    /// The server's stream management counters are inconsistent
    StreamManagement(String),
    /// TLS is required but the server does not offer it
    TlsNotAvailable,
    /// TLS setup failed
    Tls(TlsError),
    /// The server rejected our client certificate
    TlsClientCertificate(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::AuthenticationFailed(Some(c)) => {
                write!(fmt, "authentication failed: {}", c)
            }
            SessionError::AuthenticationFailed(None) => write!(fmt, "authentication failed"),
            SessionError::CompressionFailed => write!(fmt, "compression setup failed"),
            SessionError::ServerVerificationFailed => write!(fmt, "server verification failed"),
            SessionError::NoSupportedAuthMechanisms => {
                write!(fmt, "no supported authentication mechanism")
            }
            SessionError::PlainWithoutTlsNotAllowed => {
                write!(fmt, "refusing PLAIN authentication over an unencrypted stream")
            }
            SessionError::UnexpectedElement(name) => write!(fmt, "unexpected element <{}/>", name),
            SessionError::ResourceBind => write!(fmt, "resource binding failed"),
            SessionError::SessionStart => write!(fmt, "session establishment failed"),
            SessionError::StreamError(c) => write!(fmt, "stream error: {}", c),
            SessionError::StreamManagement(e) => write!(fmt, "stream management error: {}", e),
            SessionError::TlsNotAvailable => write!(fmt, "TLS required but not offered"),
            SessionError::Tls(e) => write!(fmt, "{}", e),
            SessionError::TlsClientCertificate(e) => {
                write!(fmt, "client certificate rejected: {}", e)
            }
        }
    }
}

impl StdError for SessionError {}

/// Internal error tree; converted to [`ClientError`] at the client boundary
#[derive(Debug)]
pub enum Error {
    /// No raw connection could be established
    Connector(ConnectorError),
    /// The configured client certificate could not be read
    ClientCertificateLoad(IoError),
    /// Negotiation or session failure
    Session(SessionError),
    /// Transport failure
    Stream(SessionStreamError),
    /// Server certificate verification failed and no trust checker accepted it
    Certificate(CertificateVerificationError),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Connector(e) => write!(fmt, "connection error: {}", e),
            Error::ClientCertificateLoad(e) => write!(fmt, "cannot load client certificate: {}", e),
            Error::Session(e) => write!(fmt, "session error: {}", e),
            Error::Stream(e) => write!(fmt, "stream error: {}", e),
            Error::Certificate(e) => write!(fmt, "certificate verification failed: {}", e),
        }
    }
}

impl StdError for Error {}

impl From<ConnectorError> for Error {
    fn from(e: ConnectorError) -> Self {
        Error::Connector(e)
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        Error::Session(e)
    }
}

impl From<SessionStreamError> for Error {
    fn from(e: SessionStreamError) -> Self {
        Error::Stream(e)
    }
}

impl From<CertificateVerificationError> for Error {
    fn from(e: CertificateVerificationError) -> Self {
        Error::Certificate(e)
    }
}

impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        Error::Session(SessionError::Tls(e))
    }
}

impl From<CertificateVerificationError> for ClientError {
    fn from(e: CertificateVerificationError) -> Self {
        match e {
            CertificateVerificationError::Unknown => ClientError::UnknownCertificate,
            CertificateVerificationError::Expired => ClientError::CertificateExpired,
            CertificateVerificationError::NotYetValid => ClientError::CertificateNotYetValid,
            CertificateVerificationError::SelfSigned => ClientError::CertificateSelfSigned,
            CertificateVerificationError::Rejected => ClientError::CertificateRejected,
            CertificateVerificationError::Untrusted => ClientError::CertificateUntrusted,
            CertificateVerificationError::InvalidPurpose => ClientError::InvalidCertificatePurpose,
            CertificateVerificationError::PathLengthExceeded => {
                ClientError::CertificatePathLengthExceeded
            }
            CertificateVerificationError::InvalidSignature => {
                ClientError::InvalidCertificateSignature
            }
            CertificateVerificationError::InvalidCa => ClientError::InvalidCa,
            CertificateVerificationError::InvalidServerIdentity => {
                ClientError::InvalidServerIdentity
            }
            CertificateVerificationError::Revoked => ClientError::Revoked,
            CertificateVerificationError::RevocationCheckFailed => {
                ClientError::RevocationCheckFailed
            }
        }
    }
}

fn tls_leaf(e: &TlsError) -> ClientError {
    match e {
        TlsError::CertificateCardRemoved => ClientError::CertificateCardRemoved,
        TlsError::Protocol(_) | TlsError::Config(_) => ClientError::Tls,
    }
}

impl From<&Error> for ClientError {
    fn from(e: &Error) -> Self {
        match e {
            Error::Connector(ConnectorError::DomainNameResolve) => ClientError::DomainNameResolve,
            Error::Connector(
                ConnectorError::ConnectionFailed
                | ConnectorError::Timeout
                | ConnectorError::Cancelled,
            ) => ClientError::Connection,
            Error::ClientCertificateLoad(_) => ClientError::ClientCertificateLoad,
            Error::Session(e) => match e {
                SessionError::AuthenticationFailed(_) => ClientError::AuthenticationFailed,
                SessionError::CompressionFailed => ClientError::CompressionFailed,
                SessionError::ServerVerificationFailed => ClientError::ServerVerificationFailed,
                SessionError::NoSupportedAuthMechanisms
                | SessionError::PlainWithoutTlsNotAllowed => {
                    ClientError::NoSupportedAuthMechanisms
                }
                SessionError::UnexpectedElement(_) => ClientError::UnexpectedElement,
                SessionError::ResourceBind => ClientError::ResourceBind,
                SessionError::SessionStart => ClientError::SessionStart,
                SessionError::StreamError(_) | SessionError::StreamManagement(_) => {
                    ClientError::Stream
                }
                SessionError::TlsNotAvailable => ClientError::Tls,
                SessionError::Tls(e) => tls_leaf(e),
                SessionError::TlsClientCertificate(_) => ClientError::ClientCertificate,
            },
            Error::Stream(e) => match e {
                SessionStreamError::Parse(_) => ClientError::Xml,
                SessionStreamError::Tls(e) => tls_leaf(e),
                SessionStreamError::InvalidTlsCertificate => ClientError::ClientCertificateLoad,
                SessionStreamError::ConnectionRead(_) => ClientError::ConnectionRead,
                SessionStreamError::ConnectionWrite(_) => ClientError::ConnectionWrite,
            },
            Error::Certificate(e) => ClientError::from(*e),
        }
    }
}

impl From<Error> for ClientError {
    fn from(e: Error) -> Self {
        ClientError::from(&e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::ErrorKind;

    fn io() -> IoError {
        IoError::new(ErrorKind::Other, "boom")
    }

    #[test]
    fn every_internal_error_maps_to_its_leaf() {
        let matrix: Vec<(Error, ClientError)> = vec![
            (
                ConnectorError::DomainNameResolve.into(),
                ClientError::DomainNameResolve,
            ),
            (
                ConnectorError::ConnectionFailed.into(),
                ClientError::Connection,
            ),
            (ConnectorError::Timeout.into(), ClientError::Connection),
            (ConnectorError::Cancelled.into(), ClientError::Connection),
            (
                Error::ClientCertificateLoad(io()),
                ClientError::ClientCertificateLoad,
            ),
            (
                SessionError::AuthenticationFailed(Some("not-authorized".into())).into(),
                ClientError::AuthenticationFailed,
            ),
            (
                SessionError::AuthenticationFailed(None).into(),
                ClientError::AuthenticationFailed,
            ),
            (
                SessionError::CompressionFailed.into(),
                ClientError::CompressionFailed,
            ),
            (
                SessionError::ServerVerificationFailed.into(),
                ClientError::ServerVerificationFailed,
            ),
            (
                SessionError::NoSupportedAuthMechanisms.into(),
                ClientError::NoSupportedAuthMechanisms,
            ),
            (
                SessionError::PlainWithoutTlsNotAllowed.into(),
                ClientError::NoSupportedAuthMechanisms,
            ),
            (
                SessionError::UnexpectedElement("foo".into()).into(),
                ClientError::UnexpectedElement,
            ),
            (SessionError::ResourceBind.into(), ClientError::ResourceBind),
            (SessionError::SessionStart.into(), ClientError::SessionStart),
            (
                SessionError::StreamError("conflict".into()).into(),
                ClientError::Stream,
            ),
            (
                SessionError::StreamManagement("h too high".into()).into(),
                ClientError::Stream,
            ),
            (SessionError::TlsNotAvailable.into(), ClientError::Tls),
            (
                SessionError::Tls(TlsError::Protocol(io())).into(),
                ClientError::Tls,
            ),
            (
                SessionError::Tls(TlsError::Config("no roots".into())).into(),
                ClientError::Tls,
            ),
            (
                SessionError::Tls(TlsError::CertificateCardRemoved).into(),
                ClientError::CertificateCardRemoved,
            ),
            (
                SessionError::TlsClientCertificate("bad_certificate".into()).into(),
                ClientError::ClientCertificate,
            ),
            (
                SessionStreamError::Parse("eof in tag".into()).into(),
                ClientError::Xml,
            ),
            (
                SessionStreamError::Tls(TlsError::Protocol(io())).into(),
                ClientError::Tls,
            ),
            (
                SessionStreamError::Tls(TlsError::CertificateCardRemoved).into(),
                ClientError::CertificateCardRemoved,
            ),
            (
                SessionStreamError::InvalidTlsCertificate.into(),
                ClientError::ClientCertificateLoad,
            ),
            (
                SessionStreamError::ConnectionRead(io()).into(),
                ClientError::ConnectionRead,
            ),
            (
                SessionStreamError::ConnectionWrite(io()).into(),
                ClientError::ConnectionWrite,
            ),
            (
                CertificateVerificationError::Unknown.into(),
                ClientError::UnknownCertificate,
            ),
            (
                CertificateVerificationError::Expired.into(),
                ClientError::CertificateExpired,
            ),
            (
                CertificateVerificationError::NotYetValid.into(),
                ClientError::CertificateNotYetValid,
            ),
            (
                CertificateVerificationError::SelfSigned.into(),
                ClientError::CertificateSelfSigned,
            ),
            (
                CertificateVerificationError::Rejected.into(),
                ClientError::CertificateRejected,
            ),
            (
                CertificateVerificationError::Untrusted.into(),
                ClientError::CertificateUntrusted,
            ),
            (
                CertificateVerificationError::InvalidPurpose.into(),
                ClientError::InvalidCertificatePurpose,
            ),
            (
                CertificateVerificationError::PathLengthExceeded.into(),
                ClientError::CertificatePathLengthExceeded,
            ),
            (
                CertificateVerificationError::InvalidSignature.into(),
                ClientError::InvalidCertificateSignature,
            ),
            (
                CertificateVerificationError::InvalidCa.into(),
                ClientError::InvalidCa,
            ),
            (
                CertificateVerificationError::InvalidServerIdentity.into(),
                ClientError::InvalidServerIdentity,
            ),
            (
                CertificateVerificationError::Revoked.into(),
                ClientError::Revoked,
            ),
            (
                CertificateVerificationError::RevocationCheckFailed.into(),
                ClientError::RevocationCheckFailed,
            ),
        ];

        let mut seen = HashSet::new();
        for (error, expected) in &matrix {
            assert_eq!(ClientError::from(error), *expected, "mapping of {:?}", error);
            seen.insert(*expected);
        }
        // Every leaf is reachable.
        assert_eq!(seen.len(), 30);
    }

    #[test]
    fn tls_error_converts_into_session_error() {
        let error: Error = TlsError::Config("x".into()).into();
        assert!(matches!(error, Error::Session(SessionError::Tls(_))));
    }

    #[test]
    fn certificate_errors_display_like_their_leaf() {
        assert_eq!(
            CertificateVerificationError::Expired.to_string(),
            ClientError::CertificateExpired.to_string()
        );
    }
}
