// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! TLS on top of a raw connection, using rustls
//!
//! Server certificates are verified against the platform roots. When
//! verification fails, a configured [`CertificateTrustChecker`] gets the
//! final say; if it declines, the connection fails with the classified
//! [`CertificateVerificationError`].

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    client::WebPkiServerVerifier,
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    AlertDescription, CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore,
    SignatureScheme,
};
use tokio_rustls::TlsConnector;

use crate::connect::Connection;
use crate::error::{
    CertificateVerificationError, Error, SessionError, SessionStreamError, TlsError,
};

/// Decides whether to accept a server certificate that failed verification
pub trait CertificateTrustChecker: fmt::Debug + Send + Sync {
    /// `chain` starts with the server's own certificate.
    fn is_certificate_trusted(
        &self,
        chain: &[CertificateDer<'_>],
        error: CertificateVerificationError,
    ) -> bool;
}

/// A client certificate and its key, both PEM encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    /// Certificate chain, starting with the client's certificate
    pub certificate_chain: PathBuf,
    /// Private key matching the first certificate
    pub private_key: PathBuf,
}

type LoadedCertificate = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn invalid_data<E: fmt::Debug>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("{:?}", e))
}

fn pem_error(e: rustls::pki_types::pem::Error) -> io::Error {
    match e {
        rustls::pki_types::pem::Error::Io(e) => e,
        e => invalid_data(e),
    }
}

impl ClientCertificate {
    /// Use the PEM files at the given paths
    pub fn from_pem_files<C: Into<PathBuf>, K: Into<PathBuf>>(
        certificate_chain: C,
        private_key: K,
    ) -> Self {
        ClientCertificate {
            certificate_chain: certificate_chain.into(),
            private_key: private_key.into(),
        }
    }

    /// Read both files.
    pub fn load(&self) -> io::Result<LoadedCertificate> {
        let chain = CertificateDer::pem_file_iter(&self.certificate_chain)
            .map_err(pem_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(pem_error)?;
        if chain.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no certificate in {}", self.certificate_chain.display()),
            ));
        }
        let key = PrivateKeyDer::from_pem_file(&self.private_key).map_err(pem_error)?;
        Ok((chain, key))
    }
}

/// Map a rustls verification failure onto the certificate taxonomy.
///
/// `chain_len` counts the server certificate and the intermediates it sent;
/// an unknown issuer on a lone certificate means it signed itself.
pub(crate) fn classify(e: &rustls::Error, chain_len: usize) -> CertificateVerificationError {
    use CertificateVerificationError as V;

    let e = match e {
        rustls::Error::InvalidCertificate(e) => e,
        rustls::Error::InvalidCertRevocationList(_) => return V::RevocationCheckFailed,
        _ => return V::Unknown,
    };
    match e {
        CertificateError::Expired | CertificateError::ExpiredContext { .. } => V::Expired,
        CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => {
            V::NotYetValid
        }
        CertificateError::Revoked => V::Revoked,
        CertificateError::UnknownIssuer if chain_len <= 1 => V::SelfSigned,
        CertificateError::UnknownIssuer => V::Untrusted,
        CertificateError::BadSignature
        | CertificateError::UnsupportedSignatureAlgorithmContext { .. }
        | CertificateError::UnsupportedSignatureAlgorithmForPublicKeyContext { .. } => {
            V::InvalidSignature
        }
        #[allow(deprecated)]
        CertificateError::UnsupportedSignatureAlgorithm => V::InvalidSignature,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. } => {
            V::InvalidServerIdentity
        }
        CertificateError::InvalidPurpose | CertificateError::InvalidPurposeContext { .. } => {
            V::InvalidPurpose
        }
        CertificateError::UnknownRevocationStatus
        | CertificateError::ExpiredRevocationList
        | CertificateError::ExpiredRevocationListContext { .. } => V::RevocationCheckFailed,
        CertificateError::UnhandledCriticalExtension
        | CertificateError::ApplicationVerificationFailure => V::Rejected,
        // webpki reports path length and CA misuse as opaque `Other` errors.
        _ => V::Unknown,
    }
}

type Outcome = Arc<Mutex<Option<CertificateVerificationError>>>;

/// Platform verification, overridable by a trust checker
#[derive(Debug)]
struct CheckingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    trust_checker: Option<Arc<dyn CertificateTrustChecker>>,
    outcome: Outcome,
}

impl ServerCertVerifier for CheckingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let e = match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => return Ok(verified),
            Err(e) => e,
        };
        let error = classify(&e, 1 + intermediates.len());
        if let Some(checker) = &self.trust_checker {
            let chain: Vec<CertificateDer<'_>> = std::iter::once(end_entity.clone())
                .chain(intermediates.iter().cloned())
                .collect();
            if checker.is_certificate_trusted(&chain, error) {
                info!("Accepting server certificate despite {:?}", error);
                return Ok(ServerCertVerified::assertion());
            }
        }
        debug!("Server certificate rejected: {e}");
        if let Ok(mut outcome) = self.outcome.lock() {
            *outcome = Some(error);
        }
        Err(e)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn root_store() -> Result<RootCertStore, TlsError> {
    #[allow(unused_mut)]
    let mut root_store = RootCertStore::empty();
    #[cfg(feature = "webpki-roots")]
    {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    #[cfg(feature = "rustls-native-certs")]
    {
        let certs = rustls_native_certs::load_native_certs().map_err(TlsError::Protocol)?;
        let (added, ignored) = root_store.add_parsable_certificates(certs);
        debug!("Loaded {added} native root certificates, ignored {ignored}");
    }
    Ok(root_store)
}

fn rejected_client_certificate(e: &io::Error) -> bool {
    matches!(
        e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()),
        Some(rustls::Error::AlertReceived(
            AlertDescription::BadCertificate
                | AlertDescription::UnsupportedCertificate
                | AlertDescription::CertificateRevoked
                | AlertDescription::CertificateExpired
                | AlertDescription::CertificateUnknown
                | AlertDescription::CertificateRequired
                | AlertDescription::UnknownCA
        ))
    )
}

/// Settings for the TLS layer of the next connection
#[derive(Debug, Clone, Default)]
pub struct TlsContext {
    trust_checker: Option<Arc<dyn CertificateTrustChecker>>,
    client_certificate: Option<ClientCertificate>,
}

impl TlsContext {
    /// Verify with `trust_checker` as fallback and present `client_certificate`
    pub fn new(
        trust_checker: Option<Arc<dyn CertificateTrustChecker>>,
        client_certificate: Option<ClientCertificate>,
    ) -> Self {
        TlsContext {
            trust_checker,
            client_certificate,
        }
    }

    /// Is a client certificate configured?
    pub fn has_client_certificate(&self) -> bool {
        self.client_certificate.is_some()
    }

    fn config(&self, outcome: Outcome) -> Result<ClientConfig, Error> {
        let client_auth = match &self.client_certificate {
            Some(certificate) => Some(certificate.load().map_err(Error::ClientCertificateLoad)?),
            None => None,
        };
        let roots = Arc::new(root_store()?);
        let inner = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| TlsError::Config(e.to_string()))?;
        let verifier = Arc::new(CheckingVerifier {
            inner,
            trust_checker: self.trust_checker.clone(),
            outcome,
        });
        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier);
        match client_auth {
            None => Ok(builder.with_no_client_auth()),
            Some((chain, key)) => builder.with_client_auth_cert(chain, key).map_err(|e| {
                warn!("Unusable client certificate: {e}");
                SessionStreamError::InvalidTlsCertificate.into()
            }),
        }
    }

    /// Run the TLS handshake for `domain` on `connection`.
    pub async fn connect(&self, domain: &str, connection: Connection) -> Result<Connection, Error> {
        let outcome = Outcome::default();
        let config = self.config(outcome.clone())?;
        let server_name = ServerName::try_from(domain.to_owned())
            .map_err(|e| TlsError::Config(e.to_string()))?;
        match TlsConnector::from(Arc::new(config))
            .connect(server_name, connection)
            .await
        {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) => {
                if let Some(error) = outcome.lock().ok().and_then(|mut slot| slot.take()) {
                    return Err(error.into());
                }
                if self.client_certificate.is_some() && rejected_client_certificate(&e) {
                    return Err(SessionError::TlsClientCertificate(e.to_string()).into());
                }
                Err(TlsError::Protocol(e).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_certificate_errors() {
        let cases = [
            (CertificateError::Expired, CertificateVerificationError::Expired),
            (CertificateError::NotValidYet, CertificateVerificationError::NotYetValid),
            (CertificateError::Revoked, CertificateVerificationError::Revoked),
            (CertificateError::UnknownIssuer, CertificateVerificationError::Untrusted),
            (CertificateError::BadSignature, CertificateVerificationError::InvalidSignature),
            (
                CertificateError::NotValidForName,
                CertificateVerificationError::InvalidServerIdentity,
            ),
            (CertificateError::InvalidPurpose, CertificateVerificationError::InvalidPurpose),
            (
                CertificateError::UnknownRevocationStatus,
                CertificateVerificationError::RevocationCheckFailed,
            ),
            (
                CertificateError::ExpiredRevocationList,
                CertificateVerificationError::RevocationCheckFailed,
            ),
            (
                CertificateError::UnhandledCriticalExtension,
                CertificateVerificationError::Rejected,
            ),
            (
                CertificateError::ApplicationVerificationFailure,
                CertificateVerificationError::Rejected,
            ),
            (CertificateError::BadEncoding, CertificateVerificationError::Unknown),
        ];
        for (error, expected) in cases {
            assert_eq!(
                classify(&rustls::Error::InvalidCertificate(error), 2),
                expected
            );
        }
    }

    #[test]
    fn variants_with_context() {
        let now = UnixTime::since_unix_epoch(std::time::Duration::from_secs(1_700_000_000));
        let then = UnixTime::since_unix_epoch(std::time::Duration::from_secs(1_600_000_000));
        assert_eq!(
            classify(
                &rustls::Error::InvalidCertificate(CertificateError::ExpiredContext {
                    time: now,
                    not_after: then,
                }),
                2
            ),
            CertificateVerificationError::Expired
        );
        assert_eq!(
            classify(
                &rustls::Error::InvalidCertificate(CertificateError::NotValidYetContext {
                    time: then,
                    not_before: now,
                }),
                2
            ),
            CertificateVerificationError::NotYetValid
        );
    }

    #[test]
    fn bad_revocation_list() {
        assert_eq!(
            classify(
                &rustls::Error::InvalidCertRevocationList(
                    rustls::CertRevocationListError::BadSignature
                ),
                2
            ),
            CertificateVerificationError::RevocationCheckFailed
        );
    }

    #[test]
    fn lone_certificate_from_unknown_issuer_is_self_signed() {
        let unknown = rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer);
        assert_eq!(classify(&unknown, 1), CertificateVerificationError::SelfSigned);
        assert_eq!(classify(&unknown, 3), CertificateVerificationError::Untrusted);
    }

    #[test]
    fn non_certificate_errors_are_unknown() {
        assert_eq!(
            classify(&rustls::Error::HandshakeNotComplete, 1),
            CertificateVerificationError::Unknown
        );
    }

    #[test]
    fn client_rejection_alert() {
        let e = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(AlertDescription::CertificateRequired),
        );
        assert!(rejected_client_certificate(&e));
        let e = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(AlertDescription::HandshakeFailure),
        );
        assert!(!rejected_client_certificate(&e));
    }

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "xmpp-client-tls-{}-{}",
            std::process::id(),
            name
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_client_certificate() {
        let certificate =
            ClientCertificate::from_pem_files("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert_eq!(
            certificate.load().unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn client_certificate_without_certificates() {
        let chain = temp_file("empty-chain.pem", "no PEM sections here\n");
        let certificate = ClientCertificate::from_pem_files(&chain, &chain);
        assert_eq!(
            certificate.load().unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
        let _ = std::fs::remove_file(chain);
    }

    #[tokio::test]
    async fn unloadable_certificate_fails_before_handshake() {
        let context = TlsContext::new(
            None,
            Some(ClientCertificate::from_pem_files(
                "/nonexistent/cert.pem",
                "/nonexistent/key.pem",
            )),
        );
        let (client, _server) = tokio::io::duplex(64);
        assert!(matches!(
            context.connect("example.org", Box::new(client)).await,
            Err(Error::ClientCertificateLoad(_))
        ));
    }
}
