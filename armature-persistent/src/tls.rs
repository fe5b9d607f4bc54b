//! TLS client setup.
//!
//! Settings are turned into a single `rustls::ClientConfig` per TLS generation.
//! Sharing one config across connections is what lets session tickets be
//! reused, so the pool caches the result and rebuilds it only after a setter
//! has bumped the TLS generation.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{Resumption, WebPkiServerVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedProtocolVersion};
use rustls_pemfile::{certs, private_key};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::{PoolError, Result};

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

static VERIFY_DISABLED_WARNED: AtomicBool = AtomicBool::new(false);

/// Peer verification policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerifyMode {
    /// Verify the server certificate chain and name.
    #[default]
    Peer,
    /// Accept any server certificate.
    None,
}

/// Protocol version pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    /// TLS 1.2 only.
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

impl TlsVersion {
    fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            Self::Tls12 => TLS12_ONLY,
            Self::Tls13 => TLS13_ONLY,
        }
    }
}

/// Callback consulted after chain verification when a CA file is configured.
///
/// Receives whether the chain verified and the end-entity certificate, and
/// returns whether to accept the peer.
#[derive(Clone)]
pub struct VerifyCallback(Arc<dyn Fn(bool, &CertificateDer<'_>) -> bool + Send + Sync>);

impl VerifyCallback {
    /// Wrap a closure.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(bool, &CertificateDer<'_>) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    fn call(&self, preverified: bool, cert: &CertificateDer<'_>) -> bool {
        (self.0)(preverified, cert)
    }
}

impl fmt::Debug for VerifyCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VerifyCallback(..)")
    }
}

/// TLS parameters of a pool.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Client certificate chain.
    pub certificate: Option<Vec<CertificateDer<'static>>>,
    /// Client private key.
    pub private_key: Option<Arc<PrivateKeyDer<'static>>>,
    /// PEM bundle of extra trust anchors; forces peer verification.
    pub ca_file: Option<PathBuf>,
    /// Trust store replacing the bundled roots.
    pub cert_store: Option<Arc<RootCertStore>>,
    /// Verification policy.
    pub verify_mode: VerifyMode,
    /// Verification hook, used together with `ca_file`.
    pub verify_callback: Option<VerifyCallback>,
    /// Protocol version pin.
    pub version: Option<TlsVersion>,
    /// Share session tickets between connections.
    pub reuse_sessions: bool,
    /// Silence the warning logged when verification is disabled.
    pub suppress_verify_warning: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            certificate: None,
            private_key: None,
            ca_file: None,
            cert_store: None,
            verify_mode: VerifyMode::Peer,
            verify_callback: None,
            version: None,
            reuse_sessions: true,
            suppress_verify_warning: false,
        }
    }
}

impl TlsSettings {
    /// Verification policy in effect; a CA file always means peer verification.
    pub fn effective_verify_mode(&self) -> VerifyMode {
        if self.ca_file.is_some() {
            VerifyMode::Peer
        } else {
            self.verify_mode
        }
    }

    /// Build the client configuration for these settings.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let builder = ClientConfig::builder_with_provider(provider.clone());
        let builder = match self.version {
            Some(version) => builder.with_protocol_versions(version.versions()),
            None => builder.with_safe_default_protocol_versions(),
        }
        .map_err(|e| PoolError::Tls(format!("unsupported protocol version: {e}")))?;

        let verifier: Arc<dyn ServerCertVerifier> = match self.effective_verify_mode() {
            VerifyMode::None => {
                warn_verification_disabled(self.suppress_verify_warning);
                Arc::new(NoVerification(provider.clone()))
            }
            VerifyMode::Peer => {
                let roots = self.root_store()?;
                let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .map_err(|e| PoolError::Tls(format!("failed to build verifier: {e}")))?;
                match (&self.ca_file, &self.verify_callback) {
                    (Some(_), Some(callback)) => Arc::new(CallbackVerifier {
                        inner: webpki,
                        callback: callback.clone(),
                    }),
                    _ => webpki,
                }
            }
        };

        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let mut config = match (&self.certificate, &self.private_key) {
            (Some(chain), Some(key)) => builder
                .with_client_auth_cert(chain.clone(), key.clone_key())
                .map_err(|e| PoolError::Tls(format!("invalid client certificate: {e}")))?,
            _ => builder.with_no_client_auth(),
        };

        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        if !self.reuse_sessions {
            config.resumption = Resumption::disabled();
        }

        Ok(Arc::new(config))
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = match &self.cert_store {
            Some(store) => store.as_ref().clone(),
            None => {
                let mut store = RootCertStore::empty();
                store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                store
            }
        };

        if let Some(path) = &self.ca_file {
            let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
            if added == 0 {
                return Err(PoolError::Tls(format!(
                    "no usable certificates in CA file {}",
                    path.display()
                )));
            }
            if ignored > 0 {
                warn!(path = %path.display(), ignored, "Ignored unparsable CA certificates");
            }
        }

        Ok(roots)
    }
}

fn warn_verification_disabled(suppressed: bool) {
    if suppressed || VERIFY_DISABLED_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    warn!(
        "TLS peer verification is disabled; server certificates will not be checked. \
         Set suppress_verify_warning once this has been acknowledged."
    );
}

/// Server name for a destination host.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| PoolError::Tls(format!("invalid server name {host:?}: {e}")))
}

/// Load a certificate chain from a PEM file.
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path.as_ref())?;
    parse_certs(&mut BufReader::new(file))
}

/// Load a private key from a PEM file.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path.as_ref())?;
    parse_private_key(&mut BufReader::new(file))
}

/// Parse a certificate chain from PEM bytes.
pub fn parse_certs(pem: &mut dyn std::io::BufRead) -> Result<Vec<CertificateDer<'static>>> {
    certs(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| PoolError::Tls(format!("failed to parse certificates: {e}")))
}

/// Parse a private key from PEM bytes.
pub fn parse_private_key(pem: &mut dyn std::io::BufRead) -> Result<PrivateKeyDer<'static>> {
    private_key(pem)
        .map_err(|e| PoolError::Tls(format!("failed to read private key: {e}")))?
        .ok_or_else(|| PoolError::Tls("no private key found".to_string()))
}

/// Chain verification followed by the user's verdict.
#[derive(Debug)]
struct CallbackVerifier {
    inner: Arc<WebPkiServerVerifier>,
    callback: VerifyCallback,
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let result =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);
        let accepted = self.callback.call(result.is_ok(), end_entity);
        match result {
            Ok(verified) if accepted => Ok(verified),
            Ok(_) => Err(rustls::Error::General(
                "certificate rejected by verify callback".to_string(),
            )),
            Err(_) if accepted => Ok(ServerCertVerified::assertion()),
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any certificate; handshake signatures are still checked.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = TlsSettings::default();
        assert_eq!(settings.verify_mode, VerifyMode::Peer);
        assert!(settings.reuse_sessions);
        assert!(settings.version.is_none());
    }

    #[test]
    fn test_default_client_config() {
        let config = TlsSettings::default().client_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_verify_none_builds() {
        let settings = TlsSettings {
            verify_mode: VerifyMode::None,
            suppress_verify_warning: true,
            version: Some(TlsVersion::Tls13),
            reuse_sessions: false,
            ..Default::default()
        };
        assert!(settings.client_config().is_ok());
    }

    #[test]
    fn test_ca_file_forces_peer_verification() {
        let settings = TlsSettings {
            verify_mode: VerifyMode::None,
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert_eq!(settings.effective_verify_mode(), VerifyMode::Peer);
        assert!(matches!(settings.client_config(), Err(PoolError::Io(_))));
    }

    #[test]
    fn test_ca_file_without_certificates_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let settings = TlsSettings {
            ca_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(settings.client_config(), Err(PoolError::Tls(_))));
    }

    #[test]
    fn test_private_key_missing() {
        let mut pem: &[u8] = b"-----BEGIN NOTHING-----\n-----END NOTHING-----\n";
        assert!(matches!(parse_private_key(&mut pem), Err(PoolError::Tls(_))));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("[::1]").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
