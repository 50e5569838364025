//! TLS trust configuration and the per-connection verifier.
//!
//! An [`SslContext`] holds the trust anchors an agent uses, and whether the
//! peer is verified at all. A [`Verifier`] binds a context to the hostname
//! being connected to, performs the handshake, and decides whether a pooled
//! connection established by another verifier can be reused.

use std::io;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{CertificateError, ClientConfig, RootCertStore, SupportedProtocolVersion};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

mod insecure;

/// Errors establishing TLS trust.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    /// The server certificate is valid, but not for the host we connected to.
    #[error("Server hostname '{host}' did not match server certificate")]
    HostnameMismatch {
        /// Host we attempted to reach.
        host: String,
    },

    /// The server certificate could not be verified.
    #[error("certificate verify failed [{reason}] for {host}")]
    CertificateVerify {
        /// Host we attempted to reach.
        host: String,
        /// The verification failure.
        reason: String,
    },

    /// The host cannot be used as a TLS server name.
    #[error("invalid server name '{0}'")]
    InvalidHostname(String),

    /// None of the configured cipher suites are supported.
    #[error("none of the configured cipher suites are supported: {0}")]
    NoCipherSuites(String),

    /// The TLS configuration was rejected.
    #[error("tls configuration: {0}")]
    Config(#[source] rustls::Error),

    /// The system trust store could not be loaded.
    #[error("failed to load system trust store: {0}")]
    SystemStore(String),

    /// The handshake failed for a reason other than certificate trust.
    #[error("tls handshake: {0}")]
    Handshake(#[source] io::Error),
}

/// Minimum TLS protocol version to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 or newer.
    #[default]
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

/// Handshake parameters applied to every TLS connection made by a connection factory.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct TlsParameters {
    /// The minimum protocol version.
    pub min_version: TlsVersion,

    /// Allow-list of cipher suite names (e.g. `TLS13_AES_256_GCM_SHA384`).
    /// When empty, the provider's defaults are used.
    pub cipher_suites: Vec<String>,
}

impl TlsParameters {
    fn protocol_versions(&self) -> &'static [&'static SupportedProtocolVersion] {
        static ALL: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
        static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

        match self.min_version {
            TlsVersion::Tls12 => ALL,
            TlsVersion::Tls13 => TLS13_ONLY,
        }
    }
}

/// TLS trust configuration: trust anchors, and whether the peer is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslContext {
    roots: Vec<CertificateDer<'static>>,
    verify_peer: bool,
}

impl SslContext {
    /// A context verifying peers against the given trust anchors.
    pub fn new<I>(roots: I) -> Self
    where
        I: IntoIterator<Item = CertificateDer<'static>>,
    {
        Self {
            roots: roots.into_iter().collect(),
            verify_peer: true,
        }
    }

    /// A context which does not verify the peer.
    pub fn insecure() -> Self {
        Self {
            roots: Vec::new(),
            verify_peer: false,
        }
    }

    /// A context trusting the platform's native certificate store.
    pub fn system() -> Result<Self, TlsError> {
        Ok(Self::new(load_system_roots()?))
    }

    /// A copy of this context which additionally trusts the platform's native certificate store.
    pub fn with_system_store(&self) -> Result<Self, TlsError> {
        let mut context = self.clone();
        context.roots.extend(load_system_roots()?);
        Ok(context)
    }

    /// Trust anchors.
    pub fn roots(&self) -> &[CertificateDer<'static>] {
        &self.roots
    }

    /// Whether the peer's certificate is verified.
    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }
}

impl Default for SslContext {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn load_system_roots() -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let loaded = rustls_native_certs::load_native_certs();
    if !loaded.errors.is_empty() {
        warn!(
            error_count = loaded.errors.len(),
            "system root certificate loading returned partial errors"
        );
    }

    if loaded.certs.is_empty() {
        if let Some(error) = loaded.errors.first() {
            return Err(TlsError::SystemStore(error.to_string()));
        }
    }

    Ok(loaded.certs)
}

/// Establishes TLS trust for a connection to a single host.
#[derive(Debug, Clone)]
pub struct Verifier {
    hostname: String,
    context: Arc<SslContext>,
}

impl Verifier {
    /// Create a verifier for `hostname` using `context`.
    pub fn new(hostname: impl Into<String>, context: Arc<SslContext>) -> Self {
        Self {
            hostname: hostname.into(),
            context,
        }
    }

    /// The host this verifier authenticates.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The SSL context used for verification.
    pub fn ssl_context(&self) -> &Arc<SslContext> {
        &self.context
    }

    /// Whether connections set up by this verifier authenticate the peer.
    pub fn verify_peer(&self) -> bool {
        self.context.verify_peer
    }

    /// Can a connection established by `other` be used in place of one established by `self`?
    pub fn reusable(&self, other: &Verifier) -> bool {
        Arc::ptr_eq(&self.context, &other.context) || *self.context == *other.context
    }

    /// Perform the TLS handshake over `stream`.
    pub async fn setup_connection<S>(
        &self,
        stream: S,
        params: &TlsParameters,
    ) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let config = self.client_config(params)?;
        let host = self
            .hostname
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let name =
            ServerName::try_from(host).map_err(|_| TlsError::InvalidHostname(self.hostname.clone()))?;

        TlsConnector::from(Arc::new(config))
            .connect(name, stream)
            .await
            .map_err(|error| self.handle_connection_error(error))
    }

    /// Translate a handshake failure into a trust error naming the host.
    pub fn handle_connection_error(&self, error: io::Error) -> TlsError {
        let certificate = error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .and_then(|inner| match inner {
                rustls::Error::InvalidCertificate(cert) => Some(cert.clone()),
                _ => None,
            });

        match certificate {
            Some(cert) if is_name_mismatch(&cert) => TlsError::HostnameMismatch {
                host: self.hostname.clone(),
            },
            Some(cert) => TlsError::CertificateVerify {
                host: self.hostname.clone(),
                reason: format!("{cert:?}"),
            },
            None => TlsError::Handshake(error),
        }
    }

    fn client_config(&self, params: &TlsParameters) -> Result<ClientConfig, TlsError> {
        let mut provider = rustls::crypto::ring::default_provider();
        if !params.cipher_suites.is_empty() {
            provider.cipher_suites.retain(|suite| {
                let name = format!("{:?}", suite.suite());
                params.cipher_suites.iter().any(|allowed| *allowed == name)
            });

            if provider.cipher_suites.is_empty() {
                return Err(TlsError::NoCipherSuites(params.cipher_suites.join(",")));
            }
        }
        let provider = Arc::new(provider);

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(params.protocol_versions())
            .map_err(TlsError::Config)?;

        let mut config = if self.context.verify_peer {
            let mut roots = RootCertStore::empty();
            let (added, ignored) = roots.add_parsable_certificates(self.context.roots.iter().cloned());
            debug!(%added, %ignored, host = %self.hostname, "loaded trust anchors");
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(insecure::NoVerification::new(provider)))
                .with_no_client_auth()
        };

        config.alpn_protocols.push(b"http/1.1".to_vec());
        Ok(config)
    }
}

fn is_name_mismatch(error: &CertificateError) -> bool {
    matches!(error, CertificateError::NotValidForName)
        || format!("{error:?}").starts_with("NotValidForName")
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Verifier: Send, Sync, Clone);
    assert_impl_all!(TlsError: std::error::Error, Send, Sync);

    fn cert(bytes: &'static [u8]) -> CertificateDer<'static> {
        CertificateDer::from(bytes.to_vec())
    }

    #[test]
    fn reusable_same_context() {
        let context = Arc::new(SslContext::new(vec![cert(b"ca")]));
        let a = Verifier::new("puppet", context.clone());
        let b = Verifier::new("other", context);
        assert!(a.reusable(&b));
    }

    #[test]
    fn reusable_equivalent_context() {
        let a = Verifier::new("puppet", Arc::new(SslContext::new(vec![cert(b"ca")])));
        let b = Verifier::new("puppet", Arc::new(SslContext::new(vec![cert(b"ca")])));
        assert!(a.reusable(&b));
    }

    #[test]
    fn not_reusable_different_trust() {
        let a = Verifier::new("puppet", Arc::new(SslContext::new(vec![cert(b"ca")])));
        let b = Verifier::new("puppet", Arc::new(SslContext::new(vec![cert(b"other")])));
        assert!(!a.reusable(&b));

        let c = Verifier::new("puppet", Arc::new(SslContext::insecure()));
        assert!(!c.reusable(&Verifier::new("puppet", Arc::new(SslContext::default()))));
    }

    #[test]
    fn hostname_mismatch_message() {
        let verifier = Verifier::new("puppet.example.com", Arc::new(SslContext::default()));
        let error = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::NotValidForName),
        );
        let error = verifier.handle_connection_error(error);
        assert_eq!(
            error.to_string(),
            "Server hostname 'puppet.example.com' did not match server certificate"
        );
    }

    #[test]
    fn verify_failure_message() {
        let verifier = Verifier::new("puppet", Arc::new(SslContext::default()));
        let error = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer),
        );
        let error = verifier.handle_connection_error(error);
        assert_eq!(
            error.to_string(),
            "certificate verify failed [UnknownIssuer] for puppet"
        );
    }

    #[test]
    fn other_handshake_failure() {
        let verifier = Verifier::new("puppet", Arc::new(SslContext::default()));
        let error = verifier.handle_connection_error(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(error, TlsError::Handshake(_)));
    }

    #[test]
    fn cipher_suite_allow_list() {
        let verifier = Verifier::new("puppet", Arc::new(SslContext::default()));
        let params = TlsParameters {
            cipher_suites: vec!["TLS13_AES_256_GCM_SHA384".into()],
            ..Default::default()
        };
        assert!(verifier.client_config(&params).is_ok());

        let params = TlsParameters {
            cipher_suites: vec!["RC4-MD5".into()],
            ..Default::default()
        };
        assert!(matches!(
            verifier.client_config(&params),
            Err(TlsError::NoCipherSuites(_))
        ));
    }

    #[test]
    fn insecure_config() {
        let verifier = Verifier::new("puppet", Arc::new(SslContext::insecure()));
        let config = verifier
            .client_config(&TlsParameters {
                min_version: TlsVersion::Tls13,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert!(!verifier.verify_peer());
    }
}
