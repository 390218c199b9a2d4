//! TLS upgrade of an established connection.
//!
//! Both roles run the handshake over the socket the plaintext handshake
//! already used, then swap the connection's [`DualModeStream`] to TLS.
//! A negotiated session must be encrypted (a cipher suite was agreed) and
//! signed (the handshake completed under a negotiated protocol version,
//! so records are AEAD-protected) or the upgrade fails.
//!
//! Server certificates are checked by a [`CertificateValidator`], which
//! sees the outcome of WebPKI chain verification and makes the final call.
//!
//! [`DualModeStream`]: crate::net::stream::DualModeStream

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{VerifierBuilderError, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, CipherSuite, ClientConfig, CommonState, DigitallySignedStruct,
    ProtocolVersion, RootCertStore, ServerConfig, SignatureScheme,
};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::net::connection::Connection;
use crate::net::stream::StreamError;

/// Default deadline for a TLS handshake.
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while configuring or performing a TLS upgrade.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error("invalid trust anchors: {0}")]
    TrustAnchors(#[from] VerifierBuilderError),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),

    #[error("TLS handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("negotiated session is not encrypted")]
    NotEncrypted,

    #[error("negotiated session is not signed")]
    NotSigned,

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Security parameters of an upgraded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSecurity {
    pub protocol: ProtocolVersion,
    pub cipher_suite: CipherSuite,
}

impl SessionSecurity {
    fn inspect(state: &CommonState) -> Result<Self, TlsError> {
        if state.is_handshaking() {
            return Err(TlsError::NotSigned);
        }
        let suite = state.negotiated_cipher_suite().ok_or(TlsError::NotEncrypted)?;
        let protocol = state.protocol_version().ok_or(TlsError::NotSigned)?;
        Ok(Self {
            protocol,
            cipher_suite: suite.suite(),
        })
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server-side TLS material: certificate chain, key and handshake deadline.
#[derive(Clone)]
pub struct ServerTls {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl ServerTls {
    pub fn new(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        let config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
        })
    }

    /// Load a PEM certificate chain and private key from disk.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        Self::new(load_certs(cert_path)?, load_private_key(key_path)?)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl fmt::Debug for ServerTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTls")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

/// What a [`CertificateValidator`] gets to look at.
#[derive(Debug)]
pub struct ValidationContext<'a> {
    pub end_entity: &'a CertificateDer<'a>,
    pub intermediates: &'a [CertificateDer<'a>],
    pub server_name: &'a ServerName<'a>,
    /// Why WebPKI chain verification failed, if it did.
    pub chain_error: Option<&'a rustls::Error>,
}

/// Final say on whether a server certificate is accepted.
///
/// Closures of the matching signature implement this trait.
pub trait CertificateValidator: Send + Sync {
    fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), rustls::Error>;
}

impl<F> CertificateValidator for F
where
    F: Fn(&ValidationContext<'_>) -> Result<(), rustls::Error> + Send + Sync,
{
    fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), rustls::Error> {
        self(ctx)
    }
}

/// Rejects any certificate that failed chain verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictValidator;

impl CertificateValidator for StrictValidator {
    fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), rustls::Error> {
        match ctx.chain_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Accepts every certificate, logging the ones that failed verification.
///
/// This provides no server authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveValidator;

impl CertificateValidator for PermissiveValidator {
    fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), rustls::Error> {
        if let Some(err) = ctx.chain_error {
            tracing::warn!(
                server_name = ?ctx.server_name,
                error = %err,
                "Accepting server certificate that failed verification"
            );
        }
        Ok(())
    }
}

struct CallbackVerifier {
    chain: Option<Arc<WebPkiServerVerifier>>,
    validator: Arc<dyn CertificateValidator>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackVerifier")
            .field("has_roots", &self.chain.is_some())
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let chain_result = match &self.chain {
            Some(verifier) => verifier
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .map(|_| ()),
            None => Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)),
        };

        let ctx = ValidationContext {
            end_entity,
            intermediates,
            server_name,
            chain_error: chain_result.as_ref().err(),
        };
        self.validator.validate(&ctx)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client-side TLS material: expected server name and certificate policy.
#[derive(Clone)]
pub struct ClientTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    handshake_timeout: Duration,
}

impl ClientTls {
    /// `roots` may be empty, in which case every chain fails verification
    /// and the outcome rests entirely with `validator`.
    pub fn new(
        server_name: &str,
        roots: RootCertStore,
        validator: Arc<dyn CertificateValidator>,
    ) -> Result<Self, TlsError> {
        let provider = crypto_provider();
        let chain = if roots.is_empty() {
            None
        } else {
            Some(WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone()).build()?)
        };

        let verifier = CallbackVerifier {
            chain,
            validator,
            provider: provider.clone(),
        };

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
            handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }
}

impl fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

/// Authenticate as server and route the connection through TLS.
pub async fn upgrade_as_server(conn: &Connection, tls: &ServerTls) -> Result<SessionSecurity, TlsError> {
    let tcp = conn.stream().detach_plain().await?;
    let stream = match tokio::time::timeout(tls.handshake_timeout, tls.acceptor.accept(tcp)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(TlsError::Handshake(e)),
        Err(_) => return Err(TlsError::Timeout(tls.handshake_timeout)),
    };

    let security = SessionSecurity::inspect(stream.get_ref().1)?;
    conn.stream().install_tls(TlsStream::Server(stream)).await?;

    tracing::debug!(
        connection_id = %conn.id(),
        protocol = ?security.protocol,
        cipher_suite = ?security.cipher_suite,
        "TLS established as server"
    );
    Ok(security)
}

/// Authenticate as client and route the connection through TLS.
pub async fn upgrade_as_client(conn: &Connection, tls: &ClientTls) -> Result<SessionSecurity, TlsError> {
    let tcp = conn.stream().detach_plain().await?;
    let connect = tls.connector.connect(tls.server_name.clone(), tcp);
    let stream = match tokio::time::timeout(tls.handshake_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(TlsError::Handshake(e)),
        Err(_) => return Err(TlsError::Timeout(tls.handshake_timeout)),
    };

    let security = SessionSecurity::inspect(stream.get_ref().1)?;
    conn.stream().install_tls(TlsStream::Client(stream)).await?;

    tracing::debug!(
        connection_id = %conn.id(),
        protocol = ?security.protocol,
        cipher_suite = ?security.cipher_suite,
        "TLS established as client"
    );
    Ok(security)
}

/// Load every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Build a root store from every certificate in a PEM file.
pub fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn open_pem(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}
