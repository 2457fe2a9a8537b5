//! TLS Material and Mutual-TLS Credentials
//!
//! Loads the CA, server certificate and server key for one channel and
//! turns them into a tonic `ServerTlsConfig` that requires and verifies a
//! client certificate on every handshake.
//!
//! # Load order
//!
//! 1. Server identity: certificate chain + private key (PEM).
//! 2. Trust store: every certificate in the CA file.
//! 3. Credential: a rustls server config is built from both, with a
//!    mandatory client verifier. This catches key/certificate mismatches
//!    before any port is bound.
//!
//! Every step returns a [`TlsError`]; nothing is logged and skipped.
//!
//! # File layout
//!
//! Client credentials for *this* node acting as a client elsewhere live in
//! a directory as `client.pem` and `client-key.pem`. They are handed to
//! enrolling nodes; the server role never reads them.

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

/// Client certificate file name inside a client certificate directory.
pub const CLIENT_CERT_FILE: &str = "client.pem";

/// Client key file name inside a client certificate directory.
pub const CLIENT_KEY_FILE: &str = "client-key.pem";

// =============================================================================
// Errors
// =============================================================================

/// TLS material errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// Only one of server certificate / key was configured.
    #[error("server certificate and key must both be set or both be empty")]
    PartialIdentity,

    /// Neither server certificate nor key was configured.
    #[error("server identity is not configured")]
    IdentityNotConfigured,

    /// Server certificate or key missing, unreadable or malformed.
    #[error("failed to load certificate material from {}: {reason}", path.display())]
    CertificateLoad {
        /// Offending file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// CA file unreadable or holds no usable certificate.
    #[error("failed to build trust store from {}: {reason}", path.display())]
    TrustStore {
        /// Offending file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Material loaded but could not be combined into a credential.
    #[error("failed to build mutual-TLS credential: {0}")]
    Credential(String),
}

// =============================================================================
// TLS Material (paths)
// =============================================================================

/// File locations for one channel's TLS material. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    ca_cert: PathBuf,
    ca_key: Option<PathBuf>,
    identity: Option<(PathBuf, PathBuf)>,
    client: Option<(PathBuf, PathBuf)>,
}

impl TlsMaterial {
    /// Create material with a CA and a complete server identity.
    #[must_use]
    pub fn new(
        ca_cert: impl Into<PathBuf>,
        server_cert: impl Into<PathBuf>,
        server_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ca_cert: ca_cert.into(),
            ca_key: None,
            identity: Some((server_cert.into(), server_key.into())),
            client: None,
        }
    }

    /// Create material from optional paths as they come out of configuration.
    ///
    /// # Errors
    ///
    /// [`TlsError::PartialIdentity`] if exactly one of `server_cert` and
    /// `server_key` is set.
    pub fn from_parts(
        ca_cert: PathBuf,
        ca_key: Option<PathBuf>,
        server_cert: Option<PathBuf>,
        server_key: Option<PathBuf>,
        client_cert_dir: Option<&Path>,
    ) -> Result<Self, TlsError> {
        let identity = match (server_cert, server_key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            _ => return Err(TlsError::PartialIdentity),
        };

        Ok(Self {
            ca_cert,
            ca_key,
            identity,
            client: client_cert_dir.map(client_paths),
        })
    }

    /// Record the CA key path. Kept for reference; the server never reads it.
    #[must_use]
    pub fn with_ca_key(mut self, ca_key: impl Into<PathBuf>) -> Self {
        self.ca_key = Some(ca_key.into());
        self
    }

    /// Point the client credential paths at `<dir>/client.pem` and
    /// `<dir>/client-key.pem`.
    #[must_use]
    pub fn with_client_cert_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.client = Some(client_paths(dir.as_ref()));
        self
    }

    /// CA certificate path.
    #[must_use]
    pub fn ca_cert(&self) -> &Path {
        &self.ca_cert
    }

    /// CA key path, if recorded.
    #[must_use]
    pub fn ca_key(&self) -> Option<&Path> {
        self.ca_key.as_deref()
    }

    /// Server certificate path.
    #[must_use]
    pub fn server_cert(&self) -> Option<&Path> {
        self.identity.as_ref().map(|(cert, _)| cert.as_path())
    }

    /// Server key path.
    #[must_use]
    pub fn server_key(&self) -> Option<&Path> {
        self.identity.as_ref().map(|(_, key)| key.as_path())
    }

    /// Client certificate path.
    #[must_use]
    pub fn client_cert(&self) -> Option<&Path> {
        self.client.as_ref().map(|(cert, _)| cert.as_path())
    }

    /// Client key path.
    #[must_use]
    pub fn client_key(&self) -> Option<&Path> {
        self.client.as_ref().map(|(_, key)| key.as_path())
    }

    /// Read and parse every file the server role needs.
    ///
    /// # Errors
    ///
    /// - [`TlsError::IdentityNotConfigured`] when no server identity is set.
    /// - [`TlsError::CertificateLoad`] for an unreadable or malformed
    ///   certificate chain or key.
    /// - [`TlsError::TrustStore`] for an unreadable CA file or one with no
    ///   parseable certificate.
    pub fn load(&self) -> Result<LoadedMaterial, TlsError> {
        let (cert_path, key_path) = self
            .identity
            .as_ref()
            .ok_or(TlsError::IdentityNotConfigured)?;

        let cert_pem = read_file(cert_path, certificate_load)?;
        let cert_chain =
            parse_certs(&cert_pem).map_err(|reason| certificate_load(cert_path, reason))?;

        let key_pem = read_file(key_path, certificate_load)?;
        let key = parse_key(&key_pem).map_err(|reason| certificate_load(key_path, reason))?;

        let ca_pem = read_file(&self.ca_cert, trust_store)?;
        let ca_certs =
            parse_certs(&ca_pem).map_err(|reason| trust_store(&self.ca_cert, reason))?;

        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| trust_store(&self.ca_cert, e.to_string()))?;
        }

        tracing::debug!(
            ca = %self.ca_cert.display(),
            server_cert = %cert_path.display(),
            chain_len = cert_chain.len(),
            trust_anchors = roots.len(),
            "Loaded TLS material"
        );

        Ok(LoadedMaterial {
            cert_pem,
            key_pem,
            ca_pem,
            cert_chain,
            key,
            roots,
        })
    }
}

fn client_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (dir.join(CLIENT_CERT_FILE), dir.join(CLIENT_KEY_FILE))
}

fn certificate_load(path: &Path, reason: String) -> TlsError {
    TlsError::CertificateLoad {
        path: path.to_path_buf(),
        reason,
    }
}

fn trust_store(path: &Path, reason: String) -> TlsError {
    TlsError::TrustStore {
        path: path.to_path_buf(),
        reason,
    }
}

fn read_file(path: &Path, on_err: fn(&Path, String) -> TlsError) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|e| on_err(path, e.to_string()))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, String> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    if certs.is_empty() {
        return Err("no PEM certificates found".to_string());
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, String> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "no PEM private key found".to_string())
}

// =============================================================================
// Loaded Material
// =============================================================================

/// Parsed TLS material, read-only and shared by every connection.
pub struct LoadedMaterial {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    ca_pem: Vec<u8>,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: RootCertStore,
}

impl LoadedMaterial {
    /// Number of certificates in the server chain.
    #[must_use]
    pub fn chain_len(&self) -> usize {
        self.cert_chain.len()
    }

    /// Number of CA certificates in the trust store.
    #[must_use]
    pub fn trust_anchor_count(&self) -> usize {
        self.roots.len()
    }
}

impl std::fmt::Debug for LoadedMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedMaterial")
            .field("chain_len", &self.chain_len())
            .field("trust_anchors", &self.trust_anchor_count())
            .field("key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Mutual-TLS Credential
// =============================================================================

/// Server credential that presents the server certificate and requires a
/// client certificate signed by the configured CA.
#[derive(Debug, Clone)]
pub struct MtlsCredential {
    tls: ServerTlsConfig,
    trust_anchors: usize,
}

impl MtlsCredential {
    /// Load `material` and build the credential.
    ///
    /// # Errors
    ///
    /// Any [`TlsError`] from loading or from combining the material.
    pub fn from_material(material: &TlsMaterial) -> Result<Self, TlsError> {
        Self::build(&material.load()?)
    }

    /// Build the credential from already-loaded material.
    ///
    /// # Errors
    ///
    /// [`TlsError::Credential`] if the key does not match the certificate,
    /// or the trust store cannot back a client verifier.
    pub fn build(loaded: &LoadedMaterial) -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        // Client auth is mandatory: the verifier is never built with
        // allow_unauthenticated().
        let roots = Arc::new(loaded.roots.clone());
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(&provider))
            .build()
            .map_err(|e| TlsError::Credential(e.to_string()))?;

        rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Credential(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(loaded.cert_chain.clone(), loaded.key.clone_key())
            .map_err(|e| TlsError::Credential(e.to_string()))?;

        let tls = ServerTlsConfig::new()
            .identity(Identity::from_pem(&loaded.cert_pem, &loaded.key_pem))
            .client_ca_root(Certificate::from_pem(&loaded.ca_pem))
            .client_auth_optional(false);

        Ok(Self {
            tls,
            trust_anchors: loaded.trust_anchor_count(),
        })
    }

    /// Number of CAs client certificates are verified against.
    #[must_use]
    pub const fn trust_anchors(&self) -> usize {
        self.trust_anchors
    }

    /// Consume into the tonic server TLS config.
    #[must_use]
    pub fn into_server_tls_config(self) -> ServerTlsConfig {
        self.tls
    }
}

// =============================================================================
// Tests
// =============================================================================
