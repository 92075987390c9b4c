//! TLS termination for client connections.
//!
//! Certificates and the private key are read from PEM files once at startup.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

/// TLS setup errors.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The certificate file could not be read or parsed.
    #[error("failed to load certificate {path}: {detail}")]
    CertLoad { path: PathBuf, detail: String },

    /// The key file could not be read or parsed.
    #[error("failed to load private key {path}: {detail}")]
    KeyLoad { path: PathBuf, detail: String },

    /// rustls rejected the configuration.
    #[error("invalid TLS configuration: {0}")]
    Config(String),
}

/// Load every certificate from a PEM file, leaf first.
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let cert_err = |detail: String| TlsError::CertLoad {
        path: path.to_path_buf(),
        detail,
    };

    let file = File::open(path).map_err(|e| cert_err(e.to_string()))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| cert_err(e.to_string()))?;

    if certs.is_empty() {
        return Err(cert_err("no certificates found in file".to_string()));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, RSA or EC) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let key_err = |detail: String| TlsError::KeyLoad {
        path: path.to_path_buf(),
        detail,
    };

    let file = File::open(path).map_err(|e| key_err(e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| key_err(e.to_string()))?
        .ok_or_else(|| key_err("no private key found in file".to_string()))
}

/// Build a server-side acceptor from PEM certificate and key files.
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;

    let provider = rustls::crypto::ring::default_provider();
    let config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(format!("failed to set protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(format!("failed to build server config: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
