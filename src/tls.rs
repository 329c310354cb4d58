//! TLS Material Module
//!
//! Loads PEM certificate, key, and trust-root material from the configured
//! paths and builds the rustls server/client configurations. Authentication
//! is one-way everywhere: each server presents a certificate and each
//! client validates it against the configured root; there is no client
//! certificate.

use crate::{ProxyError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

/// Installs the ring crypto provider. Safe to call more than once; later
/// calls are ignored.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Reads every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| {
        ProxyError::ConfigError(format!(
            "failed to open certificate file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut reader = std::io::BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| {
            ProxyError::ConfigError(format!(
                "failed to parse certificates in {}: {}",
                path.display(),
                e
            ))
        })?;
    if certs.is_empty() {
        return Err(ProxyError::ConfigError(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Reads the first private key in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| {
        ProxyError::ConfigError(format!(
            "failed to open private key file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            ProxyError::ConfigError(format!(
                "failed to parse private key in {}: {}",
                path.display(),
                e
            ))
        })?
        .ok_or_else(|| {
            ProxyError::ConfigError(format!("no private key found in {}", path.display()))
        })
}

/// Builds the acceptor a listening tier uses to terminate client sessions.
pub fn server_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    info!(
        "TLS server material loaded: cert={} key={}",
        cert_path.display(),
        key_path.display()
    );
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds the connector used for outbound sessions, trusting exactly the
/// configured root.
pub fn client_connector(ca_path: &Path) -> Result<TlsConnector> {
    let roots = load_certs(ca_path)?;
    let mut root_store = rustls::RootCertStore::empty();
    for cert in roots {
        root_store.add(cert).map_err(|e| {
            ProxyError::ConfigError(format!(
                "rejected trust root from {}: {}",
                ca_path.display(),
                e
            ))
        })?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    info!("TLS trust root loaded: ca={}", ca_path.display());
    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_cert_file_is_config_error() {
        let err = load_certs(Path::new("/nonexistent/server.crt")).unwrap_err();
        assert!(matches!(err, ProxyError::ConfigError(_)));
    }

    #[test]
    fn test_missing_key_file_is_config_error() {
        let err = load_private_key(Path::new("/nonexistent/server.key")).unwrap_err();
        assert!(matches!(err, ProxyError::ConfigError(_)));
    }

    #[test]
    fn test_empty_pem_has_no_certs() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not pem material").unwrap();
        let err = load_certs(file.path()).unwrap_err();
        assert!(matches!(err, ProxyError::ConfigError(_)));
    }

    #[test]
    fn test_empty_pem_has_no_key() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not pem material").unwrap();
        let err = load_private_key(file.path()).unwrap_err();
        assert!(matches!(err, ProxyError::ConfigError(_)));
    }
}
