//! TLS configuration pinned to the PIA certificate authority
//!
//! The port forwarding API is reached through the tunnel gateway, but its
//! certificate is issued for the server hostname. The client therefore
//! trusts exactly one root, the PIA CA, and never the built-in web roots.

use rustls::RootCertStore;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Directory searched for a relative CA path not found in the working directory
pub const OPENVPN_CLIENT_DIR: &str = "/etc/openvpn/client";

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("CA certificate file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read CA certificate {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid PEM data in CA certificate: {0}")]
    InvalidPem(String),

    #[error("No certificates found in CA file")]
    NoCertificates,

    #[error("TLS configuration failed: {0}")]
    TlsError(#[from] rustls::Error),
}

/// Locate the CA certificate file.
///
/// Absolute paths are used as-is. Relative paths are tried against the
/// working directory first, then against `/etc/openvpn/client`.
pub fn resolve_ca_cert_path(path: &Path) -> Result<PathBuf, CertificateError> {
    resolve_ca_cert_path_in(path, Path::new(OPENVPN_CLIENT_DIR))
}

fn resolve_ca_cert_path_in(path: &Path, fallback_dir: &Path) -> Result<PathBuf, CertificateError> {
    if path.is_absolute() {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(CertificateError::NotFound(path.to_path_buf()));
    }

    let local = Path::new(".").join(path);
    if local.exists() {
        return Ok(local);
    }

    let fallback = fallback_dir.join(path);
    if fallback.exists() {
        debug!("CA certificate resolved from {}", fallback_dir.display());
        return Ok(fallback);
    }

    Err(CertificateError::NotFound(path.to_path_buf()))
}

/// Build a root store containing only the certificates in `pem`
pub fn pinned_root_store(pem: &[u8]) -> Result<RootCertStore, CertificateError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::InvalidPem(format!("{:?}", e)))?;

    if certs.is_empty() {
        return Err(CertificateError::NoCertificates);
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert)?;
    }

    Ok(roots)
}

/// Build a rustls client configuration that trusts only the given CA
pub fn pinned_client_config(pem: &[u8]) -> Result<rustls::ClientConfig, CertificateError> {
    let roots = pinned_root_store(pem)?;

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(config)
}

/// Read the CA file and build the pinned client configuration
pub fn load_pinned_client_config(path: &Path) -> Result<rustls::ClientConfig, CertificateError> {
    let pem = std::fs::read(path).map_err(|source| CertificateError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;

    let config = pinned_client_config(&pem)?;
    info!("Pinned TLS trust to CA certificate {}", path.display());

    Ok(config)
}
