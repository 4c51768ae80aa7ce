//! Server-side TLS for tunnel listeners

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;

use crate::error::{FedError, Result};

/// Build a server config from PEM encoded certificate chain and key
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| FedError::ConfigError(format!("certificate: {:?}", e)))?;
    if certs.is_empty() {
        return Err(FedError::ConfigError("no certificate in PEM".to_string()));
    }
    let key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| FedError::ConfigError(format!("private key: {:?}", e)))?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| FedError::ConfigError(e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| FedError::ConfigError(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Load a server config from PEM files on disk
pub fn load_server_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>> {
    let cert_pem = std::fs::read(cert)?;
    let key_pem = std::fs::read(key)?;
    server_config_from_pem(&cert_pem, &key_pem)
}
