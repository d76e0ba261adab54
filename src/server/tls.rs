//! TLS setup
//!
//! rustls-based server TLS. In development the certificate pair can be
//! generated on first start (self-signed, localhost subject); clients pin
//! the certificate out of band.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::TlsConfig;
use crate::error::{DbError, Result};

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path)
        .map_err(|e| DbError::Internal(format!("open cert {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| DbError::Internal(format!("parse certs: {}", e)))?;
    if certs.is_empty() {
        return Err(DbError::Internal(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Load a private key from a PEM file (PKCS8, then RSA)
fn load_key(path: &Path) -> Result<PrivateKey> {
    let file = File::open(path)
        .map_err(|e| DbError::Internal(format!("open key {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| DbError::Internal(format!("parse key: {}", e)))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    let file = File::open(path)
        .map_err(|e| DbError::Internal(format!("open key {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let keys = rustls_pemfile::rsa_private_keys(&mut reader)
        .map_err(|e| DbError::Internal(format!("parse key: {}", e)))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    Err(DbError::Internal(format!(
        "no private key in {}",
        path.display()
    )))
}

/// Write a self-signed localhost certificate pair to the configured paths
pub fn generate_self_signed(config: &TlsConfig) -> Result<()> {
    use std::io::Write;

    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .map_err(|e| DbError::Internal(format!("certificate generation: {}", e)))?;

    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| DbError::Internal(format!("certificate serialization: {}", e)))?;
    let key_pem = cert.serialize_private_key_pem();

    if let Some(parent) = config.cert_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(parent) = config.key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    File::create(&config.cert_path)?.write_all(cert_pem.as_bytes())?;
    File::create(&config.key_path)?.write_all(key_pem.as_bytes())?;

    info!(cert = %config.cert_path.display(), "generated self-signed certificate");
    Ok(())
}

/// Build the acceptor, generating a development certificate if allowed
pub fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    if (!config.cert_path.exists() || !config.key_path.exists()) && config.auto_generate {
        generate_self_signed(config)?;
    }

    let certs = load_certs(&config.cert_path)?;
    let key = load_key(&config.key_path)?;

    let server_config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DbError::Internal(format!("TLS config: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
