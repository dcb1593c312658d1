//! TLS listener setup
//!
//! Loads certificates and keys from PEM files and builds the acceptor for
//! the secure MQTT listener.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsFileConfig;

#[derive(Debug)]
pub enum TlsError {
    Io(std::io::Error),
    Certificate(String),
    PrivateKey(String),
    Config(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::Certificate(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKey(msg) => write!(f, "Private key error: {}", msg),
            TlsError::Config(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::Certificate(format!(
            "No certificates found in {}",
            path
        )));
    }

    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| TlsError::PrivateKey(format!("Failed to parse private key: {}", e)))
}

fn load_ca_certs(path: &str) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs(path)? {
        root_store
            .add(cert)
            .map_err(|e| TlsError::Certificate(format!("Failed to add CA certificate: {}", e)))?;
    }
    Ok(root_store)
}

/// Build a TlsAcceptor from the configured certificate files
pub fn load_tls_config(config: &TlsFileConfig) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(&config.cert)?;
    let key = load_private_key(&config.key)?;

    let server_config = if config.require_client_cert {
        let ca_path = config.ca_cert.as_ref().ok_or_else(|| {
            TlsError::Config("ca_cert is required when require_client_cert is true".to_string())
        })?;

        let root_store = load_ca_certs(ca_path)?;
        let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| TlsError::Config(format!("Failed to build client verifier: {}", e)))?;

        ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("Failed to build TLS config: {}", e)))?
    } else {
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("Failed to build TLS config: {}", e)))?
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
