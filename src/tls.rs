//! TLS configuration for encrypted responders.
//!
//! Loads a PEM certificate chain and private key from disk and builds a
//! `rustls::ServerConfig` with the ring provider. No client certificates
//! are requested; HTTP/2 and HTTP/1.1 are offered over ALPN.

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring::default_provider;
use rustls::pki_types::pem::{self, PemObject};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::ResponderError;

const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Read every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ResponderError> {
    let pem_error = |source: pem::Error| ResponderError::Pem {
        path: path.to_path_buf(),
        source,
    };
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(pem_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_error)?;
    if certs.is_empty() {
        return Err(ResponderError::MissingCertificate {
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ResponderError> {
    PrivateKeyDer::from_pem_file(path).map_err(|source| ResponderError::Pem {
        path: path.to_path_buf(),
        source,
    })
}

/// Build a `rustls::ServerConfig` from a certificate and key on disk.
pub fn build_server_config(cert_file: &Path, key_file: &Path) -> Result<ServerConfig, ResponderError> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    Ok(config)
}

pub fn build_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor, ResponderError> {
    let config = build_server_config(cert_file, key_file)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
