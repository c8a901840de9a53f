//! Error types for the test responder.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("test responder was already started")]
    AlreadyStarted,

    #[error("failed to read PEM data from {path}: {source}")]
    Pem {
        path: PathBuf,
        #[source]
        source: rustls_pki_types::pem::Error,
    },

    #[error("no certificates found in {path}")]
    MissingCertificate { path: PathBuf },

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("signal channel closed")]
    SignalClosed,
}
