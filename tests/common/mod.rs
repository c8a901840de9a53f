//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ndt_responder::ResponderConfig;
use tokio::net::TcpStream;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Plaintext config bound to loopback only.
pub fn plain_config() -> ResponderConfig {
    ResponderConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..ResponderConfig::default()
    }
}

pub fn shared(config: ResponderConfig) -> Arc<ResponderConfig> {
    Arc::new(config)
}

/// Self-signed certificate for `localhost`, written as PEM files.
pub struct TestCert {
    pub cert: rcgen::Certificate,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

pub fn write_test_cert(dir: &Path) -> TestCert {
    let key_pair = rcgen::KeyPair::generate().expect("generate key pair");
    let params =
        rcgen::CertificateParams::new(vec!["localhost".to_string()]).expect("certificate params");
    let cert = params.self_signed(&key_pair).expect("self-sign certificate");

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.pem()).expect("write cert");
    std::fs::write(&key_path, key_pair.serialize_pem()).expect("write key");

    TestCert {
        cert,
        cert_path,
        key_path,
    }
}

/// Poll until connecting to `port` is refused.
pub async fn wait_refused(port: u16) -> bool {
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
