//! TOML configuration for a test responder.
//!
//! A responder is configured once and never mutated afterwards: the
//! transport mode (plaintext or TLS with a certificate/key pair), the
//! address the ephemeral listener binds, the advisory deadline, and the
//! capacity of the signaling channel.

use std::ffi::OsStr;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Default lifetime of the deadline token created at start.
pub const DEFAULT_DEADLINE_MS: u64 = 15_000;

/// Environment variable naming a TOML file to load.
pub const CONFIG_ENV_VAR: &str = "RESPONDER_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// Serve over TLS using `cert_file` and `key_file`.
    pub tls: bool,
    /// PEM certificate chain. Only read when `tls` is set.
    pub cert_file: PathBuf,
    /// PEM private key. Only read when `tls` is set.
    pub key_file: PathBuf,
    /// Address the ephemeral listener binds; port is always OS-assigned.
    pub bind_address: IpAddr,
    /// Milliseconds until the deadline token is cancelled.
    pub deadline_ms: u64,
    /// Signals buffered before a handler's send waits for the reader.
    /// Zero makes every send a handoff that completes only once the
    /// control loop has received the value.
    pub signal_capacity: usize,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            tls: false,
            cert_file: PathBuf::new(),
            key_file: PathBuf::new(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            deadline_ms: DEFAULT_DEADLINE_MS,
            signal_capacity: 0,
        }
    }
}

impl ResponderConfig {
    /// Plaintext responder with defaults.
    pub fn plain() -> Self {
        Self::default()
    }

    /// TLS responder serving the given certificate and key.
    pub fn with_tls(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            tls: true,
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ..Self::default()
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Check option combinations that would only fail later, inside the
    /// serving task.
    pub fn validate(&self) -> Result<()> {
        if self.tls {
            if self.cert_file.as_os_str().is_empty() {
                anyhow::bail!("tls is enabled but cert_file is empty");
            }
            if self.key_file.as_os_str().is_empty() {
                anyhow::bail!("tls is enabled but key_file is empty");
            }
        }
        Ok(())
    }

    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), tls = config.tls, "loaded responder configuration");
        Ok(config)
    }

    /// Load from the file named by `RESPONDER_CONFIG`, falling back to
    /// defaults when the variable is unset or the file is unusable.
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(std::env::var_os(CONFIG_ENV_VAR).as_deref())
    }

    fn load_or_default_from(env_path: Option<&OsStr>) -> Self {
        if let Some(env_path) = env_path {
            let path = Path::new(env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "RESPONDER_CONFIG set but file could not be loaded, using defaults"
                    );
                    return Self::default();
                }
            }
        }

        debug!("no responder config file, using compiled-in defaults");
        Self::default()
    }
}
