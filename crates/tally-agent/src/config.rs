use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tally_common::env::{non_empty, parse_secs};

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// HTTP address of the server, `host:port` or a full URL.
    #[serde(default = "default_address")]
    pub address: String,
    /// gRPC endpoint of the server. The RPC transport is off when unset.
    #[serde(default)]
    pub grpc_address: Option<String>,
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Shared HMAC key. Metrics are signed when set.
    #[serde(default)]
    pub key: Option<String>,
    /// Server public key (PEM). Enables the encrypted transport.
    #[serde(default)]
    pub crypto_key: Option<PathBuf>,
    /// CA certificate (PEM) for a TLS gRPC endpoint.
    #[serde(default)]
    pub grpc_tls_ca: Option<PathBuf>,
    #[serde(default)]
    pub transports: TransportToggles,
}

/// Enables the plain HTTP transports individually.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportToggles {
    #[serde(default = "default_true")]
    pub plain: bool,
    #[serde(default = "default_true")]
    pub json: bool,
    #[serde(default = "default_true")]
    pub batch: bool,
}

impl Default for TransportToggles {
    fn default() -> Self {
        Self {
            plain: true,
            json: true,
            batch: true,
        }
    }
}

fn default_address() -> String {
    "localhost:8080".to_string()
}

fn default_report_interval() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            grpc_address: None,
            report_interval_secs: default_report_interval(),
            poll_interval_secs: default_poll_interval(),
            key: None,
            crypto_key: None,
            grpc_tls_ca: None,
            transports: TransportToggles::default(),
        }
    }
}

impl AgentConfig {
    /// Reads the TOML file (defaults when it does not exist), then applies
    /// environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = Self::from_file(Path::new(path))?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| non_empty(lookup(name));

        if let Some(address) = var("ADDRESS") {
            self.address = address;
        }
        if let Some(grpc) = var("GRPC_ADDRESS") {
            self.grpc_address = Some(grpc);
        }
        if let Some(raw) = var("REPORT_INTERVAL") {
            self.report_interval_secs =
                parse_secs(&raw).with_context(|| format!("invalid REPORT_INTERVAL: {raw}"))?;
        }
        if let Some(raw) = var("POLL_INTERVAL") {
            self.poll_interval_secs =
                parse_secs(&raw).with_context(|| format!("invalid POLL_INTERVAL: {raw}"))?;
        }
        if let Some(key) = var("KEY") {
            self.key = Some(key);
        }
        if let Some(path) = var("CRYPTO_KEY") {
            self.crypto_key = Some(PathBuf::from(path));
        }
        if let Some(path) = var("GRPC_TLS_CA") {
            self.grpc_tls_ca = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.report_interval_secs == 0 {
            bail!("report interval must be positive");
        }
        if self.poll_interval_secs == 0 {
            bail!("poll interval must be positive");
        }
        Ok(())
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Base URL for the HTTP transports.
    pub fn base_url(&self) -> String {
        with_scheme(&self.address, false)
    }

    pub fn grpc_endpoint(&self) -> Option<String> {
        self.grpc_address
            .as_deref()
            .map(|addr| with_scheme(addr, self.grpc_tls_ca.is_some()))
    }

    pub fn signing_key(&self) -> Option<&str> {
        self.key.as_deref().filter(|k| !k.is_empty())
    }
}

fn with_scheme(addr: &str, tls: bool) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.contains("://") {
        return addr.to_string();
    }
    let scheme = if tls { "https" } else { "http" };
    format!("{scheme}://{addr}")
}
