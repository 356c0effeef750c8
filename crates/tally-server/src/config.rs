use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tally_common::env::{non_empty, parse_bool, parse_secs};
use tally_common::net::Subnet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address.
    #[serde(default = "default_address")]
    pub address: String,
    /// gRPC listen address. The RPC server is off when unset.
    #[serde(default)]
    pub grpc_address: Option<String>,
    /// Shared HMAC key. JSON and RPC metrics must be signed when set.
    #[serde(default)]
    pub key: Option<String>,
    /// Private key (PEM). Enables `POST /update_enc`.
    #[serde(default)]
    pub crypto_key: Option<PathBuf>,
    /// Seconds between file snapshots. Zero saves on every write.
    #[serde(default = "default_store_interval")]
    pub store_interval_secs: u64,
    /// Snapshot file. Empty keeps metrics in memory only.
    #[serde(default = "default_store_file")]
    pub store_file: String,
    #[serde(default = "default_restore")]
    pub restore: bool,
    /// Database URL. Takes precedence over the snapshot file when set.
    #[serde(default)]
    pub database_dsn: Option<String>,
    /// CIDR that `X-Real-IP` must fall into when set.
    #[serde(default)]
    pub trusted_subnet: Option<String>,
    #[serde(default)]
    pub grpc_tls: GrpcTlsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrpcTlsConfig {
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

fn default_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_store_interval() -> u64 {
    300
}

fn default_store_file() -> String {
    "/tmp/devops-metrics-db.json".to_string()
}

fn default_restore() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            grpc_address: None,
            key: None,
            crypto_key: None,
            store_interval_secs: default_store_interval(),
            store_file: default_store_file(),
            restore: default_restore(),
            database_dsn: None,
            trusted_subnet: None,
            grpc_tls: GrpcTlsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads the TOML file (defaults when it does not exist), then applies
    /// environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let path = Path::new(path);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
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
        if let Some(key) = var("KEY") {
            self.key = Some(key);
        }
        if let Some(path) = var("CRYPTO_KEY") {
            self.crypto_key = Some(PathBuf::from(path));
        }
        if let Some(raw) = var("STORE_INTERVAL") {
            self.store_interval_secs =
                parse_secs(&raw).with_context(|| format!("invalid STORE_INTERVAL: {raw}"))?;
        }
        // An explicitly empty STORE_FILE disables persistence.
        if let Some(file) = lookup("STORE_FILE") {
            self.store_file = file.trim().to_string();
        }
        if let Some(raw) = var("RESTORE") {
            self.restore = parse_bool(&raw).with_context(|| format!("invalid RESTORE: {raw}"))?;
        }
        if let Some(dsn) = var("DATABASE_DSN") {
            self.database_dsn = Some(dsn);
        }
        if let Some(cidr) = var("TRUSTED_SUBNET") {
            self.trusted_subnet = Some(cidr);
        }
        if let Some(path) = var("GRPC_TLS_CERT") {
            self.grpc_tls.cert = Some(PathBuf::from(path));
        }
        if let Some(path) = var("GRPC_TLS_KEY") {
            self.grpc_tls.key = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.subnet()?;
        if self.grpc_tls.cert.is_some() != self.grpc_tls.key.is_some() {
            bail!("grpc_tls.cert and grpc_tls.key must be set together");
        }
        Ok(())
    }

    pub fn subnet(&self) -> Result<Option<Subnet>> {
        match self.trusted_subnet.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(cidr) => Ok(Some(cidr.parse().context("invalid trusted_subnet")?)),
            None => Ok(None),
        }
    }

    pub fn signing_key(&self) -> Option<&str> {
        self.key.as_deref().filter(|k| !k.is_empty())
    }

    pub fn database_dsn(&self) -> Option<&str> {
        self.database_dsn.as_deref().filter(|d| !d.trim().is_empty())
    }

    pub fn store_path(&self) -> Option<&Path> {
        (!self.store_file.is_empty()).then(|| Path::new(&self.store_file))
    }

    pub fn store_interval(&self) -> Duration {
        Duration::from_secs(self.store_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_historical_values() {
        let config = ServerConfig::default();
        assert_eq!(config.address, "127.0.0.1:8080");
        assert_eq!(config.store_interval(), Duration::from_secs(300));
        assert_eq!(config.store_path(), Some(Path::new("/tmp/devops-metrics-db.json")));
        assert!(config.restore);
        assert!(config.database_dsn().is_none());
        assert!(config.subnet().unwrap().is_none());
    }

    #[test]
    fn env_overrides_everything() {
        let mut config = ServerConfig::default();
        config
            .apply_env(env(&[
                ("ADDRESS", "0.0.0.0:9000"),
                ("STORE_INTERVAL", "0"),
                ("STORE_FILE", "/var/lib/tally/metrics.json"),
                ("RESTORE", "false"),
                ("DATABASE_DSN", "postgres://localhost/tally"),
                ("TRUSTED_SUBNET", "10.0.0.0/8"),
                ("KEY", "secret"),
            ]))
            .unwrap();
        assert_eq!(config.address, "0.0.0.0:9000");
        assert_eq!(config.store_interval(), Duration::ZERO);
        assert_eq!(config.store_path(), Some(Path::new("/var/lib/tally/metrics.json")));
        assert!(!config.restore);
        assert_eq!(config.database_dsn(), Some("postgres://localhost/tally"));
        assert!(config.subnet().unwrap().is_some());
        assert_eq!(config.signing_key(), Some("secret"));
    }

    #[test]
    fn empty_store_file_disables_persistence() {
        let mut config = ServerConfig::default();
        config.apply_env(env(&[("STORE_FILE", "")])).unwrap();
        assert!(config.store_path().is_none());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = ServerConfig::default();
        assert!(config.apply_env(env(&[("RESTORE", "perhaps")])).is_err());

        let config = ServerConfig {
            trusted_subnet: Some("10.0.0.1".into()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            grpc_tls: GrpcTlsConfig {
                cert: Some("cert.pem".into()),
                key: None,
            },
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_uses_field_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            address = "0.0.0.0:8080"
            grpc_address = "0.0.0.0:3200"

            [grpc_tls]
            cert = "/etc/tally/server.crt"
            key = "/etc/tally/server.key"
            "#,
        )
        .unwrap();
        assert_eq!(config.store_interval_secs, 300);
        assert!(config.validate().is_ok());
        assert_eq!(config.grpc_address.as_deref(), Some("0.0.0.0:3200"));
    }
}
