use crate::config::ServerConfig;
use anyhow::{Context, Result};
use std::sync::Arc;
use tally_common::crypto::Decryptor;
use tally_common::net::Subnet;
use tally_common::sign::Signer;
use tally_storage::db::DbStorage;
use tally_storage::file::FileStorage;
use tally_storage::MetricStorage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn MetricStorage>,
    pub signer: Option<Signer>,
    pub decryptor: Option<Arc<Decryptor>>,
    pub trusted_subnet: Option<Subnet>,
}

impl AppState {
    /// Resolves the signing key, private key and trusted subnet from
    /// `config`.
    pub fn new(config: &ServerConfig, storage: Arc<dyn MetricStorage>) -> Result<Self> {
        let decryptor = match &config.crypto_key {
            Some(path) => Some(Arc::new(
                Decryptor::load(path).with_context(|| format!("failed to load private key {}", path.display()))?,
            )),
            None => None,
        };
        Ok(Self {
            storage,
            signer: Signer::from_config(config.signing_key()),
            decryptor,
            trusted_subnet: config.subnet()?,
        })
    }
}

/// Picks the backend: the database when a DSN is configured, otherwise the
/// snapshot file (or memory when no file is configured). The returned
/// handle is the periodic flush loop, if one was started.
pub async fn open_storage(
    config: &ServerConfig,
    token: CancellationToken,
) -> Result<(Arc<dyn MetricStorage>, Option<JoinHandle<()>>)> {
    if let Some(dsn) = config.database_dsn() {
        let db = DbStorage::connect(dsn).await.context("failed to connect to database")?;
        tracing::info!("Using database storage");
        let storage: Arc<dyn MetricStorage> = Arc::new(db);
        return Ok((storage, None));
    }

    match config.store_path() {
        Some(path) => {
            let file = Arc::new(
                FileStorage::open(path, config.store_interval(), config.restore)
                    .with_context(|| format!("failed to open store file {}", path.display()))?,
            );
            let flush = file.spawn_flush(config.store_interval(), token);
            let storage: Arc<dyn MetricStorage> = file;
            tracing::info!(
                path = %path.display(),
                interval_secs = config.store_interval_secs,
                restore = config.restore,
                "Using file storage"
            );
            Ok((storage, flush))
        }
        None => {
            tracing::info!("Using in-memory storage");
            let storage: Arc<dyn MetricStorage> = Arc::new(FileStorage::in_memory());
            Ok((storage, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_common::types::{Metric, MetricKind};

    #[tokio::test]
    async fn file_backend_restores_previous_run() {
        let temp = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            store_file: temp.path().join("metrics.json").to_string_lossy().to_string(),
            store_interval_secs: 0,
            ..ServerConfig::default()
        };

        let (storage, flush) = open_storage(&config, CancellationToken::new()).await.unwrap();
        assert!(flush.is_none());
        storage.update(Metric::counter("PollCount", 4)).await.unwrap();
        storage.close().await.unwrap();

        let (storage, _) = open_storage(&config, CancellationToken::new()).await.unwrap();
        let restored = storage.get("PollCount", MetricKind::Counter).await.unwrap();
        assert_eq!(restored.and_then(|m| m.delta()), Some(4));
    }

    #[tokio::test]
    async fn empty_store_file_uses_memory() {
        let config = ServerConfig {
            store_file: String::new(),
            ..ServerConfig::default()
        };
        let (storage, flush) = open_storage(&config, CancellationToken::new()).await.unwrap();
        assert!(flush.is_none());
        assert!(storage.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn state_rejects_unreadable_private_key() {
        let config = ServerConfig {
            crypto_key: Some("/nonexistent/private_key.pem".into()),
            ..ServerConfig::default()
        };
        let storage: Arc<dyn MetricStorage> = Arc::new(FileStorage::in_memory());
        assert!(AppState::new(&config, storage).is_err());
    }
}
