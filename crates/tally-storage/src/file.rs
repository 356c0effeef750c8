use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tally_common::types::{Metric, MetricKey, MetricKind};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Result, StorageError};
use crate::{validate, validate_all, MetricStorage};

/// In-memory metric map persisted as newline-delimited JSON.
///
/// With `store_interval` of zero every mutation is saved synchronously;
/// otherwise [`FileStorage::spawn_flush`] saves on a timer and
/// [`MetricStorage::close`] performs the final save.
pub struct FileStorage {
    metrics: Mutex<HashMap<MetricKey, Metric>>,
    path: Option<PathBuf>,
    sync_save: bool,
    // Serialises writers of the snapshot file.
    save_lock: Mutex<()>,
}

impl FileStorage {
    /// Memory-only store, nothing is persisted.
    pub fn in_memory() -> Self {
        Self {
            metrics: Mutex::new(HashMap::new()),
            path: None,
            sync_save: false,
            save_lock: Mutex::new(()),
        }
    }

    /// Opens a store backed by `path`, restoring its content first when
    /// `restore` is set. A missing file restores as empty; a malformed one
    /// is an error.
    pub fn open(path: impl Into<PathBuf>, store_interval: Duration, restore: bool) -> Result<Self> {
        let path = path.into();
        let metrics = if restore {
            let restored = load(&path)?;
            info!(path = %path.display(), count = restored.len(), "Restored metrics from file");
            restored
        } else {
            HashMap::new()
        };

        Ok(Self {
            metrics: Mutex::new(metrics),
            sync_save: store_interval.is_zero(),
            path: Some(path),
            save_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes the whole map to the file, truncating it first.
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let _writer = self.save_lock.lock().unwrap_or_else(|p| p.into_inner());
        let snapshot = self.metrics.lock().unwrap_or_else(|p| p.into_inner()).clone();
        write_snapshot(path, &snapshot)
    }

    /// Periodically saves until `token` is cancelled. Save failures are
    /// logged and the loop keeps going.
    pub fn spawn_flush(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> Option<JoinHandle<()>> {
        if self.path.is_none() || interval.is_zero() {
            return None;
        }
        let storage = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately.
            ticker.tick().await;
            info!(interval = ?interval, "File flush loop started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = storage.save() {
                            error!(error = %e, "Periodic metrics save failed");
                        }
                    }
                }
            }
            info!("File flush loop stopped");
        }))
    }

    /// Runs `change` against the map. In synchronous mode the change is
    /// made on a copy that replaces the map only once it is on disk, so a
    /// failed save leaves memory untouched.
    fn apply<T>(&self, change: impl FnOnce(&mut HashMap<MetricKey, Metric>) -> T) -> Result<T> {
        let path = match self.path.as_deref() {
            Some(path) if self.sync_save => path,
            _ => {
                let mut metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
                return Ok(change(&mut metrics));
            }
        };
        let _writer = self.save_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        let mut next = metrics.clone();
        let out = change(&mut next);
        write_snapshot(path, &next)?;
        *metrics = next;
        Ok(out)
    }

    fn merge(metrics: &mut HashMap<MetricKey, Metric>, metric: Metric) -> Metric {
        match metrics.entry(metric.key()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().absorb(metric.value);
                slot.get().clone()
            }
            Entry::Vacant(slot) => slot.insert(metric.unsigned()).clone(),
        }
    }
}

fn write_snapshot(path: &Path, metrics: &HashMap<MetricKey, Metric>) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut out = BufWriter::new(file);
    for metric in metrics.values() {
        serde_json::to_writer(&mut out, metric)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    tracing::debug!(path = %path.display(), count = metrics.len(), "Saved metrics to file");
    Ok(())
}

fn load(path: &Path) -> Result<HashMap<MetricKey, Metric>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Metrics file not found, starting empty");
            return Ok(HashMap::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut metrics = HashMap::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let metric: Metric = serde_json::from_str(&line).map_err(|source| StorageError::Restore {
            path: path.display().to_string(),
            line: index + 1,
            source,
        })?;
        // Last record for a key wins.
        metrics.insert(metric.key(), metric.unsigned());
    }
    Ok(metrics)
}

#[async_trait]
impl MetricStorage for FileStorage {
    async fn update(&self, metric: Metric) -> Result<Metric> {
        validate(&metric)?;
        self.apply(|metrics| Self::merge(metrics, metric))
    }

    async fn updates(&self, batch: Vec<Metric>) -> Result<usize> {
        validate_all(&batch)?;
        self.apply(|metrics| {
            let applied = batch.len();
            for metric in batch {
                Self::merge(metrics, metric);
            }
            applied
        })
    }

    async fn get(&self, id: &str, kind: MetricKind) -> Result<Option<Metric>> {
        let metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        Ok(metrics.get(&MetricKey::new(id, kind)).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Metric>> {
        let metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        Ok(metrics.values().cloned().collect())
    }

    async fn check(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.save()?;
        if let Some(path) = &self.path {
            info!(path = %path.display(), "Final metrics save complete");
        }
        Ok(())
    }
}
