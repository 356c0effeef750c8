//! Metric storage for the tally server.
//!
//! Two interchangeable engines implement [`MetricStorage`]:
//! [`file::FileStorage`] keeps metrics in memory and snapshots them to a
//! newline-delimited JSON file, [`db::DbStorage`] keeps them in a SQL table
//! through SeaORM. Both apply the same merge rule: gauges are overwritten,
//! counters accumulate.

pub mod db;
mod entities;
pub mod error;
pub mod file;


use async_trait::async_trait;
use tally_common::types::{Metric, MetricKind, MetricValue};

pub use error::{Result, StorageError};

/// Persistence backend for metrics keyed by `(id, kind)`.
///
/// Implementations are shared between the HTTP and RPC ingress paths, so
/// conflicting writes to the same key must be serialised.
#[async_trait]
pub trait MetricStorage: Send + Sync {
    /// Merges one metric and returns the stored record.
    async fn update(&self, metric: Metric) -> Result<Metric>;

    /// Merges a batch all-or-nothing. Returns the number of metrics applied.
    async fn updates(&self, metrics: Vec<Metric>) -> Result<usize>;

    /// Exact lookup on both id and kind.
    async fn get(&self, id: &str, kind: MetricKind) -> Result<Option<Metric>>;

    /// Every stored metric, order unspecified.
    async fn get_all(&self) -> Result<Vec<Metric>>;

    /// Liveness probe.
    async fn check(&self) -> Result<()>;

    /// Persists pending state and releases resources.
    async fn close(&self) -> Result<()>;
}

pub(crate) fn validate(metric: &Metric) -> Result<()> {
    if metric.id.is_empty() {
        return Err(StorageError::InvalidMetric {
            id: metric.id.clone(),
            reason: "metric id must not be empty",
        });
    }
    if let MetricValue::Gauge(v) = metric.value {
        if !v.is_finite() {
            return Err(StorageError::InvalidMetric {
                id: metric.id.clone(),
                reason: "gauge value must be finite",
            });
        }
    }
    Ok(())
}

pub(crate) fn validate_all(metrics: &[Metric]) -> Result<()> {
    metrics.iter().try_for_each(validate)
}
