//! Metric collection for the tally agent.
//!
//! Each [`Collector`] samples one group of metrics on behalf of a
//! [`CollectionTask`]. The [`sync::Synchronizer`] runs every collector on its
//! own timer, folds the samples into a shared [`buffer::MetricBuffer`] and
//! publishes a [`Snapshot`](tally_common::types::Snapshot) once every task
//! has reported since the previous publish.

pub mod buffer;
pub mod runtime;
pub mod sync;
pub mod system;

use anyhow::Result;
use tally_common::types::Metric;

/// The closed set of tasks that must all report before a snapshot is
/// published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionTask {
    /// Process runtime metrics and the poll counter.
    General,
    /// Host memory and per-core CPU utilisation.
    Additional,
}

impl std::fmt::Display for CollectionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectionTask::General => write!(f, "general"),
            CollectionTask::Additional => write!(f, "additional"),
        }
    }
}

/// A metric sampler owned by one collection task.
pub trait Collector: Send + Sync {
    fn task(&self) -> CollectionTask;

    /// Collector name used in logs.
    fn name(&self) -> &str;

    /// Samples current values. Runs outside the buffer lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying system query fails.
    fn collect(&mut self) -> Result<Vec<Metric>>;
}
