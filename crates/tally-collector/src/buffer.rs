use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Mutex;

use tally_common::types::{Metric, MetricKey, Snapshot};

/// Mutable metric buffer shared by the collection tasks.
#[derive(Debug, Default)]
pub struct MetricBuffer {
    metrics: Mutex<BTreeMap<MetricKey, Metric>>,
}

impl MetricBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds samples in: gauges overwrite, counters accumulate.
    pub fn apply(&self, samples: Vec<Metric>) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        for sample in samples {
            match metrics.entry(sample.key()) {
                Entry::Occupied(mut slot) => slot.get_mut().absorb(sample.value),
                Entry::Vacant(slot) => {
                    slot.insert(sample);
                }
            }
        }
    }

    /// Deep copy of the current contents.
    pub fn snapshot(&self) -> Snapshot {
        let metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        Snapshot::new(metrics.clone())
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
