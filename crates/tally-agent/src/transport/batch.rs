use anyhow::Result;
use async_trait::async_trait;
use tally_common::sign::Signer;
use tally_common::types::{Metric, Snapshot};

use super::{dispatch, HttpTarget, Transport};

/// The whole snapshot as one JSON array to `POST /updates`.
pub struct BatchTransport {
    target: HttpTarget,
    signer: Option<Signer>,
}

impl BatchTransport {
    pub fn new(target: HttpTarget, signer: Option<Signer>) -> Self {
        Self { target, signer }
    }
}

#[async_trait]
impl Transport for BatchTransport {
    fn name(&self) -> &'static str {
        "batch"
    }

    async fn send(&self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.is_empty() {
            return Ok(());
        }
        let metrics: Vec<Metric> = match &self.signer {
            Some(signer) => snapshot.iter().cloned().map(|m| signer.signed(m)).collect(),
            None => snapshot.to_vec(),
        };
        dispatch(self.target.post(&["updates"])?.json(&metrics)).await?;
        tracing::debug!(count = metrics.len(), "Batch delivered");
        Ok(())
    }
}
