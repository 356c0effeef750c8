use anyhow::Result;
use async_trait::async_trait;
use tally_common::sign::Signer;
use tally_common::types::Snapshot;

use super::{dispatch, for_each_metric, HttpTarget, Transport};

/// One `POST /update` with a JSON body per metric, signed when a key is set.
pub struct JsonTransport {
    target: HttpTarget,
    signer: Option<Signer>,
}

impl JsonTransport {
    pub fn new(target: HttpTarget, signer: Option<Signer>) -> Self {
        Self { target, signer }
    }
}

#[async_trait]
impl Transport for JsonTransport {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn send(&self, snapshot: &Snapshot) -> Result<()> {
        for_each_metric(self.name(), snapshot, |mut metric| async move {
            if let Some(signer) = &self.signer {
                signer.sign_in_place(&mut metric);
            }
            dispatch(self.target.post(&["update"])?.json(&metric)).await
        })
        .await
    }
}
