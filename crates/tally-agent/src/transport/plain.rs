use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tally_common::types::Snapshot;

use super::{dispatch, for_each_metric, HttpTarget, Transport};

/// Legacy channel: one `POST /update/{type}/{id}/{value}` per metric.
pub struct PlainTransport {
    target: HttpTarget,
}

impl PlainTransport {
    pub fn new(target: HttpTarget) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Transport for PlainTransport {
    fn name(&self) -> &'static str {
        "plain"
    }

    async fn send(&self, snapshot: &Snapshot) -> Result<()> {
        for_each_metric(self.name(), snapshot, |metric| async move {
            let value = metric.value.to_string();
            let request = self
                .target
                .post(&["update", metric.kind().as_str(), &metric.id, &value])?
                .header(CONTENT_TYPE, "text/plain");
            dispatch(request).await
        })
        .await
    }
}
