use crate::state::AppState;
use std::net::IpAddr;
use tally_common::net::REAL_IP_HEADER;
use tally_common::proto::metrics_server::Metrics;
use tally_common::proto::{MetricProto, SaveAck};
use tally_common::sign::verify_optional;
use tally_common::types::Metric;
use tally_storage::StorageError;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status, Streaming};

/// Messages accepted in one stream before it is refused.
pub const DEFAULT_MAX_STREAM_METRICS: usize = 100_000;

pub struct MetricsServiceImpl {
    state: AppState,
    max_metrics: usize,
}

impl MetricsServiceImpl {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            max_metrics: DEFAULT_MAX_STREAM_METRICS,
        }
    }

    pub fn with_limit(mut self, max_metrics: usize) -> Self {
        self.max_metrics = max_metrics;
        self
    }

    /// Same rule as the HTTP middleware: missing or unparsable addresses
    /// pass, addresses outside the subnet are refused.
    fn check_subnet(&self, metadata: &MetadataMap) -> Result<(), Status> {
        let Some(subnet) = self.state.trusted_subnet else {
            return Ok(());
        };
        let Some(raw) = metadata.get(REAL_IP_HEADER).and_then(|v| v.to_str().ok()) else {
            return Ok(());
        };
        match raw.trim().parse::<IpAddr>() {
            Ok(ip) if !subnet.contains(ip) => {
                tracing::warn!(ip = %ip, subnet = %subnet, "Stream rejected: untrusted address");
                Err(Status::permission_denied("address is outside the trusted subnet"))
            }
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!(value = %raw, "Unparsable x-real-ip metadata, skipping subnet check");
                Ok(())
            }
        }
    }

    fn decode(&self, proto: MetricProto) -> Result<Metric, Status> {
        let metric = Metric::try_from(proto).map_err(|e| Status::invalid_argument(e.to_string()))?;
        if !verify_optional(self.state.signer.as_ref(), &metric) {
            tracing::warn!(metric = %metric.key(), "Signature mismatch in stream");
            return Err(Status::invalid_argument(format!(
                "hash does not match metric {}",
                metric.key()
            )));
        }
        Ok(metric)
    }
}

#[tonic::async_trait]
impl Metrics for MetricsServiceImpl {
    /// Buffers the whole stream, then applies it as one batch. Any bad
    /// message rejects the stream before storage is touched.
    async fn save_metrics(&self, request: Request<Streaming<MetricProto>>) -> Result<Response<SaveAck>, Status> {
        self.check_subnet(request.metadata())?;

        let mut stream = request.into_inner();
        let mut metrics = Vec::new();
        while let Some(proto) = stream.message().await? {
            if metrics.len() >= self.max_metrics {
                tracing::warn!(limit = self.max_metrics, "Metric stream exceeds limit");
                return Err(Status::resource_exhausted(format!(
                    "stream carries more than {} metrics",
                    self.max_metrics
                )));
            }
            metrics.push(self.decode(proto)?);
        }
        let received = metrics.len();

        let applied = self.state.storage.updates(metrics).await.map_err(|e| match e {
            StorageError::InvalidMetric { .. } => Status::invalid_argument(e.to_string()),
            other => {
                tracing::error!(error = %other, "Failed to store streamed metrics");
                Status::internal("storage operation failed")
            }
        })?;

        tracing::debug!(received, applied, "Metric stream stored");
        Ok(Response::new(SaveAck {
            applied: u32::try_from(applied).unwrap_or(u32::MAX),
        }))
    }
}
