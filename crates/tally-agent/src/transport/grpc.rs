use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::Path;
use tally_common::net::REAL_IP_HEADER;
use tally_common::proto::metrics_client::MetricsClient;
use tally_common::proto::MetricProto;
use tally_common::sign::Signer;
use tally_common::types::Snapshot;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};

use super::{Transport, REQUEST_TIMEOUT};

/// Client-streaming `tally.Metrics/SaveMetrics`: one message per metric,
/// then wait for the acknowledgement.
pub struct GrpcTransport {
    client: MetricsClient<Channel>,
    signer: Option<Signer>,
    real_ip: Option<MetadataValue<Ascii>>,
}

impl GrpcTransport {
    /// Builds a lazily connecting channel. Must run inside a Tokio runtime.
    pub fn new(endpoint: &str, tls_ca: Option<&Path>, signer: Option<Signer>, real_ip: Option<IpAddr>) -> Result<Self> {
        let mut endpoint = Endpoint::from_shared(endpoint.to_string())
            .with_context(|| format!("invalid gRPC endpoint {endpoint}"))?
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(REQUEST_TIMEOUT);
        if let Some(ca_path) = tls_ca {
            let pem = std::fs::read(ca_path)
                .with_context(|| format!("failed to read CA certificate {}", ca_path.display()))?;
            endpoint = endpoint.tls_config(ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem)))?;
        }
        let real_ip = match real_ip {
            Some(ip) => Some(ip.to_string().parse::<MetadataValue<Ascii>>()?),
            None => None,
        };
        Ok(Self {
            client: MetricsClient::new(endpoint.connect_lazy()),
            signer,
            real_ip,
        })
    }

    pub fn from_channel(channel: Channel, signer: Option<Signer>) -> Self {
        Self {
            client: MetricsClient::new(channel),
            signer,
            real_ip: None,
        }
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    fn name(&self) -> &'static str {
        "grpc"
    }

    async fn send(&self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.is_empty() {
            return Ok(());
        }
        let messages: Vec<MetricProto> = snapshot
            .iter()
            .map(|metric| match &self.signer {
                Some(signer) => MetricProto::from(&signer.signed(metric.clone())),
                None => MetricProto::from(metric),
            })
            .collect();
        let count = messages.len();

        let mut request = tonic::Request::new(futures::stream::iter(messages));
        if let Some(ip) = &self.real_ip {
            request.metadata_mut().insert(REAL_IP_HEADER, ip.clone());
        }
        let ack = self.client.clone().save_metrics(request).await?.into_inner();
        tracing::debug!(sent = count, applied = ack.applied, "Stream delivered");
        Ok(())
    }
}
