use anyhow::{Context, Result};
use std::sync::Arc;
use tally_agent::config::AgentConfig;
use tally_agent::delivery::DeliveryManager;
use tally_agent::transport::batch::BatchTransport;
use tally_agent::transport::encrypted::EncryptedTransport;
use tally_agent::transport::grpc::GrpcTransport;
use tally_agent::transport::json::JsonTransport;
use tally_agent::transport::plain::PlainTransport;
use tally_agent::transport::{HttpTarget, Transport};
use tally_collector::runtime::RuntimeCollector;
use tally_collector::sync::Synchronizer;
use tally_collector::system::SystemCollector;
use tally_common::build_info;
use tally_common::crypto::Encryptor;
use tally_common::net;
use tally_common::sign::Signer;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn build_transports(config: &AgentConfig) -> Result<Vec<Box<dyn Transport>>> {
    let real_ip = match net::local_ip() {
        Ok(ip) => Some(ip),
        Err(e) => {
            tracing::warn!(error = %e, "Cannot resolve local address, X-Real-IP will be omitted");
            None
        }
    };
    let signer = Signer::from_config(config.signing_key());
    let target = HttpTarget::new(&config.base_url(), real_ip)?;
    let mut transports: Vec<Box<dyn Transport>> = Vec::new();

    if config.transports.plain {
        transports.push(Box::new(PlainTransport::new(target.clone())));
    }
    if config.transports.json {
        transports.push(Box::new(JsonTransport::new(target.clone(), signer.clone())));
    }
    if config.transports.batch {
        transports.push(Box::new(BatchTransport::new(target.clone(), signer.clone())));
    }
    if let Some(path) = &config.crypto_key {
        let encryptor = Encryptor::load(path).with_context(|| format!("failed to load public key {}", path.display()))?;
        transports.push(Box::new(EncryptedTransport::new(target, encryptor, signer.clone())));
    }
    if let Some(endpoint) = config.grpc_endpoint() {
        transports.push(Box::new(GrpcTransport::new(
            &endpoint,
            config.grpc_tls_ca.as_deref(),
            signer,
            real_ip,
        )?));
    }
    Ok(transports)
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("Failed to install default CryptoProvider: {e:?}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tally=info".parse()?))
        .init();

    tracing::info!(
        version = build_info::VERSION,
        build_date = build_info::date(),
        build_commit = build_info::commit(),
        "tally-agent starting"
    );

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/agent.toml".to_string());
    let config = AgentConfig::load(&config_path)?;

    let transports = build_transports(&config)?;
    let delivery = Arc::new(DeliveryManager::new(transports, config.report_interval()));

    tracing::info!(
        server = %config.base_url(),
        poll_interval_secs = config.poll_interval_secs,
        report_interval_secs = config.report_interval_secs,
        signed = config.signing_key().is_some(),
        "Starting collection and delivery"
    );

    let token = CancellationToken::new();
    let (snapshots, mut handles) = Synchronizer::new(config.poll_interval())
        .with_collector(RuntimeCollector::new()?)
        .with_collector(SystemCollector::new())
        .spawn(token.clone());
    handles.extend(delivery.spawn(snapshots, token.clone()));

    signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");
    token.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Task ended abnormally");
        }
    }
    tracing::info!("tally-agent stopped");
    Ok(())
}
