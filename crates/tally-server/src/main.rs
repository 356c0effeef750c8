use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use tally_common::build_info;
use tally_common::crypto::{self, DEFAULT_KEY_BITS};
use tally_common::proto::metrics_server::MetricsServer;
use tally_server::app;
use tally_server::config::ServerConfig;
use tally_server::grpc::MetricsServiceImpl;
use tally_server::state::{self, AppState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, Server as TonicServer, ServerTlsConfig};
use tracing_subscriber::EnvFilter;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  tally-server [config.toml]              Start the server");
    eprintln!("  tally-server gen-keys <dir> [bits]      Write an RSA key pair for encrypted updates");
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("Failed to install default CryptoProvider: {e:?}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tally=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("gen-keys") => {
            let dir = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("gen-keys requires a <dir> argument")
            })?;
            let bits = match args.get(3) {
                Some(raw) => raw.parse().with_context(|| format!("invalid key size: {raw}"))?,
                None => DEFAULT_KEY_BITS,
            };
            run_gen_keys(Path::new(dir), bits)
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/server.toml");
            run_server(config_path).await
        }
    }
}

fn run_gen_keys(dir: &Path, bits: usize) -> Result<()> {
    crypto::write_keypair(dir, bits)?;
    tracing::info!(
        dir = %dir.display(),
        bits,
        private = crypto::PRIVATE_KEY_FILE,
        public = crypto::PUBLIC_KEY_FILE,
        "Key pair written"
    );
    Ok(())
}

fn grpc_tls(config: &ServerConfig) -> Result<Option<ServerTlsConfig>> {
    let (Some(cert), Some(key)) = (&config.grpc_tls.cert, &config.grpc_tls.key) else {
        return Ok(None);
    };
    let cert = std::fs::read(cert).with_context(|| format!("failed to read {}", cert.display()))?;
    let key = std::fs::read(key).with_context(|| format!("failed to read {}", key.display()))?;
    Ok(Some(ServerTlsConfig::new().identity(Identity::from_pem(cert, key))))
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;

    tracing::info!(
        version = build_info::VERSION,
        build_date = build_info::date(),
        build_commit = build_info::commit(),
        "tally-server starting"
    );

    let token = CancellationToken::new();
    let (storage, flush) = state::open_storage(&config, token.clone()).await?;
    let state = AppState::new(&config, storage.clone())?;

    tracing::info!(
        signed = state.signer.is_some(),
        encrypted = state.decryptor.is_some(),
        trusted_subnet = ?state.trusted_subnet.map(|s| s.to_string()),
        "Security settings"
    );

    let mut grpc_handle = None;
    if let Some(grpc_address) = &config.grpc_address {
        let grpc_addr: SocketAddr = grpc_address
            .parse()
            .with_context(|| format!("invalid grpc_address {grpc_address}"))?;
        let mut builder = TonicServer::builder();
        if let Some(tls) = grpc_tls(&config)? {
            builder = builder.tls_config(tls)?;
        }
        let router = builder.add_service(MetricsServer::new(MetricsServiceImpl::new(state.clone())));
        let shutdown = token.clone();
        tracing::info!(addr = %grpc_addr, tls = config.grpc_tls.cert.is_some(), "gRPC server listening");
        grpc_handle = Some(tokio::spawn(async move {
            if let Err(e) = router.serve_with_shutdown(grpc_addr, shutdown.cancelled_owned()).await {
                tracing::error!(error = %e, "gRPC server error");
            }
        }));
    }

    let listener = tokio::net::TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("failed to bind {}", config.address))?;
    tracing::info!(addr = %config.address, "HTTP server listening");
    let http_app = app::build_http_app(state);
    let shutdown = token.clone();
    let mut http_handle = tokio::spawn(async move {
        axum::serve(listener, http_app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    tokio::select! {
        result = &mut http_handle => {
            match result {
                Ok(Ok(())) => tracing::warn!("HTTP server exited"),
                Ok(Err(e)) => tracing::error!(error = %e, "HTTP server error"),
                Err(e) => tracing::error!(error = %e, "HTTP server task failed"),
            }
        }
        _ = signal::ctrl_c() => {
            tracing::info!("Shutting down gracefully");
        }
    }

    token.cancel();
    if !http_handle.is_finished() {
        if let Err(e) = http_handle.await {
            tracing::error!(error = %e, "HTTP server task failed");
        }
    }
    if let Some(handle) = grpc_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "gRPC server task failed");
        }
    }
    if let Some(handle) = flush {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Flush task failed");
        }
    }
    storage.close().await.context("failed to close storage")?;
    tracing::info!("tally-server stopped");
    Ok(())
}
