#![allow(dead_code)]

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tally_common::proto::metrics_server::MetricsServer;
use tally_server::app;
use tally_server::config::ServerConfig;
use tally_server::grpc::MetricsServiceImpl;
use tally_server::state::AppState;
use tally_storage::file::FileStorage;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub const TEST_KEY: &str = "test-signing-key";

pub struct TestContext {
    pub temp_dir: TempDir,
    pub state: AppState,
    pub app: axum::Router,
}

fn ensure_rustls_provider() {
    static RUSTLS_PROVIDER_INIT: OnceLock<()> = OnceLock::new();
    RUSTLS_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// In-memory server. `customize` runs before the state is built and may
/// point paths into `temp_dir`.
pub fn build_test_context_with(customize: impl FnOnce(&TempDir, &mut ServerConfig)) -> Result<TestContext> {
    ensure_rustls_provider();
    let temp_dir = tempfile::tempdir()?;
    let mut config = ServerConfig {
        store_file: String::new(),
        ..ServerConfig::default()
    };
    customize(&temp_dir, &mut config);

    let state = AppState::new(&config, Arc::new(FileStorage::in_memory()))?;
    let app = app::build_http_app(state.clone());
    Ok(TestContext { temp_dir, state, app })
}

pub fn build_test_context() -> Result<TestContext> {
    build_test_context_with(|_, _| {})
}

pub fn build_signed_test_context() -> Result<TestContext> {
    build_test_context_with(|_, config| config.key = Some(TEST_KEY.to_string()))
}

async fn send(app: &axum::Router, req: Request<Body>) -> (StatusCode, Vec<u8>, Option<String>) {
    let resp = app.clone().oneshot(req).await.expect("request should succeed");
    let status = resp.status();
    let trace_id = resp
        .headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let bytes = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    (status, bytes.to_vec(), trace_id)
}

fn parse_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).to_string()))
}

pub async fn request_json(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value, Option<String>) {
    let req_body = body.map(|b| b.to_string()).unwrap_or_default();
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(req_body))
        .expect("request should build");
    let (status, bytes, trace_id) = send(app, req).await;
    (status, parse_body(&bytes), trace_id)
}

pub async fn request_no_body(app: &axum::Router, method: &str, uri: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    let (status, bytes, _) = send(app, req).await;
    (status, String::from_utf8_lossy(&bytes).to_string())
}

pub async fn request_bytes(
    app: &axum::Router,
    uri: &str,
    content_type: &str,
    body: Vec<u8>,
) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", content_type)
        .body(Body::from(body))
        .expect("request should build");
    let (status, bytes, _) = send(app, req).await;
    (status, parse_body(&bytes))
}

/// Serves the RPC service on a loopback port.
pub async fn spawn_grpc(state: AppState) -> SocketAddr {
    spawn_grpc_service(MetricsServiceImpl::new(state)).await
}

pub async fn spawn_grpc_service(service: MetricsServiceImpl) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local addr");
    let incoming = tonic::transport::server::TcpIncoming::from_listener(listener, true, None)
        .expect("incoming should build");
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(MetricsServer::new(service))
            .serve_with_incoming(incoming)
            .await
            .expect("grpc server should run");
    });
    addr
}
