//! Delivery channels. Each one encodes a whole snapshot its own way.

pub mod batch;
pub mod encrypted;
pub mod grpc;
pub mod json;
pub mod plain;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{RequestBuilder, Url};
use std::net::IpAddr;
use std::time::Duration;
use tally_common::net::REAL_IP_HEADER;
use tally_common::types::{Metric, Snapshot};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sends the snapshot. Per-metric transports keep going after a
    /// failed metric and report the failure count at the end.
    async fn send(&self, snapshot: &Snapshot) -> Result<()>;
}

/// HTTP client and base URL shared by the HTTP transports.
#[derive(Debug, Clone)]
pub struct HttpTarget {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTarget {
    /// Every request carries `X-Real-IP` when `real_ip` is known.
    pub fn new(base_url: &str, real_ip: Option<IpAddr>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(ip) = real_ip {
            headers.insert(
                HeaderName::from_static(REAL_IP_HEADER),
                HeaderValue::from_str(&ip.to_string())?,
            );
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;
        let base_url = Url::parse(base_url).with_context(|| format!("invalid server address {base_url}"))?;
        Ok(Self { client, base_url })
    }

    /// Base URL with percent-encoded path segments appended.
    pub fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server address {} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn post(&self, segments: &[&str]) -> Result<RequestBuilder> {
        Ok(self.client.post(self.url(segments)?))
    }
}

/// Sends a request and turns non-2xx replies into errors.
pub(crate) async fn dispatch(request: RequestBuilder) -> Result<()> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("server replied {status}: {}", body.trim()));
    }
    Ok(())
}

/// Runs `send_one` for every metric, logging failures without stopping.
pub(crate) async fn for_each_metric<F, Fut>(transport: &'static str, snapshot: &Snapshot, mut send_one: F) -> Result<()>
where
    F: FnMut(Metric) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut failed = 0usize;
    for metric in snapshot.iter() {
        let key = metric.key();
        if let Err(e) = send_one(metric.clone()).await {
            failed += 1;
            tracing::warn!(transport, metric = %key, error = %e, "Failed to deliver metric");
        }
    }
    if failed > 0 {
        return Err(anyhow!("{failed} of {} metrics failed", snapshot.len()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use axum::body::{to_bytes, Body};
    use axum::extract::{Request, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::Router;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    pub struct Captured {
        pub path: String,
        pub headers: HeaderMap,
        pub body: Vec<u8>,
    }

    pub type Store = Arc<Mutex<Vec<Captured>>>;

    async fn capture(State(store): State<Store>, req: Request<Body>) -> StatusCode {
        let path = req.uri().path().to_string();
        let headers = req.headers().clone();
        let body = to_bytes(req.into_body(), usize::MAX).await.unwrap_or_default().to_vec();
        let failing = path.contains("fail");
        store.lock().unwrap().push(Captured { path, headers, body });
        if failing {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    }

    /// Loopback server recording every request. Paths containing `fail`
    /// get a 500.
    pub async fn spawn_capture() -> (String, Store) {
        let store: Store = Arc::default();
        let app = Router::new().fallback(capture).with_state(store.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), store)
    }
}
