use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::net::IpAddr;
use tally_common::net::REAL_IP_HEADER;

use crate::api::error_response;
use crate::logging::TraceId;
use crate::state::AppState;

/// Rejects requests whose `X-Real-IP` falls outside the trusted subnet.
///
/// Passes everything through when no subnet is configured. Requests without
/// the header, or with a value that is not an IP address, are let through
/// and logged.
pub async fn trusted_subnet(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let Some(subnet) = state.trusted_subnet else {
        return next.run(req).await;
    };

    let trace_id = req
        .extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_default();

    let raw = req
        .headers()
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    match raw.map(|r| (r, r.parse::<IpAddr>())) {
        None => {
            tracing::debug!(trace_id = %trace_id, "No X-Real-IP header, skipping subnet check");
            next.run(req).await
        }
        Some((_, Ok(ip))) if subnet.contains(ip) => next.run(req).await,
        Some((_, Ok(ip))) => {
            tracing::warn!(trace_id = %trace_id, ip = %ip, subnet = %subnet, "Request rejected: untrusted address");
            error_response(
                StatusCode::FORBIDDEN,
                &trace_id,
                "forbidden",
                "address is outside the trusted subnet",
            )
        }
        Some((value, Err(_))) => {
            tracing::warn!(trace_id = %trace_id, value = %value, "Unparsable X-Real-IP header, skipping subnet check");
            next.run(req).await
        }
    }
}
