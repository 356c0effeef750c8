use crate::logging::TraceId;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::fmt::Write;
use tally_common::sign::verify_optional;
use tally_common::types::{Metric, MetricKind, MetricLookup};
use tally_storage::StorageError;

/// Error body of the JSON endpoints.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub err_code: i32,
    pub err_msg: String,
    pub trace_id: String,
}

fn to_custom_error_code(code: &str) -> i32 {
    match code {
        "bad_request" => 1001,
        "not_found" => 1004,
        "signature_mismatch" => 1006,
        "forbidden" => 1007,
        "decrypt_failed" => 1008,
        "storage_error" => 1501,
        "internal_error" => 1500,
        _ => 1999,
    }
}

pub fn error_response(status: StatusCode, trace_id: &str, code: &str, msg: &str) -> Response {
    (
        status,
        Json(ApiError {
            err_code: to_custom_error_code(code),
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
        }),
    )
        .into_response()
}

/// Maps a storage failure onto the JSON envelope. Validation failures are
/// the client's fault, everything else is logged and reported as 500.
fn storage_error_response(trace_id: &str, err: StorageError) -> Response {
    match err {
        StorageError::InvalidMetric { .. } => {
            error_response(StatusCode::BAD_REQUEST, trace_id, "bad_request", &err.to_string())
        }
        other => {
            tracing::error!(trace_id = %trace_id, error = %other, "Storage operation failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                trace_id,
                "storage_error",
                "storage operation failed",
            )
        }
    }
}

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

pub fn routes(state: &AppState) -> Router<AppState> {
    let router = Router::new()
        .route("/", get(list_metrics))
        .route("/ping", get(ping))
        .route("/update", post(update_json))
        .route("/updates", post(update_batch))
        .route("/update/{kind}/{id}/{value}", post(update_path))
        .route("/value", post(value_json))
        .route("/value/{kind}/{id}", get(value_path));

    if state.decryptor.is_some() {
        router.route("/update_enc", post(update_encrypted))
    } else {
        router
    }
}

/// `POST /update/{kind}/{id}/{value}`. Path updates carry no hash.
async fn update_path(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((kind, id, value)): Path<(String, String, String)>,
) -> Response {
    let kind: MetricKind = match kind.parse() {
        Ok(kind) => kind,
        Err(e) => return text(StatusCode::NOT_IMPLEMENTED, e.to_string()),
    };
    let metric = match Metric::from_parts(kind, &id, &value) {
        Ok(metric) => metric,
        Err(e) => return text(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match state.storage.update(metric).await {
        Ok(stored) => text(StatusCode::OK, stored.value.to_string()),
        Err(StorageError::InvalidMetric { reason, .. }) => text(StatusCode::BAD_REQUEST, reason),
        Err(e) => {
            tracing::error!(trace_id = %trace_id.0, error = %e, "Storage operation failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "storage operation failed")
        }
    }
}

/// Decodes, verifies, merges and answers with the signed merged metric.
async fn apply_single(state: &AppState, trace_id: &str, body: &[u8]) -> Response {
    let metric: Metric = match serde_json::from_slice(body) {
        Ok(metric) => metric,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                trace_id,
                "bad_request",
                &format!("invalid metric: {e}"),
            )
        }
    };
    if !verify_optional(state.signer.as_ref(), &metric) {
        tracing::warn!(trace_id = %trace_id, metric = %metric.key(), "Signature mismatch");
        return error_response(
            StatusCode::BAD_REQUEST,
            trace_id,
            "signature_mismatch",
            "hash does not match metric",
        );
    }

    match state.storage.update(metric).await {
        Ok(stored) => Json(sign_outgoing(state, stored)).into_response(),
        Err(e) => storage_error_response(trace_id, e),
    }
}

fn sign_outgoing(state: &AppState, metric: Metric) -> Metric {
    match &state.signer {
        Some(signer) => signer.signed(metric),
        None => metric.unsigned(),
    }
}

async fn update_json(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    apply_single(&state, &trace_id, &body).await
}

/// `POST /update_enc`: RSA-OAEP ciphertext of the JSON metric.
async fn update_encrypted(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let Some(decryptor) = state.decryptor.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, &trace_id, "not_found", "encryption is not enabled");
    };
    let plaintext = match decryptor.decrypt(&body) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            tracing::warn!(trace_id = %trace_id.0, error = %e, "Failed to decrypt payload");
            return error_response(
                StatusCode::BAD_REQUEST,
                &trace_id,
                "decrypt_failed",
                "cannot decrypt payload",
            );
        }
    };
    apply_single(&state, &trace_id, &plaintext).await
}

/// `POST /updates`: all-or-nothing. One bad hash rejects the batch.
async fn update_batch(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let metrics: Vec<Metric> = match serde_json::from_slice(&body) {
        Ok(metrics) => metrics,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &trace_id,
                "bad_request",
                &format!("invalid metric batch: {e}"),
            )
        }
    };
    if let Some(bad) = metrics
        .iter()
        .find(|m| !verify_optional(state.signer.as_ref(), m))
    {
        tracing::warn!(trace_id = %trace_id.0, metric = %bad.key(), "Signature mismatch in batch");
        return error_response(
            StatusCode::BAD_REQUEST,
            &trace_id,
            "signature_mismatch",
            &format!("hash does not match metric {}", bad.key()),
        );
    }

    match state.storage.updates(metrics).await {
        Ok(applied) => Json(json!({ "applied": applied })).into_response(),
        Err(e) => storage_error_response(&trace_id, e),
    }
}

async fn value_path(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let kind: MetricKind = match kind.parse() {
        Ok(kind) => kind,
        Err(e) => return text(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state.storage.get(&id, kind).await {
        Ok(Some(metric)) => text(StatusCode::OK, metric.value.to_string()),
        Ok(None) => text(StatusCode::NOT_FOUND, format!("metric {kind}/{id} not found")),
        Err(e) => {
            tracing::error!(trace_id = %trace_id.0, error = %e, "Storage operation failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "storage operation failed")
        }
    }
}

async fn value_json(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let lookup: MetricLookup = match serde_json::from_slice(&body) {
        Ok(lookup) => lookup,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &trace_id,
                "bad_request",
                &format!("invalid lookup: {e}"),
            )
        }
    };
    match state.storage.get(&lookup.id, lookup.kind).await {
        Ok(Some(metric)) => Json(sign_outgoing(&state, metric)).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            &trace_id,
            "not_found",
            &format!("metric {}/{} not found", lookup.kind, lookup.id),
        ),
        Err(e) => storage_error_response(&trace_id, e),
    }
}

async fn ping(Extension(trace_id): Extension<TraceId>, State(state): State<AppState>) -> Response {
    match state.storage.check().await {
        Ok(()) => text(StatusCode::OK, "ok"),
        Err(e) => {
            tracing::error!(trace_id = %trace_id.0, error = %e, "Storage health check failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
        }
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Renders metrics ordered by kind, then name.
pub fn render_index(mut metrics: Vec<Metric>) -> String {
    metrics.sort_by_key(Metric::key);
    let mut page = String::from("<!DOCTYPE html>\n<html><head><title>tally</title></head><body>\n<ul>\n");
    for metric in &metrics {
        let _ = writeln!(
            page,
            "<li>name: {} value: {}</li>",
            escape_html(&metric.id),
            escape_html(&metric.value.to_string())
        );
    }
    page.push_str("</ul>\n</body></html>\n");
    page
}

async fn list_metrics(Extension(trace_id): Extension<TraceId>, State(state): State<AppState>) -> Response {
    match state.storage.get_all().await {
        Ok(metrics) => Html(render_index(metrics)).into_response(),
        Err(e) => storage_error_response(&trace_id, e),
    }
}
