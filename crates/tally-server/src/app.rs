use crate::api;
use crate::logging;
use crate::middleware::trusted_subnet;
use crate::state::AppState;
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::decompression::RequestDecompressionLayer;

/// Full HTTP surface. Outermost first: gzip handling, request logging,
/// subnet check, handlers.
pub fn build_http_app(state: AppState) -> Router {
    api::routes(&state)
        .layer(axum::middleware::from_fn_with_state(state.clone(), trusted_subnet))
        .with_state(state)
        .layer(axum::middleware::from_fn(logging::request_logging))
        .layer(CompressionLayer::new())
        .layer(RequestDecompressionLayer::new())
}
