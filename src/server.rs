//! HTTP surface: Prometheus scrape endpoint, health and diagnostics.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tracing::{debug, error, instrument};

use crate::diagnostics::DiagnosticsSource;

/// Buffer capacity for metrics encoding.
const BUFFER_CAP: usize = 256 * 1024;

pub struct AppState {
    pub registry: Registry,
    pub diagnostics: DiagnosticsSource,
}

pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/diagnostics", get(diagnostics_handler))
        .with_state(state)
}

#[derive(Debug)]
pub enum MetricsError {
    EncodingFailed,
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
    }
}

/// Encodes the registry. Series are already current: collection runs on
/// the poll timer, never on scrape.
#[instrument(skip(state))]
pub async fn metrics_handler(State(state): State<SharedState>) -> Result<String, MetricsError> {
    let families = state.registry.gather();
    let mut buffer = Vec::with_capacity(BUFFER_CAP);
    TextEncoder::new().encode(&families, &mut buffer).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        MetricsError::EncodingFailed
    })?;
    debug!("Encoded {} metric families ({} bytes)", families.len(), buffer.len());
    String::from_utf8(buffer).map_err(|e| {
        error!("Metrics output is not UTF-8: {}", e);
        MetricsError::EncodingFailed
    })
}

#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let report = state.diagnostics.health();
    let status = if report.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

#[instrument(skip(state))]
pub async fn diagnostics_handler(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.diagnostics.snapshot())
}
