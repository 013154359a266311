//! Prometheus metrics endpoint

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::error::AppError;
use crate::metrics::{LOCAL_ACTORS, REGISTRY};

/// GET /metrics
///
/// Refreshes the local actor gauge, then renders every registered metric
/// in the Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> Result<Response, AppError> {
    let actors = state.engine.registry().store().list_actors().await?;
    LOCAL_ACTORS.set(actors.len() as i64);

    let encoder = TextEncoder::new();
    let text = encoder
        .encode_to_string(&REGISTRY.gather())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("encode metrics: {}", e)))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        text,
    )
        .into_response())
}

/// Create metrics router
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
