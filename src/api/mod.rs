//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (for federation)
//! - WebFinger and NodeInfo discovery
//! - Metrics (Prometheus)

mod activitypub;
pub mod metrics;
mod wellknown;

use axum::{
    extract::{MatchedPath, Request},
    http::{HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::metrics::HTTP_REQUESTS_TOTAL;

pub use activitypub::activitypub_router;
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;

/// Content type of every ActivityStreams response
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json; charset=utf-8";

/// Serialize `document` with the ActivityStreams content type.
pub fn activity_json(document: serde_json::Value) -> Response {
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static(ACTIVITY_CONTENT_TYPE),
        )],
        axum::Json(document),
    )
        .into_response()
}

/// Count every request by method, route template and status.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), endpoint.as_str(), status.as_str()])
        .inc();
    response
}
