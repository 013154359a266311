//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{parse_acct, webfinger_response};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /nodeinfo/2.0
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/nodeinfo/2.0", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// `host[:port]` of the public base URL
fn local_host(state: &AppState) -> Result<String, AppError> {
    let base = url::Url::parse(&state.config.federation.base_url)
        .map_err(|e| AppError::Config(format!("federation.base_url: {}", e)))?;
    let host = base
        .host_str()
        .ok_or_else(|| AppError::Config("federation.base_url has no host".to_string()))?;
    Ok(match base.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:name@host
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let (name, host) = parse_acct(&query.resource)?;

    if !host.eq_ignore_ascii_case(&local_host(&state)?) {
        return Err(AppError::NotFound(format!("host {}", host)));
    }

    let actor = state.engine.actor(name).await?;
    let jrd = webfinger_response(&actor.name, host, &actor.iri);

    Ok((
        [(header::CONTENT_TYPE, "application/jrd+json; charset=utf-8")],
        Json(jrd),
    )
        .into_response())
}

/// GET /.well-known/nodeinfo
///
/// Returns links to nodeinfo documents.
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    let base_url = state.config.federation.normalized_base_url();
    Json(serde_json::json!({
        "links": [
            {
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
                "href": format!("{}nodeinfo/2.0", base_url)
            }
        ]
    }))
}

/// GET /nodeinfo/2.0
async fn nodeinfo(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let users = state.engine.registry().store().list_actors().await?.len();

    Ok(Json(serde_json::json!({
        "version": "2.0",
        "software": {
            "name": "fedserve",
            "version": env!("CARGO_PKG_VERSION")
        },
        "protocols": ["activitypub"],
        "services": {
            "inbound": [],
            "outbound": []
        },
        "openRegistrations": false,
        "usage": {
            "users": {
                "total": users
            }
        },
        "metadata": {}
    })))
}
