//! ActivityPub endpoints
//!
//! - Actor document
//! - Inbox (activity receiving)
//! - Outbox
//! - Followers/Following collections
//! - Stored items

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, Uri},
    response::Response,
    routing::{get, post},
};
use serde::Deserialize;

use super::activity_json;
use crate::AppState;
use crate::error::AppError;
use crate::federation::{
    self, InboxReceipt, PeerCollection, extract_signature_key_id, key_id_matches_actor,
    verify_signature,
};

/// Create ActivityPub router
///
/// Routes:
/// - GET /:actor - Actor document
/// - POST /:actor/inbox - Inbox
/// - GET /:actor/outbox - Outbox
/// - GET /:actor/peers/:collection - Followers or following
/// - GET /:actor/item/:hash - Stored activity
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/:actor", get(actor))
        .route("/:actor/inbox", post(inbox))
        .route("/:actor/outbox", get(outbox))
        .route("/:actor/peers/:collection", get(peers))
        .route("/:actor/item/:hash", get(item))
}

/// `?page=` query; the raw string is kept so junk reads as page 1
#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<String>,
}

/// GET /:actor
async fn actor(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let actor = state.engine.actor(&name).await?;
    Ok(activity_json(actor.to_document()))
}

/// POST /:actor/inbox
///
/// # Steps
/// 1. Check the addressed actor exists
/// 2. Verify the HTTP Signature (when enabled)
/// 3. Hand the activity to the engine
///
/// Processed and ignored activities both answer 202.
async fn inbox(
    State(state): State<AppState>,
    Path(name): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    state.engine.actor(&name).await?;

    if state.config.federation.verify_signatures {
        verify_inbound(&state, &uri, &headers, &body).await?;
    }

    match state.engine.receive(&name, &body).await? {
        InboxReceipt::Processed { kind, .. } => {
            tracing::debug!(actor = %name, kind, "Inbox activity processed");
        }
        InboxReceipt::Ignored { kind, reason } => {
            tracing::debug!(actor = %name, kind, reason, "Inbox activity ignored");
        }
    }

    Ok(StatusCode::ACCEPTED)
}

/// Check that the request is signed by the activity's actor.
async fn verify_inbound(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    if headers.get("signature").is_none() {
        return Err(AppError::InvalidSignature(
            "missing Signature header".to_string(),
        ));
    }

    let activity: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::MalformedActivity(format!("invalid JSON: {}", e)))?;
    let actor_id = activity
        .get("actor")
        .and_then(federation::activity::reference_id)
        .ok_or_else(|| AppError::MalformedActivity("missing actor".to_string()))?;

    // Reject before fetching any remote key material
    let key_id = extract_signature_key_id(headers)?;
    if !key_id_matches_actor(&key_id, actor_id) {
        return Err(AppError::InvalidSignature(format!(
            "keyId {} does not belong to {}",
            key_id, actor_id
        )));
    }

    let profile = state.engine.resolver().resolve(actor_id).await?;
    let public_key_pem = profile.public_key_pem.ok_or_else(|| {
        AppError::InvalidSignature(format!("{} publishes no public key", actor_id))
    })?;

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    verify_signature("POST", path, headers, Some(body), &public_key_pem).inspect_err(|e| {
        tracing::warn!(actor = %actor_id, error = %e, "Rejected inbox signature");
    })
}

/// GET /:actor/outbox
async fn outbox(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let page = federation::parse_page(query.page.as_deref());
    let collection = federation::outbox_collection(state.engine.registry(), &name, page).await?;
    Ok(activity_json(collection))
}

/// GET /:actor/peers/:collection
async fn peers(
    State(state): State<AppState>,
    Path((name, collection)): Path<(String, String)>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let collection = PeerCollection::from_segment(&collection)
        .ok_or_else(|| AppError::NotFound(format!("collection {}", collection)))?;
    let page = federation::parse_page(query.page.as_deref());
    let document =
        federation::peers_collection(state.engine.registry(), &name, collection, page).await?;
    Ok(activity_json(document))
}

/// GET /:actor/item/:hash
async fn item(
    State(state): State<AppState>,
    Path((name, hash)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let document = federation::item(state.engine.registry(), &name, &hash).await?;
    Ok(activity_json(document))
}
