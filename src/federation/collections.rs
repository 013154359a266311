//! ActivityStreams collections served for local actors
//!
//! - Outbox: stored activities in append order
//! - Peers: followers and following, sorted by IRI

use serde_json::{Value, json};

use super::activity::{ACTIVITY_STREAMS_CONTEXT, without_context};
use crate::data::{ActorRegistry, OUTBOX_PAGE_SIZE};
use crate::error::AppError;

/// Which peer set to list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCollection {
    Followers,
    Following,
}

impl PeerCollection {
    /// Parse the `:collection` path segment.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "followers" => Some(PeerCollection::Followers),
            "following" => Some(PeerCollection::Following),
            _ => None,
        }
    }
}

/// Parse a `page` query value; anything non-numeric reads as page 1.
pub fn parse_page(raw: Option<&str>) -> Option<usize> {
    raw.map(|value| value.trim().parse::<usize>().unwrap_or(1).max(1))
}

fn last_page(total: usize) -> usize {
    total.div_ceil(OUTBOX_PAGE_SIZE).max(1)
}

fn page_links(page_doc: &mut Value, collection_id: &str, page: usize, total: usize) {
    if page > 1 {
        page_doc["prev"] = json!(format!("{}?page={}", collection_id, page - 1));
    }
    if page < last_page(total) {
        page_doc["next"] = json!(format!("{}?page={}", collection_id, page + 1));
    }
}

/// The outbox collection, or one page of it.
pub async fn outbox_collection(
    registry: &ActorRegistry,
    name: &str,
    page: Option<usize>,
) -> Result<Value, AppError> {
    let actor = registry.get(name).await?;
    let store = registry.store();
    let id = actor.outbox_iri();
    let total = store.outbox_len(name).await?;

    let Some(page) = page else {
        return Ok(json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "OrderedCollection",
            "id": id,
            "totalItems": total,
            "first": format!("{}?page=1", id),
            "last": format!("{}?page={}", id, last_page(total)),
        }));
    };

    let mut items = Vec::new();
    for iri in store.read_outbox_page(name, page, OUTBOX_PAGE_SIZE).await? {
        let Some(hash) = actor.item_hash(&iri) else {
            tracing::warn!(actor = %name, entry = %iri, "Outbox entry is not a local item");
            continue;
        };
        match store.load_item(name, hash).await {
            Ok(item) => items.push(without_context(&item)),
            Err(e) => {
                tracing::warn!(actor = %name, entry = %iri, error = %e, "Skipping unreadable outbox item");
            }
        }
    }

    let mut doc = json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "type": "OrderedCollectionPage",
        "id": format!("{}?page={}", id, page),
        "partOf": id,
        "totalItems": total,
        "orderedItems": items,
    });
    page_links(&mut doc, &id, page, total);
    Ok(doc)
}

/// The followers or following collection, or one page of it.
pub async fn peers_collection(
    registry: &ActorRegistry,
    name: &str,
    collection: PeerCollection,
    page: Option<usize>,
) -> Result<Value, AppError> {
    let actor = registry.get(name).await?;
    let (id, peers) = match collection {
        PeerCollection::Followers => (actor.followers_iri(), actor.followers()),
        PeerCollection::Following => (actor.following_iri(), actor.following()),
    };
    let total = peers.len();

    let Some(page) = page else {
        return Ok(json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "OrderedCollection",
            "id": id,
            "totalItems": total,
            "first": format!("{}?page=1", id),
        }));
    };

    // BTreeMap keys are already sorted
    let items: Vec<&String> = peers
        .keys()
        .skip((page - 1).saturating_mul(OUTBOX_PAGE_SIZE))
        .take(OUTBOX_PAGE_SIZE)
        .collect();

    let mut doc = json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "type": "OrderedCollectionPage",
        "id": format!("{}?page={}", id, page),
        "partOf": id,
        "totalItems": total,
        "orderedItems": items,
    });
    page_links(&mut doc, &id, page, total);
    Ok(doc)
}

/// A stored item by hash.
pub async fn item(registry: &ActorRegistry, name: &str, hash: &str) -> Result<Value, AppError> {
    registry.get(name).await?;
    registry.store().load_item(name, hash).await
}
