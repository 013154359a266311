//! Activity documents
//!
//! Inbound documents decode into [`Activity`], a tagged union over the
//! kinds the federation engine acts on. Anything else is carried as
//! [`Activity::Unknown`] so it can be stored or ignored without loss.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;

pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Accepts either a bare IRI or an object carrying an `id`.
fn id_or_object<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(iri) => Ok(iri),
        Value::Object(map) => map
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| de::Error::custom("embedded object has no id")),
        other => Err(de::Error::custom(format!(
            "expected IRI or object, found {}",
            other
        ))),
    }
}

/// IRI of a reference that may be a string or an embedded object.
pub fn reference_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(iri) => Some(iri),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Follow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(deserialize_with = "id_or_object")]
    pub actor: String,
    #[serde(deserialize_with = "id_or_object")]
    pub object: String,
    #[serde(skip)]
    pub raw: Value,
}

impl Follow {
    fn parse(raw: &Value) -> Result<Self, serde_json::Error> {
        let mut follow: Follow = serde_json::from_value(raw.clone())?;
        follow.raw = raw.clone();
        Ok(follow)
    }
}

/// Accept or Reject of an earlier activity
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(deserialize_with = "id_or_object")]
    pub actor: String,
    pub object: Value,
}

impl Response {
    /// The embedded Follow, when the object is a full Follow document.
    pub fn embedded_follow(&self) -> Option<Follow> {
        if self.object.get("type").and_then(Value::as_str) != Some("Follow") {
            return None;
        }
        Follow::parse(&self.object).ok()
    }

    pub fn object_id(&self) -> Option<&str> {
        reference_id(&self.object)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Undo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(deserialize_with = "id_or_object")]
    pub actor: String,
    pub object: Value,
}

impl Undo {
    /// The undone Follow, when the object is an embedded Follow document.
    pub fn undone_follow(&self) -> Option<Follow> {
        if self.object.get("type").and_then(Value::as_str) != Some("Follow") {
            return None;
        }
        Follow::parse(&self.object).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Create {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(deserialize_with = "id_or_object")]
    pub actor: String,
    pub object: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Announce {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(deserialize_with = "id_or_object")]
    pub actor: String,
    #[serde(deserialize_with = "id_or_object")]
    pub object: String,
}

/// Inbound or outbound activity
#[derive(Debug, Clone, PartialEq)]
pub enum Activity {
    Follow(Follow),
    Accept(Response),
    Reject(Response),
    Undo(Undo),
    Create(Create),
    Announce(Announce),
    Unknown(Value),
}

impl Activity {
    /// Decode a raw request body.
    pub fn from_slice(body: &[u8]) -> Result<Self, AppError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| AppError::MalformedActivity(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, AppError> {
        let kind = activity_type(&value)
            .ok_or_else(|| AppError::MalformedActivity("missing type".to_string()))?
            .to_string();

        let malformed =
            |e: serde_json::Error| AppError::MalformedActivity(format!("{}: {}", kind, e));

        let activity = match kind.as_str() {
            "Follow" => Activity::Follow(Follow::parse(&value).map_err(malformed)?),
            "Accept" => Activity::Accept(serde_json::from_value(value).map_err(malformed)?),
            "Reject" => Activity::Reject(serde_json::from_value(value).map_err(malformed)?),
            "Undo" => Activity::Undo(serde_json::from_value(value).map_err(malformed)?),
            "Create" => Activity::Create(serde_json::from_value(value).map_err(malformed)?),
            "Announce" => Activity::Announce(serde_json::from_value(value).map_err(malformed)?),
            _ => Activity::Unknown(value),
        };

        Ok(activity)
    }

    /// Type name used for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Activity::Follow(_) => "Follow",
            Activity::Accept(_) => "Accept",
            Activity::Reject(_) => "Reject",
            Activity::Undo(_) => "Undo",
            Activity::Create(_) => "Create",
            Activity::Announce(_) => "Announce",
            Activity::Unknown(_) => "Unknown",
        }
    }

    /// IRI of the actor that performed the activity.
    pub fn actor(&self) -> Option<&str> {
        match self {
            Activity::Follow(a) => Some(&a.actor),
            Activity::Accept(a) | Activity::Reject(a) => Some(&a.actor),
            Activity::Undo(a) => Some(&a.actor),
            Activity::Create(a) => Some(&a.actor),
            Activity::Announce(a) => Some(&a.actor),
            Activity::Unknown(raw) => raw.get("actor").and_then(reference_id),
        }
    }
}

/// `type` of a document; for JSON-LD arrays, the first entry.
fn activity_type(value: &Value) -> Option<&str> {
    match value.as_object()?.get("type")? {
        Value::String(kind) => Some(kind),
        Value::Array(kinds) => kinds.first().and_then(Value::as_str),
        _ => None,
    }
}

/// Copy of `value` without its `@context`, for embedding.
pub fn without_context(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        map.remove("@context");
    }
    value
}

/// Build ActivityPub activity JSON
pub mod builder {
    use super::{ACTIVITY_STREAMS_CONTEXT, without_context};
    use serde_json::{Value, json};

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept of `follow`, addressed to the follower.
    pub fn accept(id: &str, actor: &str, follow: &Value) -> Value {
        response("Accept", id, actor, follow)
    }

    /// Build a Reject of `follow`, addressed to the follower.
    pub fn reject(id: &str, actor: &str, follow: &Value) -> Value {
        response("Reject", id, actor, follow)
    }

    fn response(kind: &str, id: &str, actor: &str, follow: &Value) -> Value {
        json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": kind,
            "id": id,
            "to": follow.get("actor").cloned().unwrap_or(Value::Null),
            "actor": actor,
            "object": without_context(follow)
        })
    }

    /// Build an Undo activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (undoer)
    /// * `object` - Original activity being undone
    pub fn undo(id: &str, actor: &str, object: &Value) -> Value {
        json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": without_context(object)
        })
    }

    pub fn create(id: &str, actor: &str, object: Value, to: &[&str], cc: &[&str]) -> Value {
        json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    pub fn announce(id: &str, actor: &str, object: &str, to: &[&str], cc: &[&str]) -> Value {
        json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Announce",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build a Note object, optionally as a reply.
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: &str,
        in_reply_to: Option<&str>,
        to: &[&str],
        cc: &[&str],
    ) -> Value {
        let mut note = json!({
            "type": "Note",
            "id": id,
            "url": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "to": to,
            "cc": cc
        });
        if let Some(in_reply_to) = in_reply_to {
            note["inReplyTo"] = json!(in_reply_to);
        }
        note
    }
}
