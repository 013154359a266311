//! Data models
//!
//! The local [`Actor`] and its on-disk descriptor. Relationship sets are
//! only mutated through transition methods, which keep `following`,
//! `requested` and `rejected` mutually exclusive.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::AppError;
use crate::federation::activity::ACTIVITY_STREAMS_CONTEXT;
use crate::federation::keys::{KeyRing, Signer, key_id_for};

/// Locally generated activity identifier (lowercase ULID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outbound relationship of a local actor towards one remote actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relationship {
    None,
    /// Follow sent, awaiting Accept or Reject; holds the Follow's hash
    Requested(String),
    /// Follow accepted; holds the Follow's hash
    Following(String),
    Rejected,
}

/// A local actor with its keys and relationship state
#[derive(Debug, Clone)]
pub struct Actor {
    pub name: String,
    pub summary: String,
    pub actor_type: String,
    pub iri: String,
    pub keys: KeyRing,
    followers: BTreeMap<String, String>,
    following: BTreeMap<String, String>,
    requested: BTreeMap<String, String>,
    rejected: BTreeSet<String>,
    shared_inboxes: BTreeMap<String, String>,
}

impl Actor {
    pub fn new(
        name: impl Into<String>,
        iri: impl Into<String>,
        summary: impl Into<String>,
        actor_type: impl Into<String>,
        keys: KeyRing,
    ) -> Self {
        Self {
            name: name.into(),
            summary: summary.into(),
            actor_type: actor_type.into(),
            iri: iri.into(),
            keys,
            followers: BTreeMap::new(),
            following: BTreeMap::new(),
            requested: BTreeMap::new(),
            rejected: BTreeSet::new(),
            shared_inboxes: BTreeMap::new(),
        }
    }

    pub fn key_id(&self) -> String {
        key_id_for(&self.iri)
    }

    pub fn signer(&self) -> Signer {
        self.keys.signer(self.key_id())
    }

    pub fn inbox_iri(&self) -> String {
        format!("{}/inbox", self.iri)
    }

    pub fn outbox_iri(&self) -> String {
        format!("{}/outbox", self.iri)
    }

    pub fn followers_iri(&self) -> String {
        format!("{}/peers/followers", self.iri)
    }

    pub fn following_iri(&self) -> String {
        format!("{}/peers/following", self.iri)
    }

    pub fn item_iri(&self, hash: &str) -> String {
        format!("{}/item/{}", self.iri, hash)
    }

    /// Hash of a local item IRI, if it names one of this actor's items.
    pub fn item_hash<'a>(&self, iri: &'a str) -> Option<&'a str> {
        iri.strip_prefix(&self.iri)?.strip_prefix("/item/")
    }

    // ---- relationship queries ----

    pub fn followers(&self) -> &BTreeMap<String, String> {
        &self.followers
    }

    pub fn following(&self) -> &BTreeMap<String, String> {
        &self.following
    }

    pub fn requested(&self) -> &BTreeMap<String, String> {
        &self.requested
    }

    pub fn rejected(&self) -> &BTreeSet<String> {
        &self.rejected
    }

    pub fn shared_inbox_of(&self, follower: &str) -> Option<&str> {
        self.shared_inboxes.get(follower).map(String::as_str)
    }

    pub fn relationship(&self, remote: &str) -> Relationship {
        if let Some(hash) = self.following.get(remote) {
            Relationship::Following(hash.clone())
        } else if let Some(hash) = self.requested.get(remote) {
            Relationship::Requested(hash.clone())
        } else if self.rejected.contains(remote) {
            Relationship::Rejected
        } else {
            Relationship::None
        }
    }

    // ---- outbound transitions ----

    pub fn mark_requested(&mut self, remote: &str, hash: &str) {
        self.following.remove(remote);
        self.rejected.remove(remote);
        self.requested.insert(remote.to_string(), hash.to_string());
    }

    pub fn mark_following(&mut self, remote: &str, hash: &str) {
        self.requested.remove(remote);
        self.rejected.remove(remote);
        self.following.insert(remote.to_string(), hash.to_string());
    }

    pub fn mark_rejected(&mut self, remote: &str) {
        self.requested.remove(remote);
        self.following.remove(remote);
        self.rejected.insert(remote.to_string());
    }

    /// Drop a pending request, but only if it still belongs to `hash`.
    pub fn withdraw_request(&mut self, remote: &str, hash: &str) -> bool {
        if self.requested.get(remote).map(String::as_str) == Some(hash) {
            self.requested.remove(remote);
            return true;
        }
        false
    }

    /// Stop following, but only if the relationship still belongs to `hash`.
    pub fn end_following(&mut self, remote: &str, hash: &str) -> bool {
        if self.following.get(remote).map(String::as_str) == Some(hash) {
            self.following.remove(remote);
            return true;
        }
        false
    }

    pub fn clear_rejection(&mut self, remote: &str) -> bool {
        self.rejected.remove(remote)
    }

    // ---- inbound transitions ----

    /// Record a follower. Returns false if it was already present.
    pub fn add_follower(&mut self, remote: &str, inbox: &str, shared_inbox: Option<&str>) -> bool {
        if let Some(shared) = shared_inbox {
            self.shared_inboxes
                .insert(remote.to_string(), shared.to_string());
        }
        if self.followers.contains_key(remote) {
            return false;
        }
        self.followers.insert(remote.to_string(), inbox.to_string());
        true
    }

    pub fn remove_follower(&mut self, remote: &str) -> bool {
        self.shared_inboxes.remove(remote);
        self.followers.remove(remote).is_some()
    }

    /// ActivityStreams representation served at the actor IRI.
    pub fn to_document(&self) -> Value {
        json!({
            "@context": [ACTIVITY_STREAMS_CONTEXT, "https://w3id.org/security/v1"],
            "type": self.actor_type,
            "id": self.iri,
            "name": self.name,
            "preferredUsername": self.name,
            "summary": self.summary,
            "inbox": self.inbox_iri(),
            "outbox": self.outbox_iri(),
            "followers": self.followers_iri(),
            "following": self.following_iri(),
            "publicKey": {
                "id": self.key_id(),
                "owner": self.iri,
                "publicKeyPem": self.keys.public_key_pem()
            }
        })
    }

    pub fn to_stored(&self) -> StoredActor {
        StoredActor {
            name: self.name.clone(),
            summary: self.summary.clone(),
            actor_type: self.actor_type.clone(),
            iri: self.iri.clone(),
            public_key: self.keys.public_key_pem().to_string(),
            private_key: self.keys.private_key_pem().to_string(),
            followers: self.followers.clone(),
            following: self.following.clone(),
            requested: self.requested.clone(),
            rejected: self
                .rejected
                .iter()
                .map(|iri| (iri.clone(), String::new()))
                .collect(),
            shared_inboxes: self.shared_inboxes.clone(),
        }
    }

    /// Rebuild an actor from its descriptor, re-establishing set exclusivity.
    pub fn from_stored(stored: StoredActor) -> Result<Self, AppError> {
        let keys = KeyRing::from_pem(&stored.public_key, &stored.private_key)?;
        let mut actor = Actor::new(
            stored.name,
            stored.iri,
            stored.summary,
            stored.actor_type,
            keys,
        );
        actor.followers = stored.followers;
        actor.shared_inboxes = stored.shared_inboxes;
        for remote in stored.rejected.into_keys() {
            actor.mark_rejected(&remote);
        }
        for (remote, hash) in stored.requested {
            actor.mark_requested(&remote, &hash);
        }
        for (remote, hash) in stored.following {
            actor.mark_following(&remote, &hash);
        }
        Ok(actor)
    }
}

/// On-disk actor descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoredActor {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub actor_type: String,
    #[serde(rename = "IRI")]
    pub iri: String,
    pub public_key: String,
    pub private_key: String,
    #[serde(default)]
    pub followers: BTreeMap<String, String>,
    #[serde(default)]
    pub following: BTreeMap<String, String>,
    #[serde(default)]
    pub requested: BTreeMap<String, String>,
    /// IRI to empty string
    #[serde(default)]
    pub rejected: BTreeMap<String, String>,
    #[serde(default)]
    pub shared_inboxes: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::keys::tests::test_keyring;

    fn alice() -> Actor {
        Actor::new(
            "alice",
            "https://social.example/alice",
            "hi",
            "Person",
            test_keyring(),
        )
    }

    fn assert_exclusive(actor: &Actor) {
        for remote in actor
            .following()
            .keys()
            .chain(actor.requested().keys())
            .chain(actor.rejected().iter())
        {
            let memberships = [
                actor.following().contains_key(remote),
                actor.requested().contains_key(remote),
                actor.rejected().contains(remote),
            ];
            assert_eq!(
                memberships.iter().filter(|m| **m).count(),
                1,
                "{remote} is in more than one outbound set"
            );
        }
    }

    #[test]
    fn transitions_keep_outbound_sets_exclusive() {
        let mut actor = alice();
        let bob = "https://peer/bob";

        actor.mark_requested(bob, "h1");
        assert_eq!(actor.relationship(bob), Relationship::Requested("h1".into()));
        assert_exclusive(&actor);

        actor.mark_following(bob, "h1");
        assert_eq!(actor.relationship(bob), Relationship::Following("h1".into()));
        assert_exclusive(&actor);

        actor.mark_rejected(bob);
        assert_eq!(actor.relationship(bob), Relationship::Rejected);
        assert_exclusive(&actor);

        actor.mark_requested(bob, "h2");
        assert_exclusive(&actor);
        assert!(actor.rejected().is_empty());
    }

    #[test]
    fn withdraw_only_matching_request() {
        let mut actor = alice();
        actor.mark_requested("https://peer/bob", "h1");

        assert!(!actor.withdraw_request("https://peer/bob", "other"));
        assert!(actor.withdraw_request("https://peer/bob", "h1"));
        assert_eq!(actor.relationship("https://peer/bob"), Relationship::None);
    }

    #[test]
    fn followers_are_independent_of_outbound_state() {
        let mut actor = alice();
        let bob = "https://peer/bob";
        actor.mark_following(bob, "h1");

        assert!(actor.add_follower(bob, "https://peer/bob/inbox", Some("https://peer/inbox")));
        assert!(!actor.add_follower(bob, "https://peer/bob/inbox", None));
        assert_eq!(actor.followers().len(), 1);
        assert_eq!(actor.shared_inbox_of(bob), Some("https://peer/inbox"));
        assert_eq!(actor.relationship(bob), Relationship::Following("h1".into()));
    }

    #[test]
    fn descriptor_uses_compatible_keys() {
        let mut actor = alice();
        actor.mark_rejected("https://peer/carol");
        let stored = serde_json::to_value(actor.to_stored()).unwrap();

        assert_eq!(stored["Name"], "alice");
        assert_eq!(stored["IRI"], "https://social.example/alice");
        assert_eq!(stored["ActorType"], "Person");
        assert_eq!(stored["Rejected"]["https://peer/carol"], "");
        assert!(stored["PrivateKey"]
            .as_str()
            .unwrap()
            .contains("RSA PRIVATE KEY"));
    }

    #[test]
    fn document_advertises_endpoints_and_key() {
        let doc = alice().to_document();
        assert_eq!(doc["inbox"], "https://social.example/alice/inbox");
        assert_eq!(doc["followers"], "https://social.example/alice/peers/followers");
        assert_eq!(doc["publicKey"]["id"], "https://social.example/alice#main-key");
        assert_eq!(doc["publicKey"]["owner"], "https://social.example/alice");
    }

    #[test]
    fn item_hash_only_matches_own_items() {
        let actor = alice();
        assert_eq!(
            actor.item_hash("https://social.example/alice/item/01abc"),
            Some("01abc")
        );
        assert_eq!(actor.item_hash("https://social.example/bob/item/01abc"), None);
    }
}
