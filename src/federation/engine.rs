//! Federation engine
//!
//! Drives the relationship state machine between local and remote actors:
//!
//! ```text
//! outbound:  none -> requested -> following | rejected,  following -> none (Undo)
//! inbound:   not follower -> follower,                    follower -> not follower (Undo)
//! ```
//!
//! Every state change goes through [`ActorRegistry::update`], so changes to
//! one actor are serialized. Network work runs detached and is returned to
//! the caller as a [`DeliveryHandle`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use super::activity::{
    Activity, Announce, Follow, PUBLIC_AUDIENCE, Response, Undo, builder,
};
use super::delivery::{
    DeliveryHandle, DeliveryOutcome, DeliveryQueue, DeliveryTarget, RetryPolicy,
};
use super::keys::{DEFAULT_KEY_BITS, KeyRing};
use super::policy::{AutoAccept, ContentHandler, FollowDecision, FollowPolicy, LogContent};
use super::resolver::{RemoteActorProfile, RemoteActorResolver};
use super::transport::{ACTIVITY_STREAMS_PROFILE, SignedTransport};
use crate::config::{AcceptCorrelation, FederationConfig};
use crate::data::{Actor, ActorRegistry, ItemId, Relationship};
use crate::error::AppError;
use crate::metrics::ACTIVITIES_RECEIVED;

/// Handle for a single detached delivery
pub type ReplyHandle = DeliveryHandle<Result<(), AppError>>;

/// Engine behaviour independent of transport
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Ends with `/`
    pub base_url: String,
    pub accept_correlation: AcceptCorrelation,
    pub shared_inbox_delivery: bool,
    /// RSA modulus size for newly created actors
    pub key_bits: usize,
}

impl EngineSettings {
    pub fn from_config(config: &FederationConfig) -> Self {
        Self {
            base_url: config.normalized_base_url(),
            accept_correlation: config.accept_correlation,
            shared_inbox_delivery: config.shared_inbox_delivery,
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

/// A published activity and its fan-out
pub struct Publication {
    pub id: String,
    pub delivery: DeliveryHandle<Vec<DeliveryOutcome>>,
}

/// How an inbound activity was handled
#[derive(Debug)]
pub enum InboxReceipt {
    /// State was updated or a reply was started
    Processed {
        kind: &'static str,
        reply: Option<ReplyHandle>,
    },
    /// Valid but no action taken
    Ignored {
        kind: &'static str,
        reason: &'static str,
    },
}

#[derive(Clone)]
pub struct FederationEngine {
    settings: Arc<EngineSettings>,
    registry: Arc<ActorRegistry>,
    resolver: RemoteActorResolver,
    queue: DeliveryQueue,
    follow_policy: Arc<dyn FollowPolicy>,
    content_handler: Arc<dyn ContentHandler>,
}

impl FederationEngine {
    pub fn new(
        settings: EngineSettings,
        registry: Arc<ActorRegistry>,
        transport: SignedTransport,
        retry: RetryPolicy,
        max_concurrent: usize,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            registry,
            resolver: RemoteActorResolver::new(transport.clone()),
            queue: DeliveryQueue::new(transport, retry, max_concurrent),
            follow_policy: Arc::new(AutoAccept),
            content_handler: Arc::new(LogContent),
        }
    }

    pub fn with_follow_policy(mut self, policy: impl FollowPolicy + 'static) -> Self {
        self.follow_policy = Arc::new(policy);
        self
    }

    pub fn with_content_handler(mut self, handler: impl ContentHandler + 'static) -> Self {
        self.content_handler = Arc::new(handler);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ActorRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &RemoteActorResolver {
        &self.resolver
    }

    /// Canonical IRI for a local actor name.
    pub fn iri_for(&self, name: &str) -> String {
        format!("{}{}", self.settings.base_url, name)
    }

    pub async fn actor(&self, name: &str) -> Result<Actor, AppError> {
        self.registry.get(name).await
    }

    /// Load `name` or create it with fresh keys. Summary and type are
    /// brought in line with the arguments if they differ.
    pub async fn ensure_actor(
        &self,
        name: &str,
        summary: &str,
        actor_type: &str,
    ) -> Result<Actor, AppError> {
        let key_bits = self.settings.key_bits;
        let iri = self.iri_for(name);

        let (actor, created) = self
            .registry
            .get_or_create(name, || async move {
                let keys = tokio::task::spawn_blocking(move || KeyRing::generate_with_bits(key_bits))
                    .await
                    .map_err(|e| AppError::Internal(anyhow::anyhow!("key generation task: {}", e)))??;
                Ok(Actor::new(name, iri, summary, actor_type, keys))
            })
            .await?;

        if created || (actor.summary == summary && actor.actor_type == actor_type) {
            return Ok(actor);
        }

        tracing::info!(actor = %name, "Updating actor summary and type");
        self.registry
            .update(name, |actor| {
                actor.summary = summary.to_string();
                actor.actor_type = actor_type.to_string();
                Ok(actor.clone())
            })
            .await
    }

    // ------------------------------------------------------------------
    // Outbound relationship transitions
    // ------------------------------------------------------------------

    /// Send a Follow from `name` to `remote`.
    ///
    /// Returns `None` when `remote` is already followed or has rejected us.
    /// Otherwise the remote is marked requested while the Follow is in
    /// flight and the mark is withdrawn if delivery finally fails.
    pub async fn follow(&self, name: &str, remote: &str) -> Result<Option<ReplyHandle>, AppError> {
        let actor = self.registry.get(name).await?;
        if remote == actor.iri {
            tracing::warn!(actor = %name, "Refusing to follow self");
            return Ok(None);
        }
        match actor.relationship(remote) {
            Relationship::Following(_) | Relationship::Rejected => {
                tracing::info!(actor = %name, remote = %remote, "Follow skipped, already following or rejected");
                return Ok(None);
            }
            Relationship::None | Relationship::Requested(_) => {}
        }

        let engine = self.clone();
        let name = name.to_string();
        let remote = remote.to_string();
        Ok(Some(DeliveryHandle::spawn(async move {
            let result = engine.run_follow(&name, &remote).await;
            if let Err(e) = &result {
                tracing::warn!(actor = %name, remote = %remote, error = %e, "Follow failed");
            }
            result
        })))
    }

    async fn run_follow(&self, name: &str, remote: &str) -> Result<(), AppError> {
        let profile = self.resolver.resolve(remote).await?;
        let hash = ItemId::new().0;

        let prepared = self
            .registry
            .update(name, |actor| {
                if matches!(
                    actor.relationship(remote),
                    Relationship::Following(_) | Relationship::Rejected
                ) {
                    return Ok(None);
                }
                actor.mark_requested(remote, &hash);
                let follow = builder::follow(&actor.item_iri(&hash), &actor.iri, remote);
                Ok(Some((follow, actor.signer())))
            })
            .await?;
        let Some((follow, signer)) = prepared else {
            return Ok(());
        };

        match self.queue.deliver(&signer, &follow, &profile.inbox).await {
            DeliveryOutcome::Delivered { .. } => {
                self.registry.store().save_item(name, &hash, &follow).await?;
                tracing::info!(actor = %name, remote = %remote, follow = %hash, "Follow sent");
                Ok(())
            }
            DeliveryOutcome::DeadLettered(dead) => {
                self.registry
                    .update(name, |actor| Ok(actor.withdraw_request(remote, &hash)))
                    .await?;
                Err(dead.into())
            }
        }
    }

    /// Undo the Follow of `remote`. Returns `None` unless it is followed.
    pub async fn unfollow(&self, name: &str, remote: &str) -> Result<Option<ReplyHandle>, AppError> {
        let actor = self.registry.get(name).await?;
        let Relationship::Following(hash) = actor.relationship(remote) else {
            tracing::info!(actor = %name, remote = %remote, "Unfollow skipped, not following");
            return Ok(None);
        };

        let engine = self.clone();
        let name = name.to_string();
        let remote = remote.to_string();
        Ok(Some(DeliveryHandle::spawn(async move {
            let result = engine.run_unfollow(&name, &remote, &hash).await;
            if let Err(e) = &result {
                tracing::warn!(actor = %name, remote = %remote, error = %e, "Unfollow failed");
            }
            result
        })))
    }

    async fn run_unfollow(&self, name: &str, remote: &str, hash: &str) -> Result<(), AppError> {
        let profile = self.resolver.resolve(remote).await?;
        let actor = self.registry.get(name).await?;

        let follow = match self.registry.store().load_item(name, hash).await {
            Ok(follow) => follow,
            Err(e) => {
                tracing::debug!(actor = %name, follow = %hash, error = %e, "Rebuilding Follow for Undo");
                builder::follow(&actor.item_iri(hash), &actor.iri, remote)
            }
        };
        let undo_hash = ItemId::new().0;
        let undo = builder::undo(&actor.item_iri(&undo_hash), &actor.iri, &follow);

        self.queue
            .deliver(&actor.signer(), &undo, &profile.inbox)
            .await
            .into_result()?;

        self.registry
            .update(name, |actor| Ok(actor.end_following(remote, hash)))
            .await?;
        self.registry.store().save_item(name, &undo_hash, &undo).await?;
        tracing::info!(actor = %name, remote = %remote, "Unfollowed");
        Ok(())
    }

    /// Forget a rejection so `remote` may be followed again.
    pub async fn clear_rejection(&self, name: &str, remote: &str) -> Result<bool, AppError> {
        self.registry
            .update(name, |actor| Ok(actor.clear_rejection(remote)))
            .await
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Publish a public Note wrapped in a Create.
    pub async fn create_note(
        &self,
        name: &str,
        content: &str,
        in_reply_to: Option<&str>,
    ) -> Result<Publication, AppError> {
        let actor = self.registry.get(name).await?;
        let note_hash = ItemId::new().0;
        let create_hash = ItemId::new().0;
        let followers = actor.followers_iri();
        let to = [PUBLIC_AUDIENCE];
        let cc = [followers.as_str()];

        let note = builder::note(
            &actor.item_iri(&note_hash),
            &actor.iri,
            content,
            &chrono::Utc::now().to_rfc3339(),
            in_reply_to,
            &to,
            &cc,
        );
        let create = builder::create(&actor.item_iri(&create_hash), &actor.iri, note.clone(), &to, &cc);

        let store = self.registry.store();
        store.save_item(name, &note_hash, &note).await?;
        store.save_item(name, &create_hash, &create).await?;
        self.publish(name, &create_hash, create).await
    }

    /// Publish an Announce of `object`.
    pub async fn announce(&self, name: &str, object: &str) -> Result<Publication, AppError> {
        let actor = self.registry.get(name).await?;
        let hash = ItemId::new().0;
        let followers = actor.followers_iri();

        let announce = builder::announce(
            &actor.item_iri(&hash),
            &actor.iri,
            object,
            &[PUBLIC_AUDIENCE],
            &[followers.as_str()],
        );
        self.registry.store().save_item(name, &hash, &announce).await?;
        self.publish(name, &hash, announce).await
    }

    /// Append a stored activity to the outbox and fan it out to followers.
    async fn publish(&self, name: &str, hash: &str, activity: Value) -> Result<Publication, AppError> {
        let actor = self.registry.get(name).await?;
        let id = actor.item_iri(hash);
        self.registry.append_outbox(name, &id).await?;

        let targets = self.delivery_targets(&actor);
        tracing::info!(
            actor = %name,
            id = %id,
            followers = actor.followers().len(),
            targets = targets.len(),
            "Publishing activity"
        );

        let queue = self.queue.clone();
        let signer = actor.signer();
        let delivery = DeliveryHandle::spawn(async move {
            queue.fan_out(&signer, &activity, targets).await
        });

        Ok(Publication { id, delivery })
    }

    /// Inboxes to reach every follower, grouped by shared inbox if enabled.
    fn delivery_targets(&self, actor: &Actor) -> Vec<DeliveryTarget> {
        let mut direct = Vec::new();
        let mut shared: BTreeMap<&str, Vec<String>> = BTreeMap::new();

        for (follower, inbox) in actor.followers() {
            match actor.shared_inbox_of(follower) {
                Some(shared_inbox) if self.settings.shared_inbox_delivery => {
                    shared.entry(shared_inbox).or_default().push(inbox.clone());
                }
                _ => direct.push(DeliveryTarget::direct(inbox.clone())),
            }
        }

        shared
            .into_iter()
            .map(|(inbox, fallback)| DeliveryTarget {
                inbox: inbox.to_string(),
                fallback,
            })
            .chain(direct)
            .collect()
    }

    /// Fetch a remote document with a GET signed by `name`'s key.
    pub async fn fetch_signed(&self, name: &str, url: &str) -> Result<Value, AppError> {
        let actor = self.registry.get(name).await?;
        let body = self
            .queue
            .transport()
            .signed_get(&actor.signer(), url, ACTIVITY_STREAMS_PROFILE)
            .await?;
        serde_json::from_str(&body).map_err(|e| AppError::RemoteMalformed(format!("{}: {}", url, e)))
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Decode and handle a raw inbox body addressed to `name`.
    pub async fn receive(&self, name: &str, body: &[u8]) -> Result<InboxReceipt, AppError> {
        let activity = match Activity::from_slice(body) {
            Ok(activity) => activity,
            Err(e) => {
                tracing::warn!(actor = %name, error = %e, "Dropping malformed activity");
                return Err(e);
            }
        };
        self.receive_activity(name, activity).await
    }

    pub async fn receive_activity(
        &self,
        name: &str,
        activity: Activity,
    ) -> Result<InboxReceipt, AppError> {
        let local = self.registry.get(name).await?;
        let kind = activity.kind();
        ACTIVITIES_RECEIVED.with_label_values(&[kind]).inc();
        tracing::debug!(actor = %name, kind, from = ?activity.actor(), "Inbound activity");

        match activity {
            Activity::Follow(follow) => self.on_follow(&local, follow).await,
            Activity::Accept(accept) => self.on_accept(&local, accept).await,
            Activity::Reject(reject) => self.on_reject(&local, reject).await,
            Activity::Undo(undo) => self.on_undo(&local, undo).await,
            Activity::Create(create) => {
                self.content_handler.on_create(&local, &create);
                Ok(InboxReceipt::Processed { kind, reply: None })
            }
            Activity::Announce(Announce { actor, object, .. }) => {
                tracing::debug!(actor = %name, from = %actor, object = %object, "Ignoring Announce");
                Ok(InboxReceipt::Ignored {
                    kind,
                    reason: "announce is not acted on",
                })
            }
            Activity::Unknown(raw) => {
                tracing::debug!(
                    actor = %name,
                    kind = raw.get("type").and_then(serde_json::Value::as_str).unwrap_or("?"),
                    "Ignoring unsupported activity"
                );
                Ok(InboxReceipt::Ignored {
                    kind,
                    reason: "unsupported activity type",
                })
            }
        }
    }

    async fn on_follow(&self, local: &Actor, follow: Follow) -> Result<InboxReceipt, AppError> {
        if follow.object != local.iri {
            tracing::warn!(actor = %local.name, target = %follow.object, "Misdirected Follow");
            return Err(AppError::MisdirectedActivity(format!(
                "Follow targets {}",
                follow.object
            )));
        }
        if follow.actor == local.iri {
            tracing::warn!(actor = %local.name, "Ignoring self-follow");
            return Ok(InboxReceipt::Ignored {
                kind: "Follow",
                reason: "self-follow",
            });
        }

        let decision = self.follow_policy.decide(local, &follow);
        tracing::info!(actor = %local.name, from = %follow.actor, ?decision, "Follow received");

        let name = local.name.clone();
        let engine = self.clone();
        let reply = match decision {
            FollowDecision::Defer => {
                return Ok(InboxReceipt::Ignored {
                    kind: "Follow",
                    reason: "deferred by policy",
                });
            }
            FollowDecision::Accept => DeliveryHandle::spawn(async move {
                let result = engine.accept_follow(&name, &follow).await;
                if let Err(e) = &result {
                    tracing::warn!(actor = %name, from = %follow.actor, error = %e, "Accept failed");
                }
                result
            }),
            FollowDecision::Reject => DeliveryHandle::spawn(async move {
                let result = engine.reject_follow(&name, &follow).await;
                if let Err(e) = &result {
                    tracing::warn!(actor = %name, from = %follow.actor, error = %e, "Reject failed");
                }
                result
            }),
        };

        Ok(InboxReceipt::Processed {
            kind: "Follow",
            reply: Some(reply),
        })
    }

    async fn accept_follow(&self, name: &str, follow: &Follow) -> Result<(), AppError> {
        let profile: RemoteActorProfile = self.resolver.resolve(&follow.actor).await?;
        let hash = ItemId::new().0;

        let (accept, signer) = self
            .registry
            .update(name, |actor| {
                if actor.add_follower(&follow.actor, &profile.inbox, profile.shared_inbox.as_deref()) {
                    tracing::info!(actor = %name, follower = %follow.actor, "Follower added");
                }
                let accept = builder::accept(&actor.item_iri(&hash), &actor.iri, &follow.raw);
                Ok((accept, actor.signer()))
            })
            .await?;

        self.registry.store().save_item(name, &hash, &accept).await?;
        self.queue
            .deliver(&signer, &accept, &profile.inbox)
            .await
            .into_result()
    }

    async fn reject_follow(&self, name: &str, follow: &Follow) -> Result<(), AppError> {
        let profile = self.resolver.resolve(&follow.actor).await?;
        let actor = self.registry.get(name).await?;
        let hash = ItemId::new().0;
        let reject = builder::reject(&actor.item_iri(&hash), &actor.iri, &follow.raw);

        self.registry.store().save_item(name, &hash, &reject).await?;
        self.queue
            .deliver(&actor.signer(), &reject, &profile.inbox)
            .await
            .into_result()
    }

    async fn on_accept(&self, local: &Actor, accept: Response) -> Result<InboxReceipt, AppError> {
        let remote = accept.actor.as_str();
        let Relationship::Requested(pending) = local.relationship(remote) else {
            tracing::debug!(actor = %local.name, from = %remote, "Ignoring Accept without pending request");
            return Ok(InboxReceipt::Ignored {
                kind: "Accept",
                reason: "no pending follow request",
            });
        };

        if let Some(follow) = accept.embedded_follow() {
            if follow.actor != local.iri {
                tracing::warn!(actor = %local.name, follower = %follow.actor, "Ignoring misdirected Accept");
                return Ok(InboxReceipt::Ignored {
                    kind: "Accept",
                    reason: "accepted follow belongs to another actor",
                });
            }
        }

        let embedded_hash = accept.object_id().and_then(|id| local.item_hash(id));
        if embedded_hash != Some(pending.as_str()) {
            match self.settings.accept_correlation {
                AcceptCorrelation::Strict => {
                    tracing::warn!(
                        actor = %local.name,
                        from = %remote,
                        embedded = ?accept.object_id(),
                        expected = %local.item_iri(&pending),
                        "Ignoring Accept with mismatched Follow id"
                    );
                    return Ok(InboxReceipt::Ignored {
                        kind: "Accept",
                        reason: "follow id mismatch",
                    });
                }
                AcceptCorrelation::Lenient => {
                    tracing::warn!(
                        actor = %local.name,
                        from = %remote,
                        embedded = ?accept.object_id(),
                        expected = %local.item_iri(&pending),
                        "Accept does not reference the pending Follow id, accepting anyway"
                    );
                }
            }
        }

        let moved = self
            .registry
            .update(&local.name, |actor| match actor.relationship(remote) {
                Relationship::Requested(hash) => {
                    actor.mark_following(remote, &hash);
                    Ok(true)
                }
                _ => Ok(false),
            })
            .await?;

        if !moved {
            return Ok(InboxReceipt::Ignored {
                kind: "Accept",
                reason: "request resolved concurrently",
            });
        }
        tracing::info!(actor = %local.name, remote = %remote, "Now following");
        Ok(InboxReceipt::Processed {
            kind: "Accept",
            reply: None,
        })
    }

    async fn on_reject(&self, local: &Actor, reject: Response) -> Result<InboxReceipt, AppError> {
        let remote = reject.actor.as_str();
        self.registry
            .update(&local.name, |actor| {
                actor.mark_rejected(remote);
                Ok(())
            })
            .await?;

        tracing::info!(actor = %local.name, remote = %remote, "Follow rejected");
        Ok(InboxReceipt::Processed {
            kind: "Reject",
            reply: None,
        })
    }

    async fn on_undo(&self, local: &Actor, undo: Undo) -> Result<InboxReceipt, AppError> {
        let Some(follow) = undo.undone_follow() else {
            return Ok(InboxReceipt::Ignored {
                kind: "Undo",
                reason: "only Undo of Follow is supported",
            });
        };
        if follow.actor != undo.actor {
            tracing::warn!(actor = %local.name, from = %undo.actor, "Undo of someone else's Follow");
            return Ok(InboxReceipt::Ignored {
                kind: "Undo",
                reason: "undo actor does not own the follow",
            });
        }
        if follow.object != local.iri {
            tracing::warn!(actor = %local.name, target = %follow.object, "Ignoring misdirected Undo");
            return Ok(InboxReceipt::Ignored {
                kind: "Undo",
                reason: "undone follow targets another actor",
            });
        }

        let removed = self
            .registry
            .update(&local.name, |actor| Ok(actor.remove_follower(&undo.actor)))
            .await?;
        tracing::info!(actor = %local.name, follower = %undo.actor, removed, "Follower removed");

        Ok(InboxReceipt::Processed {
            kind: "Undo",
            reply: None,
        })
    }
}
