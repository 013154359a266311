//! Pluggable decisions for inbound activities

use crate::data::Actor;

use super::activity::{Create, Follow};

/// What to do with an inbound Follow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowDecision {
    /// Record the follower and reply with Accept
    Accept,
    /// Reply with Reject; nothing is recorded
    Reject,
    /// Leave the request unanswered
    Defer,
}

/// Decides whether inbound Follows are accepted.
pub trait FollowPolicy: Send + Sync {
    fn decide(&self, local: &Actor, follow: &Follow) -> FollowDecision;
}

/// Accepts every Follow.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAccept;

impl FollowPolicy for AutoAccept {
    fn decide(&self, _local: &Actor, _follow: &Follow) -> FollowDecision {
        FollowDecision::Accept
    }
}

impl<F> FollowPolicy for F
where
    F: Fn(&Actor, &Follow) -> FollowDecision + Send + Sync,
{
    fn decide(&self, local: &Actor, follow: &Follow) -> FollowDecision {
        self(local, follow)
    }
}

/// Receives inbound Create activities addressed to a local actor.
pub trait ContentHandler: Send + Sync {
    fn on_create(&self, local: &Actor, create: &Create);
}

/// Logs received content and otherwise drops it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogContent;

impl ContentHandler for LogContent {
    fn on_create(&self, local: &Actor, create: &Create) {
        tracing::info!(
            actor = %local.name,
            from = %create.actor,
            id = ?create.id,
            object_type = create.object.get("type").and_then(|t| t.as_str()).unwrap_or("unknown"),
            "Received content"
        );
    }
}

impl<F> ContentHandler for F
where
    F: Fn(&Actor, &Create) + Send + Sync,
{
    fn on_create(&self, local: &Actor, create: &Create) {
        self(local, create)
    }
}
