//! ActivityPub federation module
//!
//! Handles:
//! - Actor key material and HTTP Signatures
//! - Signed outbound transport and remote actor resolution
//! - Activity decoding and construction
//! - Delivery with retry and dead letters
//! - The follow/accept/reject/undo state machine
//! - Collections and WebFinger

pub mod activity;
pub mod collections;
pub mod delivery;
pub mod engine;
pub mod keys;
pub mod policy;
pub mod resolver;
pub mod signature;
pub mod transport;
pub mod webfinger;

pub use activity::{Activity, Create, Follow};
pub use collections::{PeerCollection, item, outbox_collection, parse_page, peers_collection};
pub use delivery::{
    DeadLetter, DeliveryHandle, DeliveryOutcome, DeliveryQueue, DeliveryTarget, RetryPolicy,
};
pub use engine::{EngineSettings, FederationEngine, InboxReceipt, Publication, ReplyHandle};
pub use keys::{KeyRing, Signer};
pub use policy::{AutoAccept, ContentHandler, FollowDecision, FollowPolicy, LogContent};
pub use resolver::{RemoteActorProfile, RemoteActorResolver};
pub use signature::{
    extract_signature_key_id, key_id_matches_actor, parse_signature_header, sign_request,
    verify_signature,
};
pub use transport::{ACTIVITY_JSON, SignedTransport, TransportResponse};
pub use webfinger::{WebFingerResponse, parse_acct, webfinger_response};
