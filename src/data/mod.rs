//! Data layer module
//!
//! Handles all persistence:
//! - Actor descriptors and stored activities on the filesystem
//! - Append-only outbox logs with an in-memory page index
//! - The live actor registry that serializes mutations per actor

mod models;
mod registry;
mod store;

pub use models::*;
pub use registry::ActorRegistry;
pub use store::{ActivityStore, OUTBOX_PAGE_SIZE, validate_identifier};
