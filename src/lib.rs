//! fedserve - server-to-server ActivityPub federation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub actor, inbox, outbox, peers, items           │
//! │  - WebFinger / NodeInfo discovery, metrics                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - FederationEngine (follow state machine, publishing)      │
//! │  - SignedTransport, RemoteActorResolver, DeliveryQueue      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - ActorRegistry (live actors, per-name locking)            │
//! │  - ActivityStore (descriptors, items, outbox on disk)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation handling
//! - `data`: Actor model and filesystem persistence
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use federation::FederationEngine;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Federation engine owning the registry, transport and delivery queue
    pub engine: FederationEngine,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Open the activity store
    /// 2. Build the signed transport and delivery queue
    /// 3. Build the federation engine
    ///
    /// # Errors
    /// Returns error if the storage root cannot be created or the HTTP
    /// client cannot be built
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let store = data::ActivityStore::open(&config.storage.root).await?;
        let registry = Arc::new(data::ActorRegistry::new(Arc::new(store)));

        let federation = &config.federation;
        let transport =
            federation::SignedTransport::new(&federation.user_agent, federation.request_timeout())?;
        let engine = FederationEngine::new(
            federation::EngineSettings::from_config(federation),
            registry,
            transport,
            federation::RetryPolicy::from(&federation.delivery),
            federation.delivery.max_concurrent,
        );

        Ok(Self::with_engine(config, engine))
    }

    /// State around an already-built engine.
    pub fn with_engine(config: config::AppConfig, engine: FederationEngine) -> Self {
        Self {
            config: Arc::new(config),
            engine,
        }
    }

    /// Create or refresh every actor listed in the configuration.
    pub async fn bootstrap_actors(&self) -> Result<(), error::AppError> {
        for actor in &self.config.actors {
            let local = self
                .engine
                .ensure_actor(&actor.name, &actor.summary, &actor.actor_type)
                .await?;
            tracing::info!(actor = %local.name, iri = %local.iri, "Actor ready");
        }

        let count = self.engine.registry().store().list_actors().await?.len();
        metrics::LOCAL_ACTORS.set(count as i64);
        Ok(())
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .merge(api::wellknown_router())
        .merge(api::metrics_router())
        .merge(api::activitypub_router())
        .layer(axum::middleware::from_fn(api::track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
