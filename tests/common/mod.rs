//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use fedserve::config::{self, AcceptCorrelation};
use fedserve::data::{ActivityStore, ActorRegistry};
use fedserve::federation::{
    EngineSettings, FederationEngine, KeyRing, RetryPolicy, SignedTransport,
};
use fedserve::{AppState, build_router};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Knobs that differ between scenarios
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub verify_signatures: bool,
    pub accept_correlation: AcceptCorrelation,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            verify_signatures: false,
            accept_correlation: AcceptCorrelation::Lenient,
        }
    }
}

/// Test server instance with a bootstrapped local actor `alice`
pub struct TestServer {
    pub addr: String,
    /// Public base URL, ends with `/`
    pub base_url: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_options(ServerOptions::default()).await
    }

    pub async fn with_options(options: ServerOptions) -> Self {
        fedserve::metrics::init_metrics();

        let temp_dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let base_url = format!("{}/", addr);

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            federation: config::FederationConfig {
                base_url: base_url.clone(),
                user_agent: "fedserve-test".to_string(),
                request_timeout_secs: 5,
                verify_signatures: options.verify_signatures,
                accept_correlation: options.accept_correlation,
                shared_inbox_delivery: true,
                delivery: config::DeliveryConfig {
                    max_retries: 0,
                    initial_delay_ms: 10,
                    max_delay_secs: 1,
                    multiplier: 2.0,
                    max_concurrent: 4,
                },
            },
            storage: config::StorageConfig {
                root: temp_dir.path().to_path_buf(),
            },
            actors: vec![config::ActorConfig {
                name: "alice".to_string(),
                summary: "Test actor".to_string(),
                actor_type: "Person".to_string(),
            }],
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let store = ActivityStore::open(&config.storage.root).await.unwrap();
        let registry = Arc::new(ActorRegistry::new(Arc::new(store)));
        let transport = SignedTransport::new("fedserve-test", Duration::from_secs(5)).unwrap();
        let mut settings = EngineSettings::from_config(&config.federation);
        // Small keys keep test startup fast
        settings.key_bits = 1024;
        let engine = FederationEngine::new(settings, registry, transport, RetryPolicy::none(), 4);

        let state = AppState::with_engine(config, engine);
        state.bootstrap_actors().await.unwrap();

        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr,
            base_url,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get URL for a path starting with `/`
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn actor_iri(&self, name: &str) -> String {
        format!("{}{}", self.base_url, name)
    }

    pub fn engine(&self) -> &FederationEngine {
        &self.state.engine
    }

    /// Names of the items stored for `name`, sorted.
    pub fn item_files(&self, name: &str) -> Vec<String> {
        let dir = self._temp_dir.path().join("actors").join(name).join("items");
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// POST an unsigned activity to a local inbox.
    pub async fn deliver(&self, name: &str, activity: &Value) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/{}/inbox", name)))
            .header("Content-Type", "application/activity+json")
            .json(activity)
            .send()
            .await
            .unwrap()
    }
}

#[derive(Default)]
struct PeerInner {
    base: String,
    keys: Option<KeyRing>,
    failing: AtomicBool,
    received: Mutex<Vec<(String, Value)>>,
}

/// Remote server hosting actors at `/users/:name` with recording inboxes
#[derive(Clone)]
pub struct FakePeer {
    pub base: String,
    inner: Arc<PeerInner>,
}

impl FakePeer {
    pub async fn start() -> Self {
        Self::start_with_keys(None).await
    }

    /// Peer whose actors all publish `keys` as their public key.
    pub async fn start_with_keys(keys: Option<KeyRing>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let inner = Arc::new(PeerInner {
            base: base.clone(),
            keys,
            failing: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/users/:name", get(peer_actor))
            .route("/users/:name/inbox", post(peer_inbox))
            .route("/inbox", post(peer_shared_inbox))
            .with_state(inner.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base, inner }
    }

    pub fn actor_iri(&self, name: &str) -> String {
        format!("{}/users/{}", self.base, name)
    }

    pub fn inbox(&self, name: &str) -> String {
        format!("{}/inbox", self.actor_iri(name))
    }

    /// Make every inbox answer 500 until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Activities received so far as `(inbox path, body)`.
    pub fn received(&self) -> Vec<(String, Value)> {
        self.inner.received.lock().unwrap().clone()
    }

    /// Activities of `kind` received at `name`'s personal inbox.
    pub fn received_by(&self, name: &str, kind: &str) -> Vec<Value> {
        let path = format!("/users/{}/inbox", name);
        self.received()
            .into_iter()
            .filter(|(inbox, body)| *inbox == path && body["type"] == kind)
            .map(|(_, body)| body)
            .collect()
    }

    /// Poll until `count` activities of `kind` reached `name`, or panic.
    pub async fn wait_for(&self, name: &str, kind: &str, count: usize) -> Vec<Value> {
        for _ in 0..100 {
            let got = self.received_by(name, kind);
            if got.len() >= count {
                return got;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "{} never received {} {} activities (got {:?})",
            name,
            count,
            kind,
            self.received()
        );
    }
}

async fn peer_actor(State(peer): State<Arc<PeerInner>>, Path(name): Path<String>) -> Json<Value> {
    let iri = format!("{}/users/{}", peer.base, name);
    let mut document = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Person",
        "id": iri,
        "preferredUsername": name,
        "inbox": format!("{}/inbox", iri),
        "outbox": format!("{}/outbox", iri),
        "endpoints": { "sharedInbox": format!("{}/inbox", peer.base) },
    });
    if let Some(keys) = &peer.keys {
        document["publicKey"] = json!({
            "id": format!("{}#main-key", iri),
            "owner": iri,
            "publicKeyPem": keys.public_key_pem(),
        });
    }
    Json(document)
}

async fn peer_inbox(
    State(peer): State<Arc<PeerInner>>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    if peer.failing.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    peer.received
        .lock()
        .unwrap()
        .push((format!("/users/{}/inbox", name), body));
    StatusCode::ACCEPTED
}

async fn peer_shared_inbox(State(peer): State<Arc<PeerInner>>, Json(body): Json<Value>) -> StatusCode {
    if peer.failing.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    peer.received.lock().unwrap().push(("/inbox".to_string(), body));
    StatusCode::ACCEPTED
}

/// Poll `check` until it holds, or panic after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition never held: {}", what);
}
