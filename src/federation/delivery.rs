//! Activity delivery
//!
//! Detached, bounded-concurrency delivery of signed activities with
//! exponential-backoff retry. A delivery that runs out of attempts ends as
//! a [`DeadLetter`] rather than disappearing.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::keys::Signer;
use super::transport::SignedTransport;
use crate::config::DeliveryConfig;
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_SENT, DELIVERIES_TOTAL};

/// Retry schedule with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_secs),
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Terminal record of a delivery that exhausted its attempts.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub inbox: String,
    pub activity_id: Option<String>,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

/// Final result of delivering one activity to one inbox.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Delivered { inbox: String, attempts: u32 },
    DeadLettered(DeadLetter),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn inbox(&self) -> &str {
        match self {
            DeliveryOutcome::Delivered { inbox, .. } => inbox,
            DeliveryOutcome::DeadLettered(dead) => &dead.inbox,
        }
    }

    pub fn into_result(self) -> Result<(), AppError> {
        match self {
            DeliveryOutcome::Delivered { .. } => Ok(()),
            DeliveryOutcome::DeadLettered(dead) => Err(dead.into()),
        }
    }
}

impl From<DeadLetter> for AppError {
    fn from(dead: DeadLetter) -> Self {
        AppError::DeliveryFailed {
            inbox: dead.inbox,
            attempts: dead.attempts,
            last_error: dead.last_error,
        }
    }
}

/// One fan-out destination: a primary inbox (often a shared inbox) and the
/// personal inboxes to fall back on if it cannot be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub inbox: String,
    pub fallback: Vec<String>,
}

impl DeliveryTarget {
    pub fn direct(inbox: impl Into<String>) -> Self {
        Self {
            inbox: inbox.into(),
            fallback: Vec::new(),
        }
    }
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
fn unique_targets(targets: Vec<DeliveryTarget>) -> Vec<DeliveryTarget> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|target| seen.insert(target.inbox.clone()))
        .collect()
}

/// Completion handle for detached work.
///
/// Dropping the handle leaves the task running; `abort` cancels it.
#[derive(Debug)]
pub struct DeliveryHandle<T> {
    task: JoinHandle<T>,
}

impl<T: Send + 'static> DeliveryHandle<T> {
    /// Spawn `future` on the runtime and return its handle.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            task: tokio::spawn(future),
        }
    }

    /// Wait for the task to finish.
    pub async fn wait(self) -> Result<T, AppError> {
        self.task
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("delivery task failed: {}", e)))
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Delivers activities through the signed transport with retry.
#[derive(Clone)]
pub struct DeliveryQueue {
    transport: SignedTransport,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl DeliveryQueue {
    pub fn new(transport: SignedTransport, retry: RetryPolicy, max_concurrent: usize) -> Self {
        Self {
            transport,
            retry,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn transport(&self) -> &SignedTransport {
        &self.transport
    }

    /// Deliver `activity` to `inbox`, retrying transient failures.
    pub async fn deliver(&self, signer: &Signer, activity: &Value, inbox: &str) -> DeliveryOutcome {
        let activity_type = activity
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        let mut attempt: u32 = 0;

        loop {
            let result = {
                let _permit = self.permits.acquire().await.ok();
                self.transport.signed_post(signer, activity, inbox).await
            };

            match result {
                Ok(response) => {
                    tracing::info!(
                        inbox = %inbox,
                        activity_type,
                        status = response.status,
                        attempts = attempt + 1,
                        "Delivered activity"
                    );
                    ACTIVITIES_SENT.with_label_values(&[activity_type]).inc();
                    DELIVERIES_TOTAL.with_label_values(&["delivered"]).inc();
                    return DeliveryOutcome::Delivered {
                        inbox: inbox.to_string(),
                        attempts: attempt + 1,
                    };
                }
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        inbox = %inbox,
                        activity_type,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    let dead = DeadLetter {
                        inbox: inbox.to_string(),
                        activity_id: activity.get("id").and_then(Value::as_str).map(str::to_string),
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                        failed_at: chrono::Utc::now(),
                    };
                    tracing::error!(
                        inbox = %dead.inbox,
                        activity_type,
                        activity_id = ?dead.activity_id,
                        attempts = dead.attempts,
                        error = %dead.last_error,
                        "Delivery dead-lettered"
                    );
                    DELIVERIES_TOTAL.with_label_values(&["dead_letter"]).inc();
                    return DeliveryOutcome::DeadLettered(dead);
                }
            }
        }
    }

    /// Deliver `activity` to every target concurrently.
    ///
    /// When a primary inbox dead-letters, its fallback inboxes are tried.
    pub async fn fan_out(
        &self,
        signer: &Signer,
        activity: &Value,
        targets: Vec<DeliveryTarget>,
    ) -> Vec<DeliveryOutcome> {
        let total_targets = targets.len();
        let targets = unique_targets(targets);

        tracing::info!(
            "Delivering to {} unique inboxes (deduplicated from {} total)",
            targets.len(),
            total_targets
        );

        let deliveries = targets.iter().map(|target| async move {
            let outcome = self.deliver(signer, activity, &target.inbox).await;
            if outcome.is_delivered() || target.fallback.is_empty() {
                return vec![outcome];
            }

            tracing::warn!(
                inbox = %target.inbox,
                fallbacks = target.fallback.len(),
                "Shared inbox unreachable, falling back to personal inboxes"
            );
            let fallbacks = target
                .fallback
                .iter()
                .map(|inbox| self.deliver(signer, activity, inbox));
            futures::future::join_all(fallbacks).await
        });

        let results: Vec<DeliveryOutcome> = futures::future::join_all(deliveries)
            .await
            .into_iter()
            .flatten()
            .collect();

        let success_count = results.iter().filter(|r| r.is_delivered()).count();
        tracing::info!(
            "Batch delivery complete: {} succeeded, {} failed",
            success_count,
            results.len() - success_count
        );

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::keys::tests::test_keyring;
    use axum::http::StatusCode;
    use axum::{Router, routing::post};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        }
    }

    fn queue(retry: RetryPolicy) -> DeliveryQueue {
        let transport = SignedTransport::new("fedserve/test", Duration::from_secs(5)).unwrap();
        DeliveryQueue::new(transport, retry, 4)
    }

    /// Inbox that answers 503 for the first `failures` requests, then 202.
    async fn flaky_inbox(failures: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/inbox",
            post(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < failures {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::ACCEPTED
                    }
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/inbox", addr), hits)
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(400), Duration::from_secs(5));
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn unique_targets_keeps_first_of_each_inbox() {
        let targets = unique_targets(vec![
            DeliveryTarget::direct("https://a.example/inbox"),
            DeliveryTarget::direct("https://a.example/users/x/inbox"),
            DeliveryTarget::direct("https://a.example/inbox"),
        ]);
        assert_eq!(
            targets,
            vec![
                DeliveryTarget::direct("https://a.example/inbox"),
                DeliveryTarget::direct("https://a.example/users/x/inbox"),
            ]
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (inbox, hits) = flaky_inbox(2).await;
        let signer = test_keyring().signer("https://social.example/alice#main-key");

        let outcome = queue(fast_retry(3))
            .deliver(&signer, &serde_json::json!({"type": "Create"}), &inbox)
            .await;

        assert!(matches!(outcome, DeliveryOutcome::Delivered { attempts: 3, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let (inbox, hits) = flaky_inbox(usize::MAX).await;
        let signer = test_keyring().signer("https://social.example/alice#main-key");

        let outcome = queue(fast_retry(2))
            .deliver(
                &signer,
                &serde_json::json!({"type": "Create", "id": "https://social.example/alice/item/1"}),
                &inbox,
            )
            .await;

        match outcome {
            DeliveryOutcome::DeadLettered(dead) => {
                assert_eq!(dead.attempts, 3);
                assert_eq!(
                    dead.activity_id.as_deref(),
                    Some("https://social.example/alice/item/1")
                );
                assert!(dead.last_error.contains("503"));
            }
            other => panic!("expected dead letter, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreachable_shared_inbox_falls_back_to_personal_inboxes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_shared = format!("http://{}/inbox", listener.local_addr().unwrap());
        drop(listener);
        let (personal_a, hits_a) = flaky_inbox(0).await;
        let (personal_b, hits_b) = flaky_inbox(0).await;
        let signer = test_keyring().signer("https://social.example/alice#main-key");

        let outcomes = queue(RetryPolicy::none())
            .fan_out(
                &signer,
                &serde_json::json!({"type": "Announce"}),
                vec![DeliveryTarget {
                    inbox: dead_shared,
                    fallback: vec![personal_a, personal_b],
                }],
            )
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(DeliveryOutcome::is_delivered));
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handle_reports_result_and_can_abort() {
        let handle = DeliveryHandle::spawn(async { 7 });
        assert_eq!(handle.wait().await.unwrap(), 7);

        let handle = DeliveryHandle::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        handle.abort();
        assert!(handle.wait().await.is_err());
    }
}
