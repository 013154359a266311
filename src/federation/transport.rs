//! Signed HTTP transport
//!
//! Performs outbound GET and POST requests on behalf of a local actor.
//! No retry happens here; callers own that policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use http::HeaderMap;
use serde_json::Value;

use super::keys::Signer;
use super::signature::sign_request;
use crate::error::AppError;
use crate::metrics::{DELIVERY_ATTEMPTS_TOTAL, FEDERATION_REQUEST_DURATION_SECONDS};

pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Accept value used when fetching ActivityStreams documents with a signed GET
pub const ACTIVITY_STREAMS_PROFILE: &str =
    "application/activity+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Response from a successful signed request
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
    pub headers: HeaderMap,
}

/// Outbound HTTP client owned by the federation engine
#[derive(Clone)]
pub struct SignedTransport {
    http_client: Arc<reqwest::Client>,
    user_agent: String,
}

impl SignedTransport {
    /// Build a client that identifies itself as `user_agent` and bounds
    /// every request by `timeout`.
    pub fn new(user_agent: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let user_agent = user_agent.into();
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent.clone())
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("HTTP client init failed: {}", e)))?;

        Ok(Self {
            http_client: Arc::new(http_client),
            user_agent,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// POST `body` to `destination`, signed by `signer`.
    ///
    /// Only 200, 201 and 202 count as success.
    pub async fn signed_post(
        &self,
        signer: &Signer,
        body: &Value,
        destination: &str,
    ) -> Result<TransportResponse, AppError> {
        let url = url::Url::parse(destination)
            .map_err(|e| AppError::Signature(format!("invalid destination {}: {}", destination, e)))?;
        let payload = serde_json::to_vec(body)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize activity: {}", e)))?;
        let signed = sign_request(signer, "POST", &url, Some(&payload))?;

        let request = self
            .http_client
            .post(url.clone())
            .header("Accept-Charset", "utf-8")
            .header("Date", &signed.date)
            .header("User-Agent", &self.user_agent)
            .header("Host", &signed.host)
            .header("Accept", ACTIVITY_JSON)
            .header("Content-Type", ACTIVITY_JSON)
            .header("Digest", &signed.digest)
            .header("Signature", &signed.signature)
            .body(payload);

        let started = Instant::now();
        let result = request.send().await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["POST"])
            .observe(started.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["error"]).inc();
                return Err(AppError::RemoteUnreachable(format!(
                    "POST {}: {}",
                    destination, e
                )));
            }
        };

        let status = response.status().as_u16();
        let status_label = status.to_string();
        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&[status_label.as_str()])
            .inc();
        let headers = response.headers().clone();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(
                    destination = %destination,
                    status,
                    error = %e,
                    "Could not read response body"
                );
                String::new()
            }
        };

        if !is_success(status) {
            tracing::debug!(
                destination = %destination,
                status,
                body = %body,
                "Signed POST rejected"
            );
            return Err(AppError::TransportFailure {
                url: destination.to_string(),
                status,
                body,
                headers,
            });
        }

        Ok(TransportResponse {
            status,
            body,
            headers,
        })
    }

    /// GET `url` signed by `signer`, with an empty `Digest` header.
    pub async fn signed_get(
        &self,
        signer: &Signer,
        url: &str,
        accept: &str,
    ) -> Result<String, AppError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| AppError::Signature(format!("invalid url {}: {}", url, e)))?;
        let signed = sign_request(signer, "GET", &parsed, None)?;

        let started = Instant::now();
        let result = self
            .http_client
            .get(parsed.clone())
            .header("Accept-Charset", "utf-8")
            .header("Date", &signed.date)
            .header("User-Agent", &self.user_agent)
            .header("Host", &signed.host)
            .header("Accept", accept)
            .header("Digest", &signed.digest)
            .header("Signature", &signed.signature)
            .send()
            .await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["GET"])
            .observe(started.elapsed().as_secs_f64());

        let response =
            result.map_err(|e| AppError::RemoteUnreachable(format!("GET {}: {}", url, e)))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if status == 200 => {
                return Err(AppError::RemoteUnreachable(format!(
                    "GET {}: reading body: {}",
                    url, e
                )));
            }
            Err(e) => {
                tracing::debug!(url = %url, status, error = %e, "Could not read response body");
                String::new()
            }
        };

        if status != 200 {
            return Err(AppError::TransportFailure {
                url: url.to_string(),
                status,
                body,
                headers,
            });
        }

        Ok(body)
    }
}

fn is_success(status: u16) -> bool {
    matches!(status, 200 | 201 | 202)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::keys::tests::test_keyring;
    use crate::federation::signature::verify_signature;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::{Router, routing::post};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Captured = Arc<Mutex<Vec<(AxumHeaders, Bytes)>>>;

    async fn spawn_inbox(status: StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/inbox",
                post(
                    move |State(captured): State<Captured>, headers: AxumHeaders, body: Bytes| async move {
                        captured.lock().unwrap().push((headers, body));
                        (status, "inbox says hi")
                    },
                ),
            )
            .with_state(captured.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}/inbox", addr), captured)
    }

    fn transport() -> SignedTransport {
        SignedTransport::new("fedserve/test", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn signed_post_carries_verifiable_signature() {
        let (inbox, captured) = spawn_inbox(StatusCode::ACCEPTED).await;
        let ring = test_keyring();
        let signer = ring.signer("https://social.example/alice#main-key");
        let activity = serde_json::json!({"type": "Follow", "actor": "https://social.example/alice"});

        let response = transport()
            .signed_post(&signer, &activity, &inbox)
            .await
            .expect("202 is success");
        assert_eq!(response.status, 202);

        let (headers, body) = captured.lock().unwrap().pop().expect("request captured");
        assert_eq!(headers["content-type"], ACTIVITY_JSON);
        assert_eq!(headers["accept"], ACTIVITY_JSON);
        assert_eq!(headers["accept-charset"], "utf-8");
        assert_eq!(headers["user-agent"], "fedserve/test");
        assert_eq!(
            serde_json::from_slice::<Value>(&body).unwrap(),
            activity
        );
        verify_signature("POST", "/inbox", &headers, Some(&body), ring.public_key_pem())
            .expect("peer can verify the signature");
    }

    #[tokio::test]
    async fn non_success_status_is_transport_failure_with_body() {
        let (inbox, _) = spawn_inbox(StatusCode::NO_CONTENT).await;
        let signer = test_keyring().signer("https://social.example/alice#main-key");

        match transport()
            .signed_post(&signer, &serde_json::json!({}), &inbox)
            .await
        {
            Err(AppError::TransportFailure { status, .. }) => assert_eq!(status, 204),
            other => panic!("expected transport failure, got: {other:?}"),
        }

        let (inbox, _) = spawn_inbox(StatusCode::FORBIDDEN).await;
        match transport()
            .signed_post(&signer, &serde_json::json!({}), &inbox)
            .await
        {
            Err(AppError::TransportFailure { status, body, .. }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "inbox says hi");
            }
            other => panic!("expected transport failure, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_destination_is_remote_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let signer = test_keyring().signer("https://social.example/alice#main-key");
        let result = transport()
            .signed_post(&signer, &serde_json::json!({}), &format!("http://{}/inbox", addr))
            .await;
        assert!(matches!(result, Err(AppError::RemoteUnreachable(_))));
    }

    /// Serve one response whose body is cut short of its declared length.
    async fn spawn_truncating(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: 100\r\nConnection: close\r\n\r\ncut",
                status_line
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}/actor", addr)
    }

    #[tokio::test]
    async fn truncated_body_fails_successful_get() {
        let url = spawn_truncating("200 OK").await;
        let signer = test_keyring().signer("https://social.example/alice#main-key");

        let result = transport().signed_get(&signer, &url, ACTIVITY_JSON).await;
        assert!(matches!(result, Err(AppError::RemoteUnreachable(_))), "{result:?}");
    }

    #[tokio::test]
    async fn truncated_error_body_keeps_status() {
        let url = spawn_truncating("404 Not Found").await;
        let signer = test_keyring().signer("https://social.example/alice#main-key");

        match transport().signed_get(&signer, &url, ACTIVITY_JSON).await {
            Err(AppError::TransportFailure { status, body, .. }) => {
                assert_eq!(status, 404);
                assert!(body.is_empty());
            }
            other => panic!("expected transport failure, got: {other:?}"),
        }
    }
}
