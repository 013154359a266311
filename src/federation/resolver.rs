//! Remote actor resolution
//!
//! Fetches a remote actor document with a plain content-negotiated GET.
//! Nothing is cached; every call is a fresh round trip.

use serde_json::Value;

use super::transport::{ACTIVITY_JSON, SignedTransport};
use crate::error::AppError;

/// Delivery-relevant parts of a remote actor document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteActorProfile {
    pub iri: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub public_key_pem: Option<String>,
}

impl RemoteActorProfile {
    /// Parse a fetched actor document.
    pub fn from_document(iri: &str, document: &Value) -> Result<Self, AppError> {
        let object = document
            .as_object()
            .ok_or_else(|| AppError::RemoteMalformed(format!("{} is not a JSON object", iri)))?;

        let inbox = object
            .get("inbox")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::RemoteMalformed(format!("{} has no inbox", iri)))?
            .to_string();

        let string_field = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);
        let public_key = object.get("publicKey");

        Ok(Self {
            iri: string_field(object.get("id")).unwrap_or_else(|| iri.to_string()),
            inbox,
            shared_inbox: string_field(
                object
                    .get("endpoints")
                    .and_then(|endpoints| endpoints.get("sharedInbox")),
            ),
            public_key_pem: string_field(public_key.and_then(|key| key.get("publicKeyPem"))),
        })
    }
}

/// Looks up remote actor profiles over HTTP
#[derive(Clone)]
pub struct RemoteActorResolver {
    transport: SignedTransport,
}

impl RemoteActorResolver {
    pub fn new(transport: SignedTransport) -> Self {
        Self { transport }
    }

    pub async fn resolve(&self, iri: &str) -> Result<RemoteActorProfile, AppError> {
        let response = self
            .transport
            .client()
            .get(iri)
            .header("Accept", ACTIVITY_JSON)
            .header("Accept-Charset", "utf-8")
            .send()
            .await
            .map_err(|e| AppError::RemoteUnreachable(format!("GET {}: {}", iri, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::RemoteProtocolError {
                url: iri.to_string(),
                status: status.as_u16(),
            });
        }

        let document: Value = response
            .json()
            .await
            .map_err(|e| AppError::RemoteMalformed(format!("{}: {}", iri, e)))?;

        let profile = RemoteActorProfile::from_document(iri, &document)?;
        tracing::debug!(
            actor = %profile.iri,
            inbox = %profile.inbox,
            shared_inbox = ?profile.shared_inbox,
            "Resolved remote actor"
        );
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::{Json, Router, routing::get};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn resolver() -> RemoteActorResolver {
        RemoteActorResolver::new(
            SignedTransport::new("fedserve/test", Duration::from_secs(5)).unwrap(),
        )
    }

    #[test]
    fn from_document_reads_optional_endpoints() {
        let profile = RemoteActorProfile::from_document(
            "https://peer.example/bob",
            &json!({
                "id": "https://peer.example/bob",
                "inbox": "https://peer.example/bob/inbox",
                "url": "https://peer.example/@bob",
                "endpoints": {"sharedInbox": "https://peer.example/inbox"},
                "publicKey": {"id": "https://peer.example/bob#main-key", "publicKeyPem": "PEM"}
            }),
        )
        .unwrap();

        assert_eq!(profile.inbox, "https://peer.example/bob/inbox");
        assert_eq!(
            profile.shared_inbox.as_deref(),
            Some("https://peer.example/inbox")
        );
        assert_eq!(profile.public_key_pem.as_deref(), Some("PEM"));
    }

    #[test]
    fn from_document_requires_inbox() {
        let result = RemoteActorProfile::from_document(
            "https://peer.example/bob",
            &json!({"id": "https://peer.example/bob"}),
        );
        assert!(matches!(result, Err(AppError::RemoteMalformed(_))));

        let result = RemoteActorProfile::from_document("https://peer.example/bob", &json!([1]));
        assert!(matches!(result, Err(AppError::RemoteMalformed(_))));
    }

    #[tokio::test]
    async fn resolve_negotiates_activity_json() {
        let app = Router::new().route(
            "/bob",
            get(|headers: HeaderMap| async move {
                if headers["accept"] != ACTIVITY_JSON {
                    return Err(StatusCode::NOT_ACCEPTABLE);
                }
                Ok(Json(json!({"inbox": "https://peer.example/bob/inbox"})))
            }),
        );
        let base = serve(app).await;

        let profile = resolver().resolve(&format!("{}/bob", base)).await.unwrap();
        assert_eq!(profile.inbox, "https://peer.example/bob/inbox");
        assert_eq!(profile.iri, format!("{}/bob", base));
    }

    #[tokio::test]
    async fn resolve_classifies_failures() {
        let app = Router::new()
            .route("/gone", get(|| async { StatusCode::GONE }))
            .route("/garbage", get(|| async { "not json" }));
        let base = serve(app).await;

        assert!(matches!(
            resolver().resolve(&format!("{}/gone", base)).await,
            Err(AppError::RemoteProtocolError { status: 410, .. })
        ));
        assert!(matches!(
            resolver().resolve(&format!("{}/garbage", base)).await,
            Err(AppError::RemoteMalformed(_))
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = format!("http://{}/carol", listener.local_addr().unwrap());
        drop(listener);
        assert!(matches!(
            resolver().resolve(&dead).await,
            Err(AppError::RemoteUnreachable(_))
        ));
    }
}
