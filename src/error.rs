//! Error types for fedserve
//!
//! Every fallible operation in the crate returns `AppError`, which
//! implements `IntoResponse` so HTTP handlers can propagate it with `?`.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Actor name or item hash unsafe for use as a path segment (400)
    #[error("Illegal identifier: {0:?}")]
    IllegalIdentifier(String),

    /// Actor or item absent (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Descriptor, key block or stored activity could not be parsed (500)
    #[error("Corrupt persisted state: {0}")]
    CorruptPersistedState(String),

    /// Stored or supplied key material could not be parsed (500)
    #[error("Key format error: {0}")]
    KeyFormat(String),

    /// Remote host could not be reached (502)
    #[error("Remote unreachable: {0}")]
    RemoteUnreachable(String),

    /// Remote answered with a non-success status (502)
    #[error("Remote protocol error: {url} answered {status}")]
    RemoteProtocolError { url: String, status: u16 },

    /// Remote document unparseable or missing required fields (502)
    #[error("Remote document malformed: {0}")]
    RemoteMalformed(String),

    /// Request signing could not be set up (500)
    #[error("Signature error: {0}")]
    Signature(String),

    /// Signed request answered with a status outside 200/201/202 (502)
    #[error("Transport failure: {url} answered {status}")]
    TransportFailure {
        url: String,
        status: u16,
        body: String,
        headers: HeaderMap,
    },

    /// Delivery dead-lettered after exhausting its retries (502)
    #[error("Delivery to {inbox} failed after {attempts} attempts: {last_error}")]
    DeliveryFailed {
        inbox: String,
        attempts: u32,
        last_error: String,
    },

    /// Inbound activity undecodable or missing fields (400)
    #[error("Malformed activity: {0}")]
    MalformedActivity(String),

    /// Inbound activity not addressed to the local actor (400)
    #[error("Misdirected activity: {0}")]
    MisdirectedActivity(String),

    /// Inbound signature missing or does not verify (401)
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Request parameters rejected (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error (500)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether a delivery that failed with this error may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::RemoteUnreachable(_) => true,
            AppError::TransportFailure { status, .. }
            | AppError::RemoteProtocolError { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Maps each variant to a status code and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::IllegalIdentifier(_) => (
                StatusCode::BAD_REQUEST,
                self.to_string(),
                "illegal_identifier",
            ),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::MalformedActivity(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "malformed_activity")
            }
            AppError::MisdirectedActivity(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "misdirected_activity")
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::InvalidSignature(_) => (
                StatusCode::UNAUTHORIZED,
                self.to_string(),
                "invalid_signature",
            ),
            AppError::RemoteUnreachable(_)
            | AppError::RemoteProtocolError { .. }
            | AppError::RemoteMalformed(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string(), "remote")
            }
            AppError::TransportFailure { .. } | AppError::DeliveryFailed { .. } => {
                (StatusCode::BAD_GATEWAY, self.to_string(), "transport")
            }
            AppError::CorruptPersistedState(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Stored state is corrupt".to_string(),
                "corrupt_state",
            ),
            AppError::KeyFormat(_) | AppError::Signature(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Key material unavailable".to_string(),
                "keys",
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Storage error".to_string(),
                "io",
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}
