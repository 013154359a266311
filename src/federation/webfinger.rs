//! WebFinger discovery for local actors

use serde::{Deserialize, Serialize};

use super::transport::ACTIVITY_JSON;
use crate::error::AppError;

/// WebFinger JRD response
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Split `acct:name@host` into its name and host.
pub fn parse_acct(resource: &str) -> Result<(&str, &str), AppError> {
    let acct = resource
        .strip_prefix("acct:")
        .ok_or_else(|| AppError::Validation("Resource must start with 'acct:'".to_string()))?;

    match acct.split_once('@') {
        Some((name, host)) if !name.is_empty() && !host.is_empty() && !host.contains('@') => {
            Ok((name, host))
        }
        _ => Err(AppError::Validation(format!(
            "Invalid acct resource: {}",
            resource
        ))),
    }
}

/// JRD for a local actor, linking `self` to its IRI.
pub fn webfinger_response(name: &str, host: &str, actor_iri: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", name, host),
        aliases: Some(vec![actor_iri.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_JSON.to_string()),
            href: Some(actor_iri.to_string()),
        }],
    }
}
