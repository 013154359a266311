//! HTTP Signatures
//!
//! Outbound requests sign `(request-target) date host digest`, in that
//! order, with rsa-sha256. Inbound verification accepts any header list
//! that covers at least `(request-target)`, `host` and `date`, plus
//! `digest` when the request has a body.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::keys::{Signer, parse_public_key, verify_rsa_sha256};
use crate::error::AppError;

/// Headers covered by every outbound signature
pub const SIGNED_HEADERS: [&str; 4] = ["(request-target)", "date", "host", "digest"];

/// Maximum clock skew accepted on inbound `Date`
const MAX_DATE_SKEW_SECS: i64 = 300;

/// Headers to add for a signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (IMF-fixdate)
    pub date: String,
    /// Host header value, including a non-default port
    pub host: String,
    /// Digest header value; empty for bodiless requests
    pub digest: String,
}

/// Current time as an HTTP-date.
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Authority used for the `Host` header.
pub fn host_header(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Signature(format!("missing host in {}", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn request_target(method: &str, url: &url::Url) -> String {
    match url.query() {
        Some(q) => format!("{} {}?{}", method.to_lowercase(), url.path(), q),
        None => format!("{} {}", method.to_lowercase(), url.path()),
    }
}

/// Sign an HTTP request.
///
/// `body` of `None` produces an empty `Digest` header, which is still signed.
pub fn sign_request(
    signer: &Signer,
    method: &str,
    url: &url::Url,
    body: Option<&[u8]>,
) -> Result<SignatureHeaders, AppError> {
    let host = host_header(url)?;
    let date = http_date();
    let digest = body.map(generate_digest).unwrap_or_default();

    let signing_string = [
        format!("(request-target): {}", request_target(method, url)),
        format!("date: {}", date),
        format!("host: {}", host),
        format!("digest: {}", digest),
    ]
    .join("\n");

    let signature_b64 = BASE64.encode(signer.sign(signing_string.as_bytes()));

    let signature = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        signer.key_id(),
        SIGNED_HEADERS.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature,
        date,
        host,
        digest,
    })
}

/// Verify an inbound request signature against `public_key_pem`.
///
/// `path` is the request path including any query string.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::InvalidSignature(format!(
            "unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::InvalidSignature(format!(
                "signed headers must include: {}",
                required
            )));
        }
    }
    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::InvalidSignature(
            "signed headers must include: digest".to_string(),
        ));
    }

    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| AppError::InvalidSignature("invalid Date format".to_string()))?;
    if (Utc::now().timestamp() - date.timestamp()).abs() > MAX_DATE_SKEW_SECS {
        return Err(AppError::InvalidSignature(
            "Date header too old or in future".to_string(),
        ));
    }

    if let Some(body) = body {
        if header_str(headers, "digest")? != generate_digest(body) {
            return Err(AppError::InvalidSignature("digest mismatch".to_string()));
        }
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        let value = match name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            other => header_str(headers, other)?.to_string(),
        };
        signing_parts.push(format!("{}: {}", name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::InvalidSignature("invalid signature encoding".to_string()))?;
    let public_key = parse_public_key(public_key_pem)
        .map_err(|e| AppError::InvalidSignature(e.to_string()))?;

    verify_rsa_sha256(&public_key, signing_string.as_bytes(), &signature)
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::InvalidSignature(format!("missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::InvalidSignature(format!("invalid {} header", name)))
}

/// Extract keyId from Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;
    Ok(parsed.key_id)
}

/// Whether the signature keyId belongs to the activity's actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    /// Signed header names, lowercased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let missing = |field: &str| AppError::InvalidSignature(format!("missing {}", field));
    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| missing("keyId"))?,
        // Draft-cavage defaults the algorithm when absent.
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature.ok_or_else(|| missing("signature"))?,
    })
}

/// `SHA-256=base64(sha256(body))`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", BASE64.encode(hasher.finalize()))
}
