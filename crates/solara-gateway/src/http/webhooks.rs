//! Inbound message endpoint: POST /webhooks/{source}.
//!
//! The messaging gateway in front of Solara posts normalised inbound events
//! here, one object or an array of them. Each source is authenticated
//! independently according to its `auth_mode` in `SolaraConfig::webhooks`.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use solara_core::config::{WebhookAuthMode, WebhookSourceConfig};
use solara_core::types::InboundMessage;
use solara_core::SolaraError;
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Deserialize)]
#[serde(untagged)]
enum WebhookBody {
    Many(Vec<InboundMessage>),
    One(InboundMessage),
}

impl WebhookBody {
    fn into_messages(self) -> Vec<InboundMessage> {
        match self {
            WebhookBody::Many(messages) => messages,
            WebhookBody::One(message) => vec![message],
        }
    }
}

// ── Public handler ────────────────────────────────────────────────────────────

/// POST /webhooks/{source}
///
/// 200 carries one result per message, in body order. 503 carries the same
/// list when at least one message could not be processed yet and should be
/// redelivered; already-accepted messages come back as duplicates on retry.
/// 401 is an auth failure, 400 an unreadable body, 404 a disabled or unknown
/// source.
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cfg = &state.config.webhooks;

    if !cfg.enabled {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "webhooks are disabled"})),
        ));
    }

    let Some(source_cfg) = cfg.sources.iter().find(|s| s.name == source) else {
        warn!(source = %source, "webhook for unconfigured source");
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no webhook source named {}", source)})),
        ));
    };

    authenticate(source_cfg, &headers, &body).map_err(|e| {
        warn!(source = %source, error = %e, "webhook rejected");
        reject(StatusCode::UNAUTHORIZED, e)
    })?;

    let messages = serde_json::from_slice::<WebhookBody>(&body)
        .map_err(|e| {
            warn!(source = %source, error = %e, "invalid webhook body");
            reject(StatusCode::BAD_REQUEST, SolaraError::InvalidEvent(e.to_string()))
        })?
        .into_messages();

    if messages.is_empty() {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            SolaraError::InvalidEvent("no messages in body".to_string()),
        ));
    }

    info!(source = %source, count = messages.len(), "webhook accepted");

    let mut results = Vec::with_capacity(messages.len());
    let mut retry = false;
    for message in messages {
        let id = message.id.clone();
        match state.pipeline.ingest(message).await {
            Ok(outcome) => {
                let mut entry = serde_json::to_value(&outcome).unwrap_or_default();
                entry["id"] = json!(id);
                results.push(entry);
            }
            Err(e) => {
                warn!(source = %source, id = %id, error = %e, "message rejected by pipeline");
                retry |= e.is_retryable();
                results.push(json!({"id": id, "error": e.to_string(), "retryable": e.is_retryable()}));
            }
        }
    }

    if retry {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ok": false, "results": results})),
        ));
    }
    Ok(Json(json!({"ok": true, "results": results})))
}

// ── Authentication ────────────────────────────────────────────────────────────

fn authenticate(
    source: &WebhookSourceConfig,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), SolaraError> {
    match source.auth_mode {
        WebhookAuthMode::None => Ok(()),
        WebhookAuthMode::HmacSha256 => check_signature(headers, body, source.secret.as_deref()),
        WebhookAuthMode::BearerToken => check_bearer(headers, source.secret.as_deref()),
    }
}

fn denied(reason: &str) -> SolaraError {
    SolaraError::AuthFailed(reason.to_string())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `X-Hub-Signature-256: sha256=<hex>` computed over the raw body.
fn check_signature(headers: &HeaderMap, body: &[u8], secret: Option<&str>) -> Result<(), SolaraError> {
    let secret = secret.ok_or_else(|| denied("source has no signing secret"))?;
    let digest = header(headers, SIGNATURE_HEADER)
        .ok_or_else(|| denied("signature header missing"))?
        .strip_prefix("sha256=")
        .ok_or_else(|| denied("signature must start with sha256="))
        .and_then(|h| hex::decode(h).map_err(|_| denied("signature is not hex")))?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| denied("unusable signing secret"))?;
    mac.update(body);
    mac.verify_slice(&digest).map_err(|_| denied("signature does not match body"))
}

fn check_bearer(headers: &HeaderMap, secret: Option<&str>) -> Result<(), SolaraError> {
    let expected = secret.ok_or_else(|| denied("source has no bearer token"))?;
    let presented = header(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| denied("bearer token missing"))?;

    // Full-length compare; timing must not reveal a matching prefix.
    let same = presented.len() == expected.len()
        && presented
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
    if same {
        Ok(())
    } else {
        Err(denied("bearer token does not match"))
    }
}

fn reject(status: StatusCode, err: SolaraError) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({"error": err.to_string(), "code": err.code()})),
    )
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
