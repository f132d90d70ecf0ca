//! Webhook server: the thin transport adapter in front of the Brain.
//!
//! `POST /webhook/{org_key}` verifies the per-tenant HMAC-SHA256
//! signature over the raw body, normalizes the chat service's envelope
//! into an [`InboundMessage`], and runs the Brain. Semantic failures
//! answer 200 so the chat service does not redeliver; only signature
//! failures (401) and catastrophic errors (5xx) differ.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{info, warn};

use crate::brain::Brain;
use crate::store::Db;
use crate::types::InboundMessage;

type HmacSha256 = Hmac<Sha256>;

/// Signature header set by the chat service.
pub const SIGNATURE_HEADER: &str = "x-chatwebhook-signature";

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub brain: Arc<Brain>,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/:org_key", post(handle_webhook))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Verify a base64 HMAC-SHA256 signature over the raw body.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(signature.trim()) else {
        return false;
    };
    mac.verify_slice(&expected).is_ok()
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(state.db.pool())
        .await
        .is_ok();
    let status = if db_ok { "ok" } else { "degraded" };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({"status": status})))
}

async fn handle_webhook(
    State(state): State<AppState>,
    Path(org_key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    // Tenant + signature first: no secret, no service.
    let tenant = match state.db.tenant_by_org_key(&org_key).await {
        Ok(Some(tenant)) => tenant,
        Ok(None) => {
            warn!(org_key = %org_key, "webhook for unknown organization");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(err) => {
            warn!(error = %err, "tenant lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !verify_signature(&tenant.webhook_secret, &body, signature) {
        warn!(org_key = %org_key, "webhook signature mismatch");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        // Malformed body: answer 200 so the service does not redeliver.
        return (StatusCode::OK, Json(json!({"handled": false}))).into_response();
    };

    let Some(message) = parse_message(&payload, tenant.id) else {
        return (StatusCode::OK, Json(json!({"handled": false}))).into_response();
    };

    info!(message_id = %message.message_id, "webhook accepted");
    let reply = state.brain.handle(message).await;
    (
        StatusCode::OK,
        Json(json!({"handled": true, "replied": reply.is_some()})),
    )
        .into_response()
}

/// Normalize the chat service's webhook envelope.
fn parse_message(payload: &Value, tenant_id: uuid::Uuid) -> Option<InboundMessage> {
    let event = payload.get("webhook_event").unwrap_or(payload);
    let message_id = string_field(event, "message_id")?;
    let room_id = string_field(event, "room_id")?;
    let account_id = string_field(event, "account_id")?;
    let body = event.get("body").and_then(Value::as_str)?.to_owned();
    let sender_name = event
        .get("account_name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_owned();
    let sent_at = event
        .get("send_time")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    Some(InboundMessage {
        message_id,
        tenant_id,
        room_id,
        account_id,
        sender_name,
        body,
        sent_at,
    })
}

/// Ids arrive as strings or numbers depending on the event type.
fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
