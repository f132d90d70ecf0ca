//! HTTP client for the corporate chat service API.
//!
//! External calls here are never made while a database transaction is
//! open; callers sequence persistence and delivery explicitly.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::limiter::RateLimiter;
use super::{ChatError, ChatMessaging, ChatTaskOps, RoomMember};
use crate::config::ChatConfig;

/// Retry attempts for transient chat failures.
const RETRY_ATTEMPTS: u32 = 3;

/// Base delay for the first retry.
const RETRY_BASE_MS: u64 = 300;

/// Longest the sender will wait on the token bucket before giving up.
const MAX_THROTTLE_WAIT: Duration = Duration::from_secs(5);

/// HTTP chat client with per-tenant throttling.
pub struct HttpChatClient {
    config: ChatConfig,
    api_token: String,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl HttpChatClient {
    /// Create a client from config plus the API token from the environment.
    pub fn new(config: ChatConfig, api_token: String) -> Self {
        let limiter = RateLimiter::new(config.sends_per_minute);
        Self {
            config,
            api_token,
            client: reqwest::Client::new(),
            limiter,
        }
    }

    async fn post_with_retry(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<Value, ChatError> {
        let url = format!("{}/{path}", self.config.base_url.trim_end_matches('/'));
        let mut last_err = None;
        for attempt in 0..RETRY_ATTEMPTS {
            match self.post_once(&url, form).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                    warn!(attempt, error = %err, "chat call failed, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| ChatError::Transport("retries exhausted".to_owned())))
    }

    async fn post_once(&self, url: &str, form: &[(&str, String)]) -> Result<Value, ChatError> {
        let response = self
            .client
            .post(url)
            .header("x-chat-token", &self.api_token)
            .form(form)
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 429 || status >= 500 {
            return Err(ChatError::Unavailable(status));
        }
        if status >= 400 {
            return Err(ChatError::Rejected(status));
        }
        response
            .json()
            .await
            .map_err(|e| ChatError::Malformed(e.to_string()))
    }

    async fn get_with_retry(&self, path: &str) -> Result<Value, ChatError> {
        let url = format!("{}/{path}", self.config.base_url.trim_end_matches('/'));
        let mut last_err = None;
        for attempt in 0..RETRY_ATTEMPTS {
            let result = async {
                let response = self
                    .client
                    .get(&url)
                    .header("x-chat-token", &self.api_token)
                    .send()
                    .await
                    .map_err(|e| ChatError::Transport(e.to_string()))?;
                let status = response.status().as_u16();
                if status == 429 || status >= 500 {
                    return Err(ChatError::Unavailable(status));
                }
                if status >= 400 {
                    return Err(ChatError::Rejected(status));
                }
                response
                    .json::<Value>()
                    .await
                    .map_err(|e| ChatError::Malformed(e.to_string()))
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                    tokio::time::sleep(backoff(attempt)).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| ChatError::Transport("retries exhausted".to_owned())))
    }

    async fn throttle(&self, tenant_id: Uuid) -> Result<(), ChatError> {
        match self.limiter.try_acquire(tenant_id) {
            Ok(()) => Ok(()),
            Err(wait) if wait <= MAX_THROTTLE_WAIT => {
                tokio::time::sleep(wait).await;
                // One token has accrued by now; a second failure means the
                // bucket is being drained faster than it refills.
                self.limiter
                    .try_acquire(tenant_id)
                    .map_err(|_| ChatError::RateLimited)
            }
            Err(_) => Err(ChatError::RateLimited),
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let base = RETRY_BASE_MS.saturating_mul(2_u64.saturating_pow(attempt));
    let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.5);
    Duration::from_millis(base).mul_f64(jitter)
}

#[async_trait]
impl ChatMessaging for HttpChatClient {
    async fn send_message(
        &self,
        tenant_id: Uuid,
        room_id: &str,
        text: &str,
    ) -> Result<String, ChatError> {
        self.throttle(tenant_id).await?;
        let payload = self
            .post_with_retry(
                &format!("rooms/{room_id}/messages"),
                &[("body", text.to_owned())],
            )
            .await?;
        payload
            .get("message_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| ChatError::Malformed("missing message_id".to_owned()))
    }
}

#[async_trait]
impl ChatTaskOps for HttpChatClient {
    async fn create_task(
        &self,
        tenant_id: Uuid,
        room_id: &str,
        body: &str,
        assignee_account_ids: &[String],
        due_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, ChatError> {
        self.throttle(tenant_id).await?;
        let mut form = vec![
            ("body", body.to_owned()),
            ("to_ids", assignee_account_ids.join(",")),
        ];
        if let Some(due) = due_at {
            form.push(("limit", due.timestamp().to_string()));
        }
        let payload = self
            .post_with_retry(&format!("rooms/{room_id}/tasks"), &form)
            .await?;
        payload
            .get("task_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .ok_or_else(|| ChatError::Malformed("missing task_ids".to_owned()))
    }

    async fn room_members(
        &self,
        _tenant_id: Uuid,
        room_id: &str,
    ) -> Result<Vec<RoomMember>, ChatError> {
        let payload = self.get_with_retry(&format!("rooms/{room_id}/members")).await?;
        let members = payload
            .as_array()
            .or_else(|| payload.get("members").and_then(Value::as_array))
            .ok_or_else(|| ChatError::Malformed("missing members array".to_owned()))?;
        Ok(members
            .iter()
            .filter_map(|member| {
                let account_id = member.get("account_id").and_then(Value::as_str)?;
                let name = member.get("name").and_then(Value::as_str).unwrap_or("");
                Some(RoomMember {
                    account_id: account_id.to_owned(),
                    name: name.to_owned(),
                })
            })
            .collect())
    }
}
