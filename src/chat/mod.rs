//! Chat service seam.
//!
//! Two traits split the outbound surface so the handler layer can hold
//! task operations without ever being able to send a message:
//! [`ChatMessaging`] (Post layer and announcement executor only) and
//! [`ChatTaskOps`] (handlers, via Execution). The HTTP implementation in
//! [`client`] implements both, with per-tenant token-bucket throttling on
//! sends and the standard transient-retry policy.

pub mod client;
pub mod limiter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Chat service errors.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Network-level failure (retryable).
    #[error("chat transport error: {0}")]
    Transport(String),
    /// 429 or 5xx (retryable).
    #[error("chat service unavailable: status {0}")]
    Unavailable(u16),
    /// Other 4xx (not retryable).
    #[error("chat service rejected request: status {0}")]
    Rejected(u16),
    /// Response body did not parse.
    #[error("chat response malformed: {0}")]
    Malformed(String),
    /// Per-tenant rate limit would be exceeded and the wait was too long.
    #[error("chat rate limit exceeded")]
    RateLimited,
}

impl ChatError {
    /// Whether the retry policy applies.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Unavailable(_))
    }
}

/// A member of a chat room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMember {
    pub account_id: String,
    pub name: String,
}

/// Message delivery: Post layer and announcement executor only.
#[async_trait]
pub trait ChatMessaging: Send + Sync {
    /// Send a message to a room. Returns the chat-service message id.
    async fn send_message(
        &self,
        tenant_id: Uuid,
        room_id: &str,
        text: &str,
    ) -> Result<String, ChatError>;
}

/// Task and directory operations, safe for handlers.
#[async_trait]
pub trait ChatTaskOps: Send + Sync {
    /// Create a task in a room for the given account ids. Returns the
    /// chat-service task ids, one per assignee.
    async fn create_task(
        &self,
        tenant_id: Uuid,
        room_id: &str,
        body: &str,
        assignee_account_ids: &[String],
        due_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, ChatError>;

    /// List the members of a room.
    async fn room_members(
        &self,
        tenant_id: Uuid,
        room_id: &str,
    ) -> Result<Vec<RoomMember>, ChatError>;
}
