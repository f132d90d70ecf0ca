//! Single-writer actor for serialized, latency-tolerant appends.
//!
//! Conversation turns, audit entries, teaching usage bumps and preference
//! updates flow through this actor via an [`mpsc`](tokio::sync::mpsc)
//! channel. Serializing them prevents SQLite write contention while the
//! request path stays free of blocking writes. A [`WriteOp::Flush`] message
//! acknowledges once everything queued before it has been applied.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};
use uuid::Uuid;

use super::fmt_ts;
use crate::types::Classification;

/// Operations accepted by the write actor.
#[derive(Debug)]
pub enum WriteOp {
    /// Append a conversation turn.
    AppendTurn {
        tenant_id: Uuid,
        room_id: String,
        user_id: Uuid,
        /// "user" or "assistant".
        role: &'static str,
        content: String,
        at: DateTime<Utc>,
    },

    /// Append an audit entry.
    Audit {
        tenant_id: Uuid,
        actor: String,
        action: String,
        resource_type: String,
        resource_id: Option<String>,
        classification: Classification,
        at: DateTime<Utc>,
    },

    /// Increment a teaching's usage counter.
    BumpTeachingUsage { tenant_id: Uuid, teaching_id: Uuid },

    /// Upsert a user's preference bag.
    SavePreferences {
        tenant_id: Uuid,
        user_id: Uuid,
        preferences: serde_json::Value,
        at: DateTime<Utc>,
    },

    /// Acknowledge once all prior operations are applied.
    Flush(oneshot::Sender<()>),
}

/// Run the single-writer actor loop.
///
/// Processes [`WriteOp`] messages until the sender half is dropped.
pub async fn run_writer(db: SqlitePool, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Flush(ack) => {
                let _ = ack.send(());
            }
            other => {
                if let Err(err) = handle_op(&db, &other).await {
                    error!(?other, error = %err, "store write failed");
                }
            }
        }
    }
    trace!("store writer actor stopped");
}

async fn handle_op(db: &SqlitePool, op: &WriteOp) -> Result<(), sqlx::Error> {
    match op {
        WriteOp::AppendTurn {
            tenant_id,
            room_id,
            user_id,
            role,
            content,
            at,
        } => {
            sqlx::query(
                "INSERT INTO conversation_turns (tenant_id, room_id, user_id, role, content, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(tenant_id.to_string())
            .bind(room_id)
            .bind(user_id.to_string())
            .bind(role)
            .bind(content)
            .bind(fmt_ts(*at))
            .execute(db)
            .await?;
            trace!(%tenant_id, room = %room_id, role, "turn appended");
        }

        WriteOp::Audit {
            tenant_id,
            actor,
            action,
            resource_type,
            resource_id,
            classification,
            at,
        } => {
            sqlx::query(
                "INSERT INTO audit_log (tenant_id, actor, action, resource_type, resource_id, classification, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(tenant_id.to_string())
            .bind(actor)
            .bind(action)
            .bind(resource_type)
            .bind(resource_id.as_deref())
            .bind(classification.as_str())
            .bind(fmt_ts(*at))
            .execute(db)
            .await?;
            trace!(%tenant_id, action, "audit entry written");
        }

        WriteOp::BumpTeachingUsage {
            tenant_id,
            teaching_id,
        } => {
            sqlx::query(
                "UPDATE ceo_teachings SET usage_count = usage_count + 1 \
                 WHERE tenant_id = ?1 AND id = ?2",
            )
            .bind(tenant_id.to_string())
            .bind(teaching_id.to_string())
            .execute(db)
            .await?;
        }

        WriteOp::SavePreferences {
            tenant_id,
            user_id,
            preferences,
            at,
        } => {
            sqlx::query(
                "INSERT INTO user_preferences (tenant_id, user_id, preferences, updated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (tenant_id, user_id) \
                 DO UPDATE SET preferences = excluded.preferences, updated_at = excluded.updated_at",
            )
            .bind(tenant_id.to_string())
            .bind(user_id.to_string())
            .bind(preferences.to_string())
            .bind(fmt_ts(*at))
            .execute(db)
            .await?;
        }

        WriteOp::Flush(_) => {}
    }
    Ok(())
}
