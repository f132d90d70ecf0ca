//! Conversation state, turns, and rolling summaries.
//!
//! One state row per (tenant, room, user). Reads that observe an expired
//! row delete it in the same transaction and report `Normal`, so expiry is
//! atomic from the caller's point of view.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use super::{fmt_ts, parse_ts, StoreError, TenantDb};
use crate::store::writer::WriteOp;

/// Closed set of multi-step flow types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    /// No active flow.
    Normal,
    /// Goal-setting dialogue.
    GoalSetting,
    /// Announcement confirmation flow.
    Announcement,
    /// Pending yes/no/choice against a stored plan.
    Confirmation,
    /// Awaiting a missing task parameter.
    TaskPending,
    /// Sequential multi-plan execution.
    MultiAction,
}

impl StateType {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::GoalSetting => "goal_setting",
            Self::Announcement => "announcement",
            Self::Confirmation => "confirmation",
            Self::TaskPending => "task_pending",
            Self::MultiAction => "multi_action",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised state type.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "normal" => Ok(Self::Normal),
            "goal_setting" => Ok(Self::GoalSetting),
            "announcement" => Ok(Self::Announcement),
            "confirmation" => Ok(Self::Confirmation),
            "task_pending" => Ok(Self::TaskPending),
            "multi_action" => Ok(Self::MultiAction),
            other => Err(StoreError::InvalidValue {
                field: "state_type",
                value: other.to_owned(),
            }),
        }
    }
}

/// Why a state was cleared, recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    UserCancel,
    Timeout,
    Completed,
    Error,
}

impl ClearReason {
    /// Audit action name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserCancel => "state_cancelled",
            Self::Timeout => "state_timeout",
            Self::Completed => "state_completed",
            Self::Error => "state_errored",
        }
    }
}

/// The authoritative per-(tenant, room, user) conversation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub state_type: StateType,
    pub step: String,
    /// Flow scratch memory. Each state type owns its shape; callers
    /// validate on read.
    pub data: serde_json::Value,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    /// The neutral state returned when no row exists.
    pub fn normal(now: DateTime<Utc>) -> Self {
        Self {
            state_type: StateType::Normal,
            step: String::new(),
            data: serde_json::json!({}),
            reference_type: None,
            reference_id: None,
            expires_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a flow is active.
    pub fn is_active(&self) -> bool {
        self.state_type != StateType::Normal
    }
}

/// A stored conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters for a state transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub state_type: StateType,
    pub step: String,
    pub data: serde_json::Value,
    pub reference: Option<(String, String)>,
    pub timeout_minutes: i64,
}

impl TenantDb {
    /// Read the current state for a key.
    ///
    /// An expired row is deleted in the same transaction and `Normal` is
    /// returned, so at most one active state ever exists per key.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn current_state(
        &self,
        room_id: &str,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ConversationState, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT state_type, step, data, reference_type, reference_id, \
                    expires_at, created_at, updated_at \
             FROM conversation_state \
             WHERE tenant_id = ?1 AND room_id = ?2 AND user_id = ?3",
        )
        .bind(self.tid())
        .bind(room_id)
        .bind(user_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(ConversationState::normal(now));
        };

        let expires_at = parse_ts(row.get::<String, _>("expires_at").as_str())?;
        if expires_at < now {
            sqlx::query(
                "DELETE FROM conversation_state \
                 WHERE tenant_id = ?1 AND room_id = ?2 AND user_id = ?3",
            )
            .bind(self.tid())
            .bind(room_id)
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(ConversationState::normal(now));
        }

        let state = ConversationState {
            state_type: StateType::parse(row.get::<String, _>("state_type").as_str())?,
            step: row.get("step"),
            data: serde_json::from_str(row.get::<String, _>("data").as_str())
                .unwrap_or_else(|_| serde_json::json!({})),
            reference_type: row.get("reference_type"),
            reference_id: row.get("reference_id"),
            expires_at,
            created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
            updated_at: parse_ts(row.get::<String, _>("updated_at").as_str())?,
        };
        tx.commit().await?;
        Ok(state)
    }

    /// Upsert the state for a key. On conflict the existing row is
    /// overwritten; there is never more than one state per key.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn transition_state(
        &self,
        room_id: &str,
        user_id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let expires_at = now + Duration::minutes(transition.timeout_minutes.max(1));
        let (reference_type, reference_id) = match transition.reference {
            Some((rt, rid)) => (Some(rt), Some(rid)),
            None => (None, None),
        };
        sqlx::query(
            "INSERT INTO conversation_state \
               (tenant_id, room_id, user_id, state_type, step, data, \
                reference_type, reference_id, expires_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10) \
             ON CONFLICT (tenant_id, room_id, user_id) DO UPDATE SET \
               state_type = excluded.state_type, \
               step = excluded.step, \
               data = excluded.data, \
               reference_type = excluded.reference_type, \
               reference_id = excluded.reference_id, \
               expires_at = excluded.expires_at, \
               updated_at = excluded.updated_at",
        )
        .bind(self.tid())
        .bind(room_id)
        .bind(user_id.to_string())
        .bind(transition.state_type.as_str())
        .bind(&transition.step)
        .bind(transition.data.to_string())
        .bind(reference_type)
        .bind(reference_id)
        .bind(fmt_ts(expires_at))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete the state row for a key, returning to `Normal`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn clear_state(&self, room_id: &str, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM conversation_state \
             WHERE tenant_id = ?1 AND room_id = ?2 AND user_id = ?3",
        )
        .bind(self.tid())
        .bind(room_id)
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent turns for a key, oldest first, bounded by `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn recent_turns(
        &self,
        room_id: &str,
        user_id: Uuid,
        limit: u32,
    ) -> Result<Vec<Turn>, StoreError> {
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM conversation_turns \
             WHERE tenant_id = ?1 AND room_id = ?2 AND user_id = ?3 \
             ORDER BY id DESC LIMIT ?4",
        )
        .bind(self.tid())
        .bind(room_id)
        .bind(user_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut turns = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            turns.push(Turn {
                role: row.get("role"),
                content: row.get("content"),
                created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
            });
        }
        Ok(turns)
    }

    /// Number of turns currently buffered for a key beyond the summary.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn buffered_turn_count(
        &self,
        room_id: &str,
        user_id: Uuid,
    ) -> Result<u32, StoreError> {
        let covered: i64 = sqlx::query_scalar(
            "SELECT COALESCE((SELECT turns_covered FROM conversation_summaries \
                WHERE tenant_id = ?1 AND room_id = ?2 AND user_id = ?3), 0)",
        )
        .bind(self.tid())
        .bind(room_id)
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conversation_turns \
             WHERE tenant_id = ?1 AND room_id = ?2 AND user_id = ?3",
        )
        .bind(self.tid())
        .bind(room_id)
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from((total - covered).max(0)).unwrap_or(u32::MAX))
    }

    /// Total turns ever stored for a key.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn total_turn_count(&self, room_id: &str, user_id: Uuid) -> Result<u32, StoreError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conversation_turns \
             WHERE tenant_id = ?1 AND room_id = ?2 AND user_id = ?3",
        )
        .bind(self.tid())
        .bind(room_id)
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(total.max(0)).unwrap_or(u32::MAX))
    }

    /// The rolling summary for a key, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn rolling_summary(
        &self,
        room_id: &str,
        user_id: Uuid,
    ) -> Result<Option<String>, StoreError> {
        let summary: Option<String> = sqlx::query_scalar(
            "SELECT summary FROM conversation_summaries \
             WHERE tenant_id = ?1 AND room_id = ?2 AND user_id = ?3",
        )
        .bind(self.tid())
        .bind(room_id)
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(summary)
    }

    /// Replace the rolling summary and record how many turns it covers.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn save_summary(
        &self,
        room_id: &str,
        user_id: Uuid,
        summary: &str,
        turns_covered: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conversation_summaries \
               (tenant_id, room_id, user_id, summary, turns_covered, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (tenant_id, room_id, user_id) DO UPDATE SET \
               summary = excluded.summary, \
               turns_covered = excluded.turns_covered, \
               updated_at = excluded.updated_at",
        )
        .bind(self.tid())
        .bind(room_id)
        .bind(user_id.to_string())
        .bind(summary)
        .bind(i64::from(turns_covered))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Queue a conversation turn append through the single-writer actor.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriterClosed`] if the actor has stopped.
    pub async fn append_turn(
        &self,
        room_id: &str,
        user_id: Uuid,
        role: &'static str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.writer_tx
            .send(WriteOp::AppendTurn {
                tenant_id: self.tenant_id(),
                room_id: room_id.to_owned(),
                user_id,
                role,
                content: content.to_owned(),
                at,
            })
            .await
            .map_err(|_| StoreError::WriterClosed)
    }
}
