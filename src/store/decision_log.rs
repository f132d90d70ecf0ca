//! Decision log: one append-only row per Brain invocation.
//!
//! The excerpt is truncated before storage and parameters are scrubbed by
//! the caller; raw message bodies and upstream error strings never land
//! here. Rows older than the retention window are purged by the job runner.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{fmt_ts, StoreError, TenantDb};

/// Days a decision row is retained.
const RETENTION_DAYS: i64 = 90;

/// Maximum characters of the message kept in the excerpt.
const EXCERPT_MAX_CHARS: usize = 120;

/// What the guardrails did with the selected plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailAction {
    /// Plan passed untouched.
    None,
    /// Plan was downgraded to a confirmation.
    Confirmed,
    /// Plan was blocked outright.
    Blocked,
}

impl GuardrailAction {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Confirmed => "confirmed",
            Self::Blocked => "blocked",
        }
    }
}

/// A decision log record ready for insertion.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub user_id: Uuid,
    pub room_id: String,
    pub message_excerpt: String,
    pub intent: String,
    pub capability: Option<String>,
    pub parameters: serde_json::Value,
    pub confidence: f64,
    pub intent_confidence: f64,
    pub parameter_confidence: f64,
    pub guardrail_action: GuardrailAction,
    pub policy_reason: Option<String>,
    pub success: bool,
    pub error_code: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model_id: Option<String>,
    /// Per-layer timing breakdown in milliseconds.
    pub timing_ms: serde_json::Value,
    pub confirmation_needed: bool,
    pub confirmation_question: Option<String>,
    pub confirmation_resolution: Option<String>,
    /// Non-fatal warnings, e.g. `partial_memory`.
    pub warnings: Vec<String>,
}

impl DecisionRecord {
    /// Truncate a message body into a storable excerpt.
    pub fn excerpt(text: &str) -> String {
        text.chars().take(EXCERPT_MAX_CHARS).collect()
    }
}

impl TenantDb {
    /// Append a decision record.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn record_decision(
        &self,
        record: &DecisionRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO decision_log \
               (tenant_id, user_id, room_id, message_excerpt, intent, capability, parameters, \
                confidence, intent_confidence, parameter_confidence, guardrail_action, \
                policy_reason, success, error_code, tokens_in, tokens_out, model_id, timing_ms, \
                confirmation_needed, confirmation_question, confirmation_resolution, warnings, \
                created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
        )
        .bind(self.tid())
        .bind(record.user_id.to_string())
        .bind(&record.room_id)
        .bind(&record.message_excerpt)
        .bind(&record.intent)
        .bind(record.capability.as_deref())
        .bind(record.parameters.to_string())
        .bind(record.confidence)
        .bind(record.intent_confidence)
        .bind(record.parameter_confidence)
        .bind(record.guardrail_action.as_str())
        .bind(record.policy_reason.as_deref())
        .bind(record.success)
        .bind(record.error_code.as_deref())
        .bind(i64::try_from(record.tokens_in).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.tokens_out).unwrap_or(i64::MAX))
        .bind(record.model_id.as_deref())
        .bind(record.timing_ms.to_string())
        .bind(record.confirmation_needed)
        .bind(record.confirmation_question.as_deref())
        .bind(record.confirmation_resolution.as_deref())
        .bind(record.warnings.join(","))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Capabilities this user ran successfully within the lookback window,
    /// most recent first. Feeds the recency-affinity score.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn recent_capabilities(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT capability FROM decision_log \
             WHERE tenant_id = ?1 AND user_id = ?2 AND success = 1 \
               AND capability IS NOT NULL AND created_at >= ?3 \
             ORDER BY created_at DESC LIMIT ?4",
        )
        .bind(self.tid())
        .bind(user_id.to_string())
        .bind(fmt_ts(since))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get::<Option<String>, _>("capability"))
            .collect())
    }

    /// The last successful capability for this user in this room.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn last_successful_capability(
        &self,
        user_id: Uuid,
        room_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT capability FROM decision_log \
             WHERE tenant_id = ?1 AND user_id = ?2 AND room_id = ?3 \
               AND success = 1 AND capability IS NOT NULL \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(self.tid())
        .bind(user_id.to_string())
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("capability")))
    }

    /// Delete decision rows past the retention window. Returns rows purged.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn purge_expired_decisions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = now - Duration::days(RETENTION_DAYS);
        let result = sqlx::query("DELETE FROM decision_log WHERE tenant_id = ?1 AND created_at < ?2")
            .bind(self.tid())
            .bind(fmt_ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Count decision rows for this tenant (test and report support).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn decision_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM decision_log WHERE tenant_id = ?1")
            .bind(self.tid())
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
