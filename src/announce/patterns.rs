//! Announcement request pattern detection.
//!
//! Requests are normalized (dates, numbers, and whitespace stripped),
//! hashed, and counted per tenant. At three occurrences the Brain raises
//! an insight proposing a recurring announcement; accepting it marks the
//! pattern addressed.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::Row;

use crate::store::{fmt_ts, StoreError, TenantDb};

/// Occurrences at which recurrence is proposed.
pub const PROPOSAL_THRESHOLD: i64 = 3;

/// Pattern status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternStatus {
    Active,
    Addressed,
    Dismissed,
}

impl PatternStatus {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Addressed => "addressed",
            Self::Dismissed => "dismissed",
        }
    }
}

/// Strip volatile tokens so "明日9時に持ち物連絡" and "明後日10時に持ち物連絡"
/// hash identically.
pub fn normalize_request(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    for c in text.to_lowercase().chars() {
        if c.is_whitespace() || c.is_ascii_digit() || matches!(c, '０'..='９') {
            continue;
        }
        if matches!(c, '月' | '日' | '時' | '分' | ':' | '/' | '-') {
            continue;
        }
        normalized.push(c);
    }
    normalized
}

/// Hex SHA-256 of the normalized request.
pub fn request_hash(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut acc, byte| {
        use std::fmt::Write as _;
        let _ = write!(acc, "{byte:02x}");
        acc
    })
}

/// Result of recording one occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternObservation {
    pub occurrence_count: i64,
    /// Set when this observation crossed the proposal threshold.
    pub propose_recurrence: bool,
}

impl TenantDb {
    /// Record one occurrence of a request pattern. Raises the recurrence
    /// insight exactly once, when the count reaches the threshold.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn record_announcement_pattern(
        &self,
        request_text: &str,
        requester_account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PatternObservation, StoreError> {
        let normalized = normalize_request(request_text);
        let hash = request_hash(&normalized);

        sqlx::query(
            "INSERT INTO announcement_patterns \
               (tenant_id, request_hash, normalized_text, occurrence_count, first_seen_at, \
                last_seen_at, requester_account_ids, status) \
             VALUES (?1, ?2, ?3, 1, ?4, ?4, ?5, 'active') \
             ON CONFLICT (tenant_id, request_hash) DO UPDATE SET \
               occurrence_count = occurrence_count + 1, \
               last_seen_at = excluded.last_seen_at",
        )
        .bind(self.tid())
        .bind(&hash)
        .bind(&normalized)
        .bind(fmt_ts(now))
        .bind(serde_json::json!([requester_account_id]).to_string())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT occurrence_count, status, requester_account_ids \
             FROM announcement_patterns WHERE tenant_id = ?1 AND request_hash = ?2",
        )
        .bind(self.tid())
        .bind(&hash)
        .fetch_one(&self.pool)
        .await?;
        let occurrence_count: i64 = row.get("occurrence_count");
        let status: String = row.get("status");

        // Track distinct requesters.
        let mut requesters: Vec<String> =
            serde_json::from_str(row.get::<String, _>("requester_account_ids").as_str())
                .unwrap_or_default();
        if !requesters.iter().any(|a| a == requester_account_id) {
            requesters.push(requester_account_id.to_owned());
            sqlx::query(
                "UPDATE announcement_patterns SET requester_account_ids = ?3 \
                 WHERE tenant_id = ?1 AND request_hash = ?2",
            )
            .bind(self.tid())
            .bind(&hash)
            .bind(serde_json::json!(requesters).to_string())
            .execute(&self.pool)
            .await?;
        }

        let propose = occurrence_count == PROPOSAL_THRESHOLD && status == "active";
        if propose {
            let excerpt: String = request_text.chars().take(60).collect();
            self.raise_insight(
                "定期アナウンスの提案",
                &format!(
                    "似たアナウンス依頼が{occurrence_count}回続いています: 「{excerpt}」。定期配信にしませんか？"
                ),
                8,
                "pattern",
                now,
            )
            .await?;
        }

        Ok(PatternObservation {
            occurrence_count,
            propose_recurrence: propose,
        })
    }

    /// Mark a pattern addressed (the proposal became a recurring
    /// announcement) or dismissed.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn set_pattern_status(
        &self,
        request_text: &str,
        status: PatternStatus,
    ) -> Result<(), StoreError> {
        let hash = request_hash(&normalize_request(request_text));
        sqlx::query(
            "UPDATE announcement_patterns SET status = ?3 \
             WHERE tenant_id = ?1 AND request_hash = ?2",
        )
        .bind(self.tid())
        .bind(&hash)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
