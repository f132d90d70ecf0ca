//! Leadership teachings: canonical value statements consulted at highest
//! precedence by Understanding and Decision.

use sqlx::Row;
use uuid::Uuid;

use super::{parse_uuid, StoreError, TenantDb};
use crate::store::writer::WriteOp;

/// Closed category set for teachings.
pub const TEACHING_CATEGORIES: &[&str] = &[
    "mission",
    "vision",
    "values",
    "choice-theory",
    "sdt",
    "servant",
    "psych-safety",
    "sales",
    "hr",
    "accounting",
    "general",
    "culture",
    "communication",
    "staff-guidance",
    "other",
];

/// A teaching row as read by the Brain.
#[derive(Debug, Clone)]
pub struct Teaching {
    pub id: Uuid,
    pub statement: String,
    pub reasoning: Option<String>,
    pub context: Option<String>,
    pub category: String,
    pub priority: i64,
}

impl TenantDb {
    /// Active, verified teachings ranked by priority, optionally filtered
    /// to those whose statement or category shares a term with the message.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn relevant_teachings(
        &self,
        message: &str,
        limit: u32,
    ) -> Result<Vec<Teaching>, StoreError> {
        // Pull the top active rows, then keyword-filter in process; the
        // table is small (tens of rows per tenant).
        let rows = sqlx::query(
            "SELECT id, statement, reasoning, context, category, priority \
             FROM ceo_teachings \
             WHERE tenant_id = ?1 AND is_active = 1 AND validation_status = 'verified' \
             ORDER BY priority DESC, created_at DESC LIMIT 50",
        )
        .bind(self.tid())
        .fetch_all(&self.pool)
        .await?;

        let mut all = Vec::with_capacity(rows.len());
        for row in rows {
            all.push(Teaching {
                id: parse_uuid(row.get::<String, _>("id").as_str())?,
                statement: row.get("statement"),
                reasoning: row.get("reasoning"),
                context: row.get("context"),
                category: row.get("category"),
                priority: row.get("priority"),
            });
        }

        let lowered = message.to_lowercase();
        let (matching, rest): (Vec<Teaching>, Vec<Teaching>) = all
            .into_iter()
            .partition(|t| teaching_matches(t, &lowered));

        let mut picked = matching;
        // Top-priority teachings apply even without a keyword hit.
        picked.extend(rest.into_iter().filter(|t| t.priority >= 9));
        picked.sort_by(|a, b| b.priority.cmp(&a.priority));
        picked.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(picked)
    }

    /// Active, verified teachings in the given categories (value alignment).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn teachings_in_categories(
        &self,
        categories: &[&str],
        limit: u32,
    ) -> Result<Vec<Teaching>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, statement, reasoning, context, category, priority \
             FROM ceo_teachings \
             WHERE tenant_id = ?1 AND is_active = 1 AND validation_status = 'verified' \
             ORDER BY priority DESC LIMIT ?2",
        )
        .bind(self.tid())
        .bind(i64::from(limit.saturating_mul(4)))
        .fetch_all(&self.pool)
        .await?;

        let mut picked = Vec::new();
        for row in rows {
            let category: String = row.get("category");
            if !categories.contains(&category.as_str()) {
                continue;
            }
            picked.push(Teaching {
                id: parse_uuid(row.get::<String, _>("id").as_str())?,
                statement: row.get("statement"),
                reasoning: row.get("reasoning"),
                context: row.get("context"),
                category,
                priority: row.get("priority"),
            });
            if picked.len() >= usize::try_from(limit).unwrap_or(usize::MAX) {
                break;
            }
        }
        Ok(picked)
    }

    /// Record a new teaching. It enters `pending` validation and is not
    /// consulted until verified.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn insert_teaching(
        &self,
        ceo_user_id: Uuid,
        statement: &str,
        category: &str,
        priority: i64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let category = if TEACHING_CATEGORIES.contains(&category) {
            category
        } else {
            "other"
        };
        sqlx::query(
            "INSERT INTO ceo_teachings \
               (tenant_id, id, ceo_user_id, statement, category, priority, is_active, \
                validation_status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 'pending', ?7)",
        )
        .bind(self.tid())
        .bind(id.to_string())
        .bind(ceo_user_id.to_string())
        .bind(statement)
        .bind(category)
        .bind(priority.clamp(1, 10))
        .bind(crate::store::fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Queue a usage-count bump through the single-writer actor.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriterClosed`] if the actor has stopped.
    pub async fn bump_teaching_usage(&self, teaching_id: Uuid) -> Result<(), StoreError> {
        self.writer_tx
            .send(WriteOp::BumpTeachingUsage {
                tenant_id: self.tenant_id(),
                teaching_id,
            })
            .await
            .map_err(|_| StoreError::WriterClosed)
    }
}

fn teaching_matches(teaching: &Teaching, lowered_message: &str) -> bool {
    let statement = teaching.statement.to_lowercase();
    statement
        .split_whitespace()
        .filter(|word| word.chars().count() >= 3)
        .any(|word| lowered_message.contains(word))
        || lowered_message.contains(&teaching.category)
}
