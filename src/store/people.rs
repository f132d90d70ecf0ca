//! Persons and user preferences.

use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::{parse_uuid, StoreError, TenantDb};
use crate::store::writer::WriteOp;

/// A known person relevant to a message.
#[derive(Debug, Clone)]
pub struct Person {
    pub id: Uuid,
    pub name: String,
    pub account_id: Option<String>,
    pub notes: Option<String>,
}

impl TenantDb {
    /// Persons whose name appears in the message text, bounded by `limit`.
    ///
    /// Matching runs inside SQL with `instr` on the bound message, so the
    /// text is never interpolated into the statement.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn persons_mentioned_in(
        &self,
        message: &str,
        limit: u32,
    ) -> Result<Vec<Person>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, account_id, notes FROM persons \
             WHERE tenant_id = ?1 AND length(name) > 0 AND instr(?2, name) > 0 \
             ORDER BY length(name) DESC LIMIT ?3",
        )
        .bind(self.tid())
        .bind(message)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut persons = Vec::with_capacity(rows.len());
        for row in rows {
            persons.push(Person {
                id: parse_uuid(row.get::<String, _>("id").as_str())?,
                name: row.get("name"),
                account_id: row.get("account_id"),
                notes: row.get("notes"),
            });
        }
        Ok(persons)
    }

    /// Find a single person by exact name. Returns `None` when absent or
    /// ambiguous is impossible here (exact match on name).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn person_by_name(&self, name: &str) -> Result<Option<Person>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, account_id, notes FROM persons \
             WHERE tenant_id = ?1 AND name = ?2 LIMIT 1",
        )
        .bind(self.tid())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(Person {
                id: parse_uuid(row.get::<String, _>("id").as_str())?,
                name: row.get("name"),
                account_id: row.get("account_id"),
                notes: row.get("notes"),
            })),
        }
    }

    /// The sender's preference bag, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn preferences_for(&self, user_id: Uuid) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT preferences FROM user_preferences WHERE tenant_id = ?1 AND user_id = ?2",
        )
        .bind(self.tid())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// Queue a preference update through the single-writer actor.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriterClosed`] if the actor has stopped.
    pub async fn save_preferences(
        &self,
        user_id: Uuid,
        preferences: Value,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError> {
        self.writer_tx
            .send(WriteOp::SavePreferences {
                tenant_id: self.tenant_id(),
                user_id,
                preferences,
                at,
            })
            .await
            .map_err(|_| StoreError::WriterClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::{seed_person, seed_tenant};
    use crate::store::Db;
    use chrono::Utc;

    #[tokio::test]
    async fn persons_matched_inside_message() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        seed_person(&db, t, "太郎", Some("acct-taro")).await;
        seed_person(&db, t, "花子", None).await;

        let tenant = db.tenant(t);
        let found = tenant
            .persons_mentioned_in("太郎さんに金曜までにタスクをお願い", 5)
            .await
            .expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "太郎");
        db.shutdown().await;
    }

    #[tokio::test]
    async fn like_metacharacters_are_inert() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        seed_person(&db, t, "Sato", None).await;

        // A message full of LIKE metacharacters must not match everything.
        let found = db
            .tenant(t)
            .persons_mentioned_in("%_%' OR 1=1 --", 5)
            .await
            .expect("query");
        assert!(found.is_empty());
        db.shutdown().await;
    }

    #[tokio::test]
    async fn preferences_roundtrip() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        let tenant = db.tenant(t);
        let user = Uuid::new_v4();

        assert!(tenant.preferences_for(user).await.expect("empty").is_none());
        tenant
            .save_preferences(user, serde_json::json!({"tone": "brief"}), Utc::now())
            .await
            .expect("queue");
        db.flush_writes().await.expect("flush");

        let prefs = tenant
            .preferences_for(user)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(prefs["tone"], "brief");
        db.shutdown().await;
    }
}
