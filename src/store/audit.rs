//! Audit trail access.
//!
//! Writes are latency-tolerant and flow through the single-writer actor;
//! reads exist for operator tooling and tests. Entries never carry raw
//! message bodies or upstream error strings, only action names and
//! resource identifiers.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::writer::WriteOp;
use super::{parse_ts, StoreError, TenantDb};
use crate::types::Classification;

/// A stored audit entry.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub classification: Classification,
    pub created_at: DateTime<Utc>,
}

impl TenantDb {
    /// Queue an audit entry through the single-writer actor.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriterClosed`] if the actor has stopped.
    pub async fn record_audit(
        &self,
        actor: &str,
        action: &str,
        resource_type: &str,
        resource_id: Option<&str>,
        classification: Classification,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.writer_tx
            .send(WriteOp::Audit {
                tenant_id: self.tenant_id(),
                actor: actor.to_owned(),
                action: action.to_owned(),
                resource_type: resource_type.to_owned(),
                resource_id: resource_id.map(ToOwned::to_owned),
                classification,
                at,
            })
            .await
            .map_err(|_| StoreError::WriterClosed)
    }

    /// Most recent audit entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT actor, action, resource_type, resource_id, classification, created_at \
             FROM audit_log WHERE tenant_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(self.tid())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_class: String = row.get("classification");
            entries.push(AuditEntry {
                actor: row.get("actor"),
                action: row.get("action"),
                resource_type: row.get("resource_type"),
                resource_id: row.get("resource_id"),
                classification: raw_class.parse().map_err(|_| StoreError::InvalidValue {
                    field: "classification",
                    value: raw_class.clone(),
                })?,
                created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Db;
    use uuid::Uuid;

    #[tokio::test]
    async fn audit_write_and_read_back() {
        let db = Db::open_in_memory().await.expect("open");
        let tenant = db.tenant(Uuid::new_v4());
        tenant
            .record_audit(
                "user:abc",
                "state_cancelled",
                "conversation_state",
                Some("room-1"),
                Classification::Internal,
                Utc::now(),
            )
            .await
            .expect("queue");
        db.flush_writes().await.expect("flush");

        let entries = tenant.recent_audit(10).await.expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "state_cancelled");
        assert_eq!(entries[0].classification, Classification::Internal);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn audit_reads_are_tenant_scoped() {
        let db = Db::open_in_memory().await.expect("open");
        let a = db.tenant(Uuid::new_v4());
        let b = db.tenant(Uuid::new_v4());
        a.record_audit(
            "user:abc",
            "task_created",
            "task",
            None,
            Classification::Internal,
            Utc::now(),
        )
        .await
        .expect("queue");
        db.flush_writes().await.expect("flush");

        assert_eq!(a.recent_audit(10).await.expect("a").len(), 1);
        assert!(b.recent_audit(10).await.expect("b").is_empty());
        db.shutdown().await;
    }
}
