//! Identity reads: tenants and users.
//!
//! The Brain reads identity, it never writes it. Tenant resolution happens
//! before a tenant-scoped handle exists, so it lives on [`Db`] directly;
//! everything else is on [`TenantDb`].

use sqlx::Row;
use uuid::Uuid;

use super::{parse_uuid, Db, StoreError, TenantDb};
use crate::types::{RoleLevel, SenderIdentity};

/// A resolved tenant.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: Uuid,
    pub org_key: String,
    pub name: String,
    pub webhook_secret: String,
    pub timezone: String,
}

impl Db {
    /// Resolve a chat-service organization key to a tenant.
    ///
    /// Inactive and unknown organizations both resolve to `None`: the
    /// caller fails closed.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn tenant_by_org_key(&self, org_key: &str) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query(
            "SELECT id, org_key, name, webhook_secret, timezone \
             FROM tenants WHERE org_key = ?1 AND is_active = 1",
        )
        .bind(org_key)
        .fetch_optional(self.pool())
        .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(Tenant {
                id: parse_uuid(row.get::<String, _>("id").as_str())?,
                org_key: row.get("org_key"),
                name: row.get("name"),
                webhook_secret: row.get("webhook_secret"),
                timezone: row.get("timezone"),
            })),
        }
    }
}

impl TenantDb {
    /// Resolve a chat account id to a sender identity.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn user_by_account_id(
        &self,
        account_id: &str,
    ) -> Result<Option<SenderIdentity>, StoreError> {
        let row = sqlx::query(
            "SELECT id, account_id, display_name, role_level \
             FROM users WHERE tenant_id = ?1 AND account_id = ?2 AND is_active = 1",
        )
        .bind(self.tid())
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(SenderIdentity {
                user_id: parse_uuid(row.get::<String, _>("id").as_str())?,
                account_id: row.get("account_id"),
                display_name: row.get("display_name"),
                role_level: RoleLevel::clamped(row.get::<i64, _>("role_level")),
            })),
        }
    }

    /// Tenant timezone string (IANA name).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn tenant_timezone(&self) -> Result<String, StoreError> {
        let tz: Option<String> = sqlx::query_scalar("SELECT timezone FROM tenants WHERE id = ?1")
            .bind(self.tid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(tz.unwrap_or_else(|| "Asia/Tokyo".to_owned()))
    }

    /// Room directory for fuzzy target resolution: (room_id, name) pairs.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn room_directory(&self) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            "SELECT room_id, name FROM rooms WHERE tenant_id = ?1 AND is_active = 1",
        )
        .bind(self.tid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("room_id"), row.get("name")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::{seed_tenant, seed_user};

    #[tokio::test]
    async fn tenant_resolution_fails_closed() {
        let db = Db::open_in_memory().await.expect("open");
        seed_tenant(&db, "org-1").await;
        assert!(db
            .tenant_by_org_key("org-1")
            .await
            .expect("query")
            .is_some());
        assert!(db
            .tenant_by_org_key("org-unknown")
            .await
            .expect("query")
            .is_none());
        db.shutdown().await;
    }

    #[tokio::test]
    async fn user_lookup_is_tenant_scoped() {
        let db = Db::open_in_memory().await.expect("open");
        let t1 = seed_tenant(&db, "org-1").await;
        let t2 = seed_tenant(&db, "org-2").await;
        seed_user(&db, t1, "acct-9", "Sato", 4).await;

        let found = db
            .tenant(t1)
            .user_by_account_id("acct-9")
            .await
            .expect("query")
            .expect("present");
        assert_eq!(found.display_name, "Sato");
        assert_eq!(found.role_level, RoleLevel::MANAGER);

        assert!(db
            .tenant(t2)
            .user_by_account_id("acct-9")
            .await
            .expect("query")
            .is_none());
        db.shutdown().await;
    }

    #[tokio::test]
    async fn room_directory_lists_active_rooms() {
        let db = Db::open_in_memory().await.expect("open");
        let t1 = seed_tenant(&db, "org-1").await;
        for (id, name, active) in [
            ("r1", "研修チャット", 1),
            ("r2", "営業部", 1),
            ("r3", "アーカイブ", 0),
        ] {
            crate::store::testutil::seed_room(&db, t1, id, name, active).await;
        }
        let rooms = db.tenant(t1).room_directory().await.expect("rooms");
        assert_eq!(rooms.len(), 2);
        db.shutdown().await;
    }
}
