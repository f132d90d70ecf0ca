//! Admin configuration and feature flags, with a TTL cache.
//!
//! Admin config carries the tenant's operator account, admin rooms, and the
//! optional room-match threshold override. Flags are global rows with
//! per-tenant overrides; both are read at request start, so reads are cached
//! for an hour and keyed by tenant.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sqlx::Row;
use uuid::Uuid;

use super::{StoreError, TenantDb};

/// Cache TTL for admin config and flags.
const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Per-tenant admin configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdminConfig {
    pub operator_account_id: Option<String>,
    pub admin_room_id: Option<String>,
    pub admin_dm_room_id: Option<String>,
    pub room_match_threshold: Option<f64>,
}

/// Tenant-keyed TTL cache for admin config.
#[derive(Debug, Default)]
pub struct AdminConfigCache {
    entries: Mutex<HashMap<Uuid, (Instant, AdminConfig)>>,
}

impl AdminConfigCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the tenant's admin config, hitting the store at most once per
    /// TTL window.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn get(&self, db: &TenantDb) -> Result<AdminConfig, StoreError> {
        let tenant_id = db.tenant_id();
        if let Some(config) = self.fresh_entry(tenant_id) {
            return Ok(config);
        }
        let config = db.load_admin_config().await?;
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(tenant_id, (Instant::now(), config.clone()));
        }
        Ok(config)
    }

    fn fresh_entry(&self, tenant_id: Uuid) -> Option<AdminConfig> {
        let entries = self.entries.lock().ok()?;
        let (stored_at, config) = entries.get(&tenant_id)?;
        if stored_at.elapsed() < CACHE_TTL {
            Some(config.clone())
        } else {
            None
        }
    }

    /// Drop a tenant's cached entry (operator updated the config).
    pub fn invalidate(&self, tenant_id: Uuid) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&tenant_id);
        }
    }
}

impl TenantDb {
    /// Load the tenant's admin config row, defaulting when absent.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn load_admin_config(&self) -> Result<AdminConfig, StoreError> {
        let row = sqlx::query(
            "SELECT operator_account_id, admin_room_id, admin_dm_room_id, room_match_threshold \
             FROM admin_config WHERE tenant_id = ?1",
        )
        .bind(self.tid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            None => AdminConfig::default(),
            Some(row) => AdminConfig {
                operator_account_id: row.get("operator_account_id"),
                admin_room_id: row.get("admin_room_id"),
                admin_dm_room_id: row.get("admin_dm_room_id"),
                room_match_threshold: row.get("room_match_threshold"),
            },
        })
    }

    /// Read a feature flag: tenant override wins over the global row;
    /// absent rows read as disabled.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn feature_enabled(&self, name: &str) -> Result<bool, StoreError> {
        self.feature_enabled_or(name, false).await
    }

    /// Read a feature flag with an explicit default for absent rows.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn feature_enabled_or(&self, name: &str, default: bool) -> Result<bool, StoreError> {
        let rows = sqlx::query(
            "SELECT tenant_id, enabled FROM feature_flags \
             WHERE name = ?1 AND tenant_id IN ('', ?2)",
        )
        .bind(name)
        .bind(self.tid())
        .fetch_all(&self.pool)
        .await?;

        let mut global: Option<bool> = None;
        let mut tenant_override: Option<bool> = None;
        for row in rows {
            let scope: String = row.get("tenant_id");
            let enabled: bool = row.get("enabled");
            if scope.is_empty() {
                global = Some(enabled);
            } else {
                tenant_override = Some(enabled);
            }
        }
        Ok(tenant_override.or(global).unwrap_or(default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::seed_tenant;
    use crate::store::Db;

    #[tokio::test]
    async fn admin_config_defaults_when_absent() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        let config = db.tenant(t).load_admin_config().await.expect("load");
        assert_eq!(config, AdminConfig::default());
        db.shutdown().await;
    }

    #[tokio::test]
    async fn cache_serves_second_read() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        sqlx::query(
            "INSERT INTO admin_config (tenant_id, operator_account_id, room_match_threshold) \
             VALUES (?1, 'acct-op', 0.85)",
        )
        .bind(t.to_string())
        .execute(db.pool())
        .await
        .expect("seed");

        let cache = AdminConfigCache::new();
        let tenant = db.tenant(t);
        let first = cache.get(&tenant).await.expect("first");
        assert_eq!(first.operator_account_id.as_deref(), Some("acct-op"));

        // Change the row; the cache must still serve the old value.
        sqlx::query("UPDATE admin_config SET operator_account_id = 'acct-new' WHERE tenant_id = ?1")
            .bind(t.to_string())
            .execute(db.pool())
            .await
            .expect("update");
        let second = cache.get(&tenant).await.expect("second");
        assert_eq!(second.operator_account_id.as_deref(), Some("acct-op"));

        cache.invalidate(t);
        let third = cache.get(&tenant).await.expect("third");
        assert_eq!(third.operator_account_id.as_deref(), Some("acct-new"));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn flag_tenant_override_wins() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        sqlx::query("INSERT INTO feature_flags (name, tenant_id, enabled) VALUES ('pattern_detection', '', 1)")
            .execute(db.pool())
            .await
            .expect("global");
        sqlx::query("INSERT INTO feature_flags (name, tenant_id, enabled) VALUES ('pattern_detection', ?1, 0)")
            .bind(t.to_string())
            .execute(db.pool())
            .await
            .expect("override");

        let tenant = db.tenant(t);
        assert!(!tenant.feature_enabled("pattern_detection").await.expect("read"));
        assert!(!tenant.feature_enabled("unknown_flag").await.expect("absent"));
        db.shutdown().await;
    }
}
