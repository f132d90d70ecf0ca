//! SQLite persistence with tenant-scoped access.
//!
//! [`Db`] owns the process-wide connection pool and the single-writer actor
//! for latency-tolerant appends (audit, conversation turns). All
//! request-scoped queries go through [`TenantDb`], obtained via
//! [`Db::tenant`], which injects the tenant predicate into every statement.
//! Nothing else in the crate is allowed to touch the pool directly.
//!
//! Schema is an embedded `CREATE TABLE IF NOT EXISTS` script applied at
//! startup; timestamps are stored as fixed-width RFC 3339 UTC strings so
//! lexicographic comparison in SQL matches chronological order.

pub mod admin;
pub mod audit;
pub mod conversation;
pub mod decision_log;
pub mod identity;
pub mod people;
pub mod teachings;
#[cfg(test)]
pub mod testutil;
pub mod workitems;
pub mod writer;

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use self::writer::WriteOp;

/// Capacity of the single-writer channel.
const WRITER_CHANNEL_CAPACITY: usize = 256;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A persisted value failed to parse (corrupt row).
    #[error("invalid stored value in {field}: {value}")]
    InvalidValue {
        field: &'static str,
        value: String,
    },
    /// The single-writer actor has stopped.
    #[error("write channel closed")]
    WriterClosed,
    /// Row not found.
    #[error("{entity} not found")]
    NotFound { entity: &'static str },
}

/// Format a timestamp for storage. Fixed-width microseconds so string
/// comparison in SQL is chronological.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
///
/// # Errors
///
/// Returns [`StoreError::InvalidValue`] when the text is not RFC 3339.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidValue {
            field: "timestamp",
            value: raw.to_owned(),
        })
}

/// Parse a stored uuid.
///
/// # Errors
///
/// Returns [`StoreError::InvalidValue`] when the text is not a uuid.
pub fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::from_str(raw).map_err(|_| StoreError::InvalidValue {
        field: "uuid",
        value: raw.to_owned(),
    })
}

/// Process-wide database handle.
pub struct Db {
    pool: SqlitePool,
    writer_tx: mpsc::Sender<WriteOp>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Open (creating if needed) a file-backed database and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema fails.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Open an in-memory database (tests). A single connection keeps every
    /// statement on the same in-memory instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let writer_pool = pool.clone();
        let writer_handle = tokio::spawn(writer::run_writer(writer_pool, writer_rx));

        info!("database initialised");
        Ok(Self {
            pool,
            writer_tx,
            writer_handle,
        })
    }

    /// Obtain a tenant-scoped handle. Every Brain query goes through this.
    pub fn tenant(&self, tenant_id: Uuid) -> TenantDb {
        TenantDb {
            pool: self.pool.clone(),
            tenant_id,
            writer_tx: self.writer_tx.clone(),
        }
    }

    /// The raw pool, for tenant resolution and the job runner only.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Wait until every write queued so far has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriterClosed`] if the actor has stopped.
    pub async fn flush_writes(&self) -> Result<(), StoreError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.writer_tx
            .send(WriteOp::Flush(tx))
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        rx.await.map_err(|_| StoreError::WriterClosed)
    }

    /// Gracefully stop the writer actor, draining pending writes.
    pub async fn shutdown(self) {
        drop(self.writer_tx);
        let _ = self.writer_handle.await;
        self.pool.close().await;
    }
}

/// Tenant-scoped database handle.
///
/// Holds the tenant id alongside the pool; every method in the sub-store
/// modules includes `tenant_id = ?` in its predicate. Constructed only via
/// [`Db::tenant`].
#[derive(Clone)]
pub struct TenantDb {
    pub(crate) pool: SqlitePool,
    tenant_id: Uuid,
    pub(crate) writer_tx: mpsc::Sender<WriteOp>,
}

impl std::fmt::Debug for TenantDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantDb")
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

impl TenantDb {
    /// The tenant this handle is scoped to.
    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    /// The tenant id in its stored string form.
    pub(crate) fn tid(&self) -> String {
        self.tenant_id.to_string()
    }

    /// Record a processed message id. Returns `false` when the id was seen
    /// before (duplicate webhook delivery).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn mark_message_processed(
        &self,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO processed_messages (tenant_id, message_id, processed_at) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(self.tid())
        .bind(message_id)
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ── SQL Schema ──────────────────────────────────────────────────

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id              TEXT PRIMARY KEY,
    org_key         TEXT NOT NULL UNIQUE,
    name            TEXT NOT NULL,
    webhook_secret  TEXT NOT NULL,
    timezone        TEXT NOT NULL DEFAULT 'Asia/Tokyo',
    is_active       INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS users (
    tenant_id       TEXT NOT NULL,
    id              TEXT NOT NULL,
    account_id      TEXT NOT NULL,
    display_name    TEXT NOT NULL,
    role_level      INTEGER NOT NULL DEFAULT 2,
    department      TEXT,
    is_active       INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (tenant_id, id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_users_account ON users(tenant_id, account_id);

CREATE TABLE IF NOT EXISTS rooms (
    tenant_id       TEXT NOT NULL,
    room_id         TEXT NOT NULL,
    name            TEXT NOT NULL,
    is_active       INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (tenant_id, room_id)
);

CREATE TABLE IF NOT EXISTS conversation_state (
    tenant_id       TEXT NOT NULL,
    room_id         TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    state_type      TEXT NOT NULL,
    step            TEXT NOT NULL DEFAULT '',
    data            TEXT NOT NULL DEFAULT '{}',
    reference_type  TEXT,
    reference_id    TEXT,
    expires_at      TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (tenant_id, room_id, user_id)
);

CREATE TABLE IF NOT EXISTS conversation_turns (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id       TEXT NOT NULL,
    room_id         TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_turns_key ON conversation_turns(tenant_id, room_id, user_id, id);

CREATE TABLE IF NOT EXISTS conversation_summaries (
    tenant_id       TEXT NOT NULL,
    room_id         TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    summary         TEXT NOT NULL,
    turns_covered   INTEGER NOT NULL DEFAULT 0,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (tenant_id, room_id, user_id)
);

CREATE TABLE IF NOT EXISTS user_preferences (
    tenant_id       TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    preferences     TEXT NOT NULL DEFAULT '{}',
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (tenant_id, user_id)
);

CREATE TABLE IF NOT EXISTS persons (
    tenant_id       TEXT NOT NULL,
    id              TEXT NOT NULL,
    name            TEXT NOT NULL,
    account_id      TEXT,
    notes           TEXT,
    PRIMARY KEY (tenant_id, id)
);
CREATE INDEX IF NOT EXISTS idx_persons_name ON persons(tenant_id, name);

CREATE TABLE IF NOT EXISTS tasks (
    tenant_id       TEXT NOT NULL,
    id              TEXT NOT NULL,
    room_id         TEXT NOT NULL,
    assignee_user_id TEXT NOT NULL,
    body            TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'open',
    due_at          TEXT,
    chat_task_id    TEXT,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (tenant_id, id)
);
CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(tenant_id, assignee_user_id, status);

CREATE TABLE IF NOT EXISTS goals (
    tenant_id       TEXT NOT NULL,
    id              TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    title           TEXT NOT NULL,
    why             TEXT,
    metric          TEXT,
    deadline        TEXT,
    status          TEXT NOT NULL DEFAULT 'active',
    created_at      TEXT NOT NULL,
    PRIMARY KEY (tenant_id, id)
);

CREATE TABLE IF NOT EXISTS insights (
    tenant_id       TEXT NOT NULL,
    id              TEXT NOT NULL,
    title           TEXT NOT NULL,
    body            TEXT NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 5,
    category        TEXT NOT NULL DEFAULT 'general',
    status          TEXT NOT NULL DEFAULT 'open',
    created_at      TEXT NOT NULL,
    PRIMARY KEY (tenant_id, id)
);

CREATE TABLE IF NOT EXISTS ceo_teachings (
    tenant_id       TEXT NOT NULL,
    id              TEXT NOT NULL,
    ceo_user_id     TEXT NOT NULL,
    statement       TEXT NOT NULL,
    reasoning       TEXT,
    context         TEXT,
    category        TEXT NOT NULL DEFAULT 'general',
    priority        INTEGER NOT NULL DEFAULT 5,
    is_active       INTEGER NOT NULL DEFAULT 1,
    usage_count     INTEGER NOT NULL DEFAULT 0,
    validation_status TEXT NOT NULL DEFAULT 'pending',
    supersedes      TEXT,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (tenant_id, id)
);
CREATE INDEX IF NOT EXISTS idx_teachings_active
    ON ceo_teachings(tenant_id, is_active, validation_status, priority);

CREATE TABLE IF NOT EXISTS knowledge_chunks (
    tenant_id       TEXT NOT NULL,
    id              TEXT NOT NULL,
    content         TEXT NOT NULL,
    source          TEXT,
    classification  TEXT NOT NULL DEFAULT 'internal',
    PRIMARY KEY (tenant_id, id)
);

CREATE TABLE IF NOT EXISTS decision_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id       TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    room_id         TEXT NOT NULL,
    message_excerpt TEXT NOT NULL,
    intent          TEXT NOT NULL,
    capability      TEXT,
    parameters      TEXT NOT NULL DEFAULT '{}',
    confidence      REAL NOT NULL DEFAULT 0,
    intent_confidence REAL NOT NULL DEFAULT 0,
    parameter_confidence REAL NOT NULL DEFAULT 0,
    guardrail_action TEXT NOT NULL DEFAULT 'none',
    policy_reason   TEXT,
    success         INTEGER NOT NULL,
    error_code      TEXT,
    tokens_in       INTEGER NOT NULL DEFAULT 0,
    tokens_out      INTEGER NOT NULL DEFAULT 0,
    model_id        TEXT,
    timing_ms       TEXT NOT NULL DEFAULT '{}',
    confirmation_needed INTEGER NOT NULL DEFAULT 0,
    confirmation_question TEXT,
    confirmation_resolution TEXT,
    warnings        TEXT NOT NULL DEFAULT '',
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_decision_log_tenant_created
    ON decision_log(tenant_id, created_at DESC);

CREATE TABLE IF NOT EXISTS audit_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id       TEXT NOT NULL,
    actor           TEXT NOT NULL,
    action          TEXT NOT NULL,
    resource_type   TEXT NOT NULL,
    resource_id     TEXT,
    classification  TEXT NOT NULL DEFAULT 'internal',
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_tenant_created ON audit_log(tenant_id, created_at DESC);

CREATE TABLE IF NOT EXISTS processed_messages (
    tenant_id       TEXT NOT NULL,
    message_id      TEXT NOT NULL,
    processed_at    TEXT NOT NULL,
    PRIMARY KEY (tenant_id, message_id)
);

CREATE TABLE IF NOT EXISTS announcements (
    tenant_id       TEXT NOT NULL,
    id              TEXT NOT NULL,
    title           TEXT NOT NULL DEFAULT '',
    message_body    TEXT NOT NULL,
    target_room_id  TEXT,
    create_tasks    INTEGER NOT NULL DEFAULT 0,
    task_include    TEXT NOT NULL DEFAULT '[]',
    task_exclude    TEXT NOT NULL DEFAULT '[]',
    schedule_type   TEXT NOT NULL DEFAULT 'immediate',
    scheduled_at    TEXT,
    cron_expression TEXT,
    timezone        TEXT NOT NULL DEFAULT 'Asia/Tokyo',
    skip_holiday    INTEGER NOT NULL DEFAULT 0,
    skip_weekend    INTEGER NOT NULL DEFAULT 0,
    task_deadline   TEXT,
    status          TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending','pending_room','confirmed','scheduled','executing',
                          'completed','failed','cancelled','paused')),
    requester_account_id TEXT NOT NULL,
    source_room_id  TEXT NOT NULL,
    confirmation_message_id TEXT,
    next_execution_at TEXT,
    last_execution_at TEXT,
    execution_count INTEGER NOT NULL DEFAULT 0,
    max_executions  INTEGER,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (tenant_id, id)
);
CREATE INDEX IF NOT EXISTS idx_announcements_status ON announcements(tenant_id, status);

CREATE TABLE IF NOT EXISTS announcement_logs (
    tenant_id       TEXT NOT NULL,
    announcement_id TEXT NOT NULL,
    execution_number INTEGER NOT NULL,
    sent            INTEGER NOT NULL DEFAULT 0,
    sent_message_id TEXT,
    tasks_created   INTEGER NOT NULL DEFAULT 0,
    members_snapshot TEXT NOT NULL DEFAULT '[]',
    status          TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending','in_progress','completed','partial_failure','failed','skipped')),
    skip_reason     TEXT,
    executed_at     TEXT NOT NULL,
    PRIMARY KEY (tenant_id, announcement_id, execution_number)
);

CREATE TABLE IF NOT EXISTS announcement_patterns (
    tenant_id       TEXT NOT NULL,
    request_hash    TEXT NOT NULL,
    normalized_text TEXT NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    first_seen_at   TEXT NOT NULL,
    last_seen_at    TEXT NOT NULL,
    requester_account_ids TEXT NOT NULL DEFAULT '[]',
    status          TEXT NOT NULL DEFAULT 'active'
        CHECK (status IN ('active','addressed','dismissed')),
    PRIMARY KEY (tenant_id, request_hash)
);

CREATE TABLE IF NOT EXISTS scheduled_jobs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id       TEXT NOT NULL,
    kind            TEXT NOT NULL,
    payload         TEXT NOT NULL DEFAULT '{}',
    cron_expression TEXT,
    timezone        TEXT NOT NULL DEFAULT 'Asia/Tokyo',
    status          TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending','done','cancelled')),
    next_run_at     TEXT,
    last_run_at     TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_due ON scheduled_jobs(status, next_run_at);

CREATE TABLE IF NOT EXISTS admin_config (
    tenant_id       TEXT PRIMARY KEY,
    operator_account_id TEXT,
    admin_room_id   TEXT,
    admin_dm_room_id TEXT,
    room_match_threshold REAL
);

CREATE TABLE IF NOT EXISTS feature_flags (
    name            TEXT NOT NULL,
    tenant_id       TEXT NOT NULL DEFAULT '',
    enabled         INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (name, tenant_id)
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_applies_cleanly() {
        let db = Db::open_in_memory().await.expect("open");
        // Applying again must be a no-op.
        sqlx::raw_sql(SCHEMA).execute(db.pool()).await.expect("idempotent schema");
        db.shutdown().await;
    }

    #[tokio::test]
    async fn file_backed_open_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("kokoro.db");
        let path = path.to_str().expect("utf8 path");

        let db = Db::open(path).await.expect("open");
        let tenant_id = Uuid::new_v4();
        assert!(db
            .tenant(tenant_id)
            .mark_message_processed("m-1", Utc::now())
            .await
            .expect("mark"));
        db.shutdown().await;

        // Dedupe state persists across a restart.
        let db = Db::open(path).await.expect("reopen");
        assert!(!db
            .tenant(tenant_id)
            .mark_message_processed("m-1", Utc::now())
            .await
            .expect("mark"));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn timestamp_roundtrip_preserves_order() {
        let a = Utc::now();
        let b = a + chrono::Duration::microseconds(1);
        let (sa, sb) = (fmt_ts(a), fmt_ts(b));
        assert!(sa < sb, "lexicographic order must match chronological");
        assert_eq!(parse_ts(&sa).expect("parse"), parse_ts(&sa).expect("parse"));
    }

    #[tokio::test]
    async fn duplicate_message_detected() {
        let db = Db::open_in_memory().await.expect("open");
        let tenant = db.tenant(Uuid::new_v4());
        let now = Utc::now();
        assert!(tenant
            .mark_message_processed("msg-1", now)
            .await
            .expect("first"));
        assert!(!tenant
            .mark_message_processed("msg-1", now)
            .await
            .expect("second"));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_detection_is_tenant_scoped() {
        let db = Db::open_in_memory().await.expect("open");
        let a = db.tenant(Uuid::new_v4());
        let b = db.tenant(Uuid::new_v4());
        let now = Utc::now();
        assert!(a.mark_message_processed("msg-1", now).await.expect("a"));
        assert!(b.mark_message_processed("msg-1", now).await.expect("b"));
        db.shutdown().await;
    }
}
