//! Brain-owned scheduled jobs: store and tick runner.
//!
//! Jobs are one-shot (`next_run_at` set, no cron) or recurring (cron
//! expression evaluated in the job's timezone). Delivery is at-least-once:
//! the runner marks a one-shot job done only after dispatch returns, and
//! handlers dedupe via their own idempotence keys. Cron expressions use
//! the six-field form with leading seconds.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::announce::executor::{self, ExecutorDeps};
use crate::store::{fmt_ts, parse_uuid, Db, StoreError, TenantDb};

/// Job kind dispatched to the announcement executor.
pub const KIND_ANNOUNCEMENT: &str = "announcement";
/// Job kind for decision-log retention cleanup.
pub const KIND_RETENTION: &str = "retention";

/// A due job row.
#[derive(Debug, Clone)]
pub struct DueJob {
    pub id: i64,
    pub tenant_id: Uuid,
    pub kind: String,
    pub payload: Value,
    pub cron_expression: Option<String>,
    pub timezone: String,
}

/// Next occurrence of a cron expression after `after`, evaluated in the
/// given IANA timezone and returned in UTC.
pub fn next_cron_occurrence(
    cron_expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let schedule = cron::Schedule::from_str(cron_expression).ok()?;
    let tz: chrono_tz::Tz = timezone.parse().ok()?;
    let local = after.with_timezone(&tz);
    schedule
        .after(&local)
        .next()
        .map(|next| next.with_timezone(&Utc))
}

impl TenantDb {
    /// Enqueue a one-shot job. Returns the job id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn enqueue_once(
        &self,
        kind: &str,
        payload: &Value,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO scheduled_jobs (tenant_id, kind, payload, status, next_run_at, created_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
        )
        .bind(self.tid())
        .bind(kind)
        .bind(payload.to_string())
        .bind(fmt_ts(run_at))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Enqueue a recurring job on a cron expression. Returns the job id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidValue`] for an unparseable expression
    /// or timezone, or a database error.
    pub async fn enqueue_recurring(
        &self,
        kind: &str,
        payload: &Value,
        cron_expression: &str,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let next = next_cron_occurrence(cron_expression, timezone, now).ok_or(
            StoreError::InvalidValue {
                field: "cron_expression",
                value: cron_expression.to_owned(),
            },
        )?;
        let result = sqlx::query(
            "INSERT INTO scheduled_jobs \
               (tenant_id, kind, payload, cron_expression, timezone, status, next_run_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
        )
        .bind(self.tid())
        .bind(kind)
        .bind(payload.to_string())
        .bind(cron_expression)
        .bind(timezone)
        .bind(fmt_ts(next))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Cancel a pending job.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn cancel_job(&self, job_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE scheduled_jobs SET status = 'cancelled' \
             WHERE tenant_id = ?1 AND id = ?2 AND status = 'pending'",
        )
        .bind(self.tid())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancel pending jobs whose payload references the announcement.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn cancel_jobs_for_announcement(
        &self,
        announcement_id: Uuid,
    ) -> Result<u64, StoreError> {
        let needle = format!("%\"announcement_id\":\"{announcement_id}\"%");
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET status = 'cancelled' \
             WHERE tenant_id = ?1 AND status = 'pending' AND kind = ?2 AND payload LIKE ?3",
        )
        .bind(self.tid())
        .bind(KIND_ANNOUNCEMENT)
        .bind(needle)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Fetch jobs due at `now` across all tenants.
async fn due_jobs(db: &Db, now: DateTime<Utc>, limit: u32) -> Result<Vec<DueJob>, StoreError> {
    let rows = sqlx::query(
        "SELECT id, tenant_id, kind, payload, cron_expression, timezone FROM scheduled_jobs \
         WHERE status = 'pending' AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
         ORDER BY next_run_at LIMIT ?2",
    )
    .bind(fmt_ts(now))
    .bind(i64::from(limit))
    .fetch_all(db.pool())
    .await?;

    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        jobs.push(DueJob {
            id: row.get("id"),
            tenant_id: parse_uuid(row.get::<String, _>("tenant_id").as_str())?,
            kind: row.get("kind"),
            payload: serde_json::from_str(row.get::<String, _>("payload").as_str())
                .unwrap_or(Value::Null),
            cron_expression: row.get("cron_expression"),
            timezone: row.get("timezone"),
        });
    }
    Ok(jobs)
}

/// Mark a job after dispatch: recurring jobs advance to the next
/// occurrence, one-shot jobs complete.
async fn settle_job(db: &Db, job: &DueJob, now: DateTime<Utc>) -> Result<(), StoreError> {
    match &job.cron_expression {
        Some(expression) => {
            let next = next_cron_occurrence(expression, &job.timezone, now);
            match next {
                Some(next) => {
                    sqlx::query(
                        "UPDATE scheduled_jobs SET last_run_at = ?2, next_run_at = ?3 WHERE id = ?1",
                    )
                    .bind(job.id)
                    .bind(fmt_ts(now))
                    .bind(fmt_ts(next))
                    .execute(db.pool())
                    .await?;
                }
                None => {
                    warn!(job = job.id, "cron expression yields no next occurrence; completing");
                    sqlx::query(
                        "UPDATE scheduled_jobs SET status = 'done', last_run_at = ?2 WHERE id = ?1",
                    )
                    .bind(job.id)
                    .bind(fmt_ts(now))
                    .execute(db.pool())
                    .await?;
                }
            }
        }
        None => {
            sqlx::query("UPDATE scheduled_jobs SET status = 'done', last_run_at = ?2 WHERE id = ?1")
                .bind(job.id)
                .bind(fmt_ts(now))
                .execute(db.pool())
                .await?;
        }
    }
    Ok(())
}

/// The tick runner. Announcement executions get their own deadline,
/// independent of webhook requests.
pub struct JobRunner {
    db: Arc<Db>,
    deps: ExecutorDeps,
    tick: Duration,
    execution_deadline: Duration,
}

impl JobRunner {
    /// Create a runner.
    pub fn new(db: Arc<Db>, deps: ExecutorDeps, tick: Duration, execution_deadline: Duration) -> Self {
        Self {
            db,
            deps,
            tick,
            execution_deadline,
        }
    }

    /// Run until the shutdown signal resolves.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick_once(Utc::now()).await {
                        error!(error = %err, "job tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("job runner stopping");
                    return;
                }
            }
        }
    }

    /// Process everything due at `now`. Public for tests.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure while listing jobs; per-job
    /// failures are logged and do not stop the tick.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let jobs = due_jobs(&self.db, now, 50).await?;
        for job in jobs {
            let tenant = self.db.tenant(job.tenant_id);
            let dispatch = tokio::time::timeout(
                self.execution_deadline,
                self.dispatch(&tenant, &job, now),
            )
            .await;
            match dispatch {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(job = job.id, kind = %job.kind, error = %err, "job dispatch failed");
                }
                Err(_) => {
                    error!(job = job.id, kind = %job.kind, "job dispatch timed out");
                }
            }
            // At-least-once: settle after dispatch so a crash before this
            // point replays the job; executors dedupe.
            settle_job(&self.db, &job, now).await?;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        tenant: &TenantDb,
        job: &DueJob,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        match job.kind.as_str() {
            KIND_ANNOUNCEMENT => {
                executor::execute_announcement_job(tenant, &self.deps, &job.payload, now).await
            }
            KIND_RETENTION => {
                let purged = tenant.purge_expired_decisions(now).await?;
                info!(purged, "decision log retention applied");
                Ok(())
            }
            other => {
                warn!(kind = %other, "unknown job kind, dropping");
                Ok(())
            }
        }
    }
}
