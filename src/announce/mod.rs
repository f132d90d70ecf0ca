//! Announcement subsystem: model, persistence, confirmation flow,
//! fuzzy room resolution, pattern detection, and scheduled execution.
//!
//! The confirmation state machine shares the Brain's conversation state
//! layer; execution runs under the job runner with its own deadline and is
//! idempotent per (announcement, execution number).

pub mod executor;
pub mod flow;
pub mod patterns;
pub mod rooms;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use crate::store::{fmt_ts, parse_ts, parse_uuid, StoreError, TenantDb};

/// Announcement lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    PendingRoom,
    Confirmed,
    Scheduled,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl Status {
    /// String form stored in SQLite (CHECK-constrained).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PendingRoom => "pending_room",
            Self::Confirmed => "confirmed",
            Self::Scheduled => "scheduled",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "pending_room" => Ok(Self::PendingRoom),
            "confirmed" => Ok(Self::Confirmed),
            "scheduled" => Ok(Self::Scheduled),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            other => Err(StoreError::InvalidValue {
                field: "announcement_status",
                value: other.to_owned(),
            }),
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// How the announcement is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleType {
    Immediate,
    OneTime,
    Recurring,
}

impl ScheduleType {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::OneTime => "one_time",
            Self::Recurring => "recurring",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised schedule type.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "one_time" => Ok(Self::OneTime),
            "recurring" => Ok(Self::Recurring),
            other => Err(StoreError::InvalidValue {
                field: "schedule_type",
                value: other.to_owned(),
            }),
        }
    }
}

/// An announcement row.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub id: Uuid,
    pub title: String,
    pub message_body: String,
    /// `None` until room resolution succeeds.
    pub target_room_id: Option<String>,
    pub create_tasks: bool,
    pub task_include: Vec<String>,
    pub task_exclude: Vec<String>,
    pub schedule_type: ScheduleType,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub timezone: String,
    pub skip_holiday: bool,
    pub skip_weekend: bool,
    pub task_deadline: Option<DateTime<Utc>>,
    pub status: Status,
    pub requester_account_id: String,
    pub source_room_id: String,
    pub confirmation_message_id: Option<String>,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub execution_count: i64,
    pub max_executions: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Announcement {
    /// A fresh pending announcement.
    pub fn new(
        message_body: String,
        requester_account_id: String,
        source_room_id: String,
        timezone: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: String::new(),
            message_body,
            target_room_id: None,
            create_tasks: false,
            task_include: Vec::new(),
            task_exclude: Vec::new(),
            schedule_type: ScheduleType::Immediate,
            scheduled_at: None,
            cron_expression: None,
            timezone,
            skip_holiday: false,
            skip_weekend: false,
            task_deadline: None,
            status: Status::Pending,
            requester_account_id,
            source_room_id,
            confirmation_message_id: None,
            next_execution_at: None,
            last_execution_at: None,
            execution_count: 0,
            max_executions: None,
            created_at: now,
        }
    }
}

/// Outcome of one execution, written to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Pending,
    InProgress,
    Completed,
    PartialFailure,
    Failed,
    Skipped,
}

impl LogStatus {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::PartialFailure => "partial_failure",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

fn list_to_json(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_owned())
}

fn json_to_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| parse_ts(&s)).transpose()
}

fn row_to_announcement(row: &sqlx::sqlite::SqliteRow) -> Result<Announcement, StoreError> {
    Ok(Announcement {
        id: parse_uuid(row.get::<String, _>("id").as_str())?,
        title: row.get("title"),
        message_body: row.get("message_body"),
        target_room_id: row.get("target_room_id"),
        create_tasks: row.get::<i64, _>("create_tasks") != 0,
        task_include: json_to_list(row.get::<String, _>("task_include").as_str()),
        task_exclude: json_to_list(row.get::<String, _>("task_exclude").as_str()),
        schedule_type: ScheduleType::parse(row.get::<String, _>("schedule_type").as_str())?,
        scheduled_at: opt_ts(row.get("scheduled_at"))?,
        cron_expression: row.get("cron_expression"),
        timezone: row.get("timezone"),
        skip_holiday: row.get::<i64, _>("skip_holiday") != 0,
        skip_weekend: row.get::<i64, _>("skip_weekend") != 0,
        task_deadline: opt_ts(row.get("task_deadline"))?,
        status: Status::parse(row.get::<String, _>("status").as_str())?,
        requester_account_id: row.get("requester_account_id"),
        source_room_id: row.get("source_room_id"),
        confirmation_message_id: row.get("confirmation_message_id"),
        next_execution_at: opt_ts(row.get("next_execution_at"))?,
        last_execution_at: opt_ts(row.get("last_execution_at"))?,
        execution_count: row.get("execution_count"),
        max_executions: row.get("max_executions"),
        created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
    })
}

const ANNOUNCEMENT_COLUMNS: &str = "id, title, message_body, target_room_id, create_tasks, \
    task_include, task_exclude, schedule_type, scheduled_at, cron_expression, timezone, \
    skip_holiday, skip_weekend, task_deadline, status, requester_account_id, source_room_id, \
    confirmation_message_id, next_execution_at, last_execution_at, execution_count, \
    max_executions, created_at";

impl TenantDb {
    /// Insert or fully overwrite an announcement row.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn save_announcement(
        &self,
        announcement: &Announcement,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO announcements \
               (tenant_id, id, title, message_body, target_room_id, create_tasks, task_include, \
                task_exclude, schedule_type, scheduled_at, cron_expression, timezone, \
                skip_holiday, skip_weekend, task_deadline, status, requester_account_id, \
                source_room_id, confirmation_message_id, next_execution_at, last_execution_at, \
                execution_count, max_executions, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25) \
             ON CONFLICT (tenant_id, id) DO UPDATE SET \
               title = excluded.title, \
               message_body = excluded.message_body, \
               target_room_id = excluded.target_room_id, \
               create_tasks = excluded.create_tasks, \
               task_include = excluded.task_include, \
               task_exclude = excluded.task_exclude, \
               schedule_type = excluded.schedule_type, \
               scheduled_at = excluded.scheduled_at, \
               cron_expression = excluded.cron_expression, \
               timezone = excluded.timezone, \
               skip_holiday = excluded.skip_holiday, \
               skip_weekend = excluded.skip_weekend, \
               task_deadline = excluded.task_deadline, \
               status = excluded.status, \
               confirmation_message_id = excluded.confirmation_message_id, \
               next_execution_at = excluded.next_execution_at, \
               last_execution_at = excluded.last_execution_at, \
               execution_count = excluded.execution_count, \
               max_executions = excluded.max_executions, \
               updated_at = excluded.updated_at",
        )
        .bind(self.tid())
        .bind(announcement.id.to_string())
        .bind(&announcement.title)
        .bind(&announcement.message_body)
        .bind(announcement.target_room_id.as_deref())
        .bind(i64::from(announcement.create_tasks))
        .bind(list_to_json(&announcement.task_include))
        .bind(list_to_json(&announcement.task_exclude))
        .bind(announcement.schedule_type.as_str())
        .bind(announcement.scheduled_at.map(fmt_ts))
        .bind(announcement.cron_expression.as_deref())
        .bind(&announcement.timezone)
        .bind(i64::from(announcement.skip_holiday))
        .bind(i64::from(announcement.skip_weekend))
        .bind(announcement.task_deadline.map(fmt_ts))
        .bind(announcement.status.as_str())
        .bind(&announcement.requester_account_id)
        .bind(&announcement.source_room_id)
        .bind(announcement.confirmation_message_id.as_deref())
        .bind(announcement.next_execution_at.map(fmt_ts))
        .bind(announcement.last_execution_at.map(fmt_ts))
        .bind(announcement.execution_count)
        .bind(announcement.max_executions)
        .bind(fmt_ts(announcement.created_at))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load one announcement.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent.
    pub async fn announcement(&self, id: Uuid) -> Result<Announcement, StoreError> {
        let query = format!(
            "SELECT {ANNOUNCEMENT_COLUMNS} FROM announcements WHERE tenant_id = ?1 AND id = ?2"
        );
        let row = sqlx::query(&query)
            .bind(self.tid())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "announcement",
            })?;
        row_to_announcement(&row)
    }

    /// Move an announcement to a new status.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn set_announcement_status(
        &self,
        id: Uuid,
        status: Status,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE announcements SET status = ?3, updated_at = ?4 \
             WHERE tenant_id = ?1 AND id = ?2",
        )
        .bind(self.tid())
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancel any still-pending announcements from the requester created
    /// before the cutoff. Returns how many were cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn cancel_stale_pending_announcements(
        &self,
        requester_account_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE announcements SET status = 'cancelled', updated_at = ?4 \
             WHERE tenant_id = ?1 AND requester_account_id = ?2 \
               AND status IN ('pending', 'pending_room') AND created_at < ?3",
        )
        .bind(self.tid())
        .bind(requester_account_id)
        .bind(fmt_ts(cutoff))
        .bind(fmt_ts(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// The most recent non-terminal announcement from a requester, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn latest_open_announcement(
        &self,
        requester_account_id: &str,
    ) -> Result<Option<Announcement>, StoreError> {
        let query = format!(
            "SELECT {ANNOUNCEMENT_COLUMNS} FROM announcements \
             WHERE tenant_id = ?1 AND requester_account_id = ?2 \
               AND status IN ('pending', 'pending_room', 'confirmed', 'scheduled') \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(self.tid())
            .bind(requester_account_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_announcement).transpose()
    }

    /// Claim one execution slot. Returns `false` when this
    /// (announcement, execution number) was already claimed — the
    /// at-least-once job delivery replayed.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn claim_execution(
        &self,
        announcement_id: Uuid,
        execution_number: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO announcement_logs \
               (tenant_id, announcement_id, execution_number, status, executed_at) \
             VALUES (?1, ?2, ?3, 'in_progress', ?4)",
        )
        .bind(self.tid())
        .bind(announcement_id.to_string())
        .bind(execution_number)
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Finalize an execution log entry.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_execution(
        &self,
        announcement_id: Uuid,
        execution_number: i64,
        status: LogStatus,
        sent_message_id: Option<&str>,
        tasks_created: i64,
        members_snapshot: &[String],
        skip_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE announcement_logs SET \
               status = ?4, sent = ?5, sent_message_id = ?6, tasks_created = ?7, \
               members_snapshot = ?8, skip_reason = ?9 \
             WHERE tenant_id = ?1 AND announcement_id = ?2 AND execution_number = ?3",
        )
        .bind(self.tid())
        .bind(announcement_id.to_string())
        .bind(execution_number)
        .bind(status.as_str())
        .bind(i64::from(sent_message_id.is_some()))
        .bind(sent_message_id)
        .bind(tasks_created)
        .bind(list_to_json(members_snapshot))
        .bind(skip_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Execution log rows for one announcement (tests, reporting).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn execution_logs(
        &self,
        announcement_id: Uuid,
    ) -> Result<Vec<(i64, String, Option<String>)>, StoreError> {
        let rows = sqlx::query(
            "SELECT execution_number, status, skip_reason FROM announcement_logs \
             WHERE tenant_id = ?1 AND announcement_id = ?2 ORDER BY execution_number",
        )
        .bind(self.tid())
        .bind(announcement_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get("execution_number"),
                    row.get("status"),
                    row.get("skip_reason"),
                )
            })
            .collect())
    }
}

/// Render the confirmation preview shown before scheduling.
pub fn render_preview(announcement: &Announcement, room_name: Option<&str>) -> String {
    let mut preview = String::from("以下の内容で配信します。よろしければ「はい」とお答えください。\n");
    if let Some(name) = room_name {
        preview.push_str(&format!("配信先: {name}\n"));
    }
    preview.push_str(&format!("内容: {}\n", announcement.message_body));
    if announcement.create_tasks {
        preview.push_str("タスク: ルームメンバー全員に作成");
        if let Some(deadline) = announcement.task_deadline {
            preview.push_str(&format!("（期限 {}）", deadline.format("%m/%d %H:%M")));
        }
        preview.push('\n');
    }
    match announcement.schedule_type {
        ScheduleType::Immediate => preview.push_str("配信時刻: 確認後すぐ\n"),
        ScheduleType::OneTime => {
            if let Some(at) = announcement.scheduled_at {
                preview.push_str(&format!("配信時刻: {}\n", at.format("%m/%d %H:%M")));
            }
        }
        ScheduleType::Recurring => {
            if let Some(cron) = &announcement.cron_expression {
                preview.push_str(&format!("繰り返し: {cron}\n"));
            }
        }
    }
    preview.push_str("文面の修正は「文面を変えて：新しい内容」と送ってください。");
    preview
}

/// Convenience payload for job enqueue.
pub fn job_payload(announcement_id: Uuid, execution_number: i64) -> Value {
    serde_json::json!({
        "announcement_id": announcement_id.to_string(),
        "execution_number": execution_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::seed_tenant;
    use crate::store::Db;

    #[tokio::test]
    async fn save_load_roundtrip() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        let tenant = db.tenant(t);
        let now = Utc::now();

        let mut announcement = Announcement::new(
            "明日はノートPCを持参してください".to_owned(),
            "acct-9".to_owned(),
            "room-src".to_owned(),
            "Asia/Tokyo".to_owned(),
            now,
        );
        announcement.create_tasks = true;
        announcement.target_room_id = Some("room-t".to_owned());
        tenant.save_announcement(&announcement, now).await.expect("save");

        let loaded = tenant.announcement(announcement.id).await.expect("load");
        assert_eq!(loaded.message_body, announcement.message_body);
        assert_eq!(loaded.status, Status::Pending);
        assert!(loaded.create_tasks);
        assert_eq!(loaded.target_room_id.as_deref(), Some("room-t"));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn stale_pending_cancelled_for_requester() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        let tenant = db.tenant(t);
        let old = Utc::now() - chrono::Duration::minutes(10);
        let now = Utc::now();

        let stale = Announcement::new("old".to_owned(), "acct-9".to_owned(), "r".to_owned(), "Asia/Tokyo".to_owned(), old);
        tenant.save_announcement(&stale, old).await.expect("save");
        let other = Announcement::new("other".to_owned(), "acct-2".to_owned(), "r".to_owned(), "Asia/Tokyo".to_owned(), old);
        tenant.save_announcement(&other, old).await.expect("save");

        let cancelled = tenant
            .cancel_stale_pending_announcements("acct-9", now)
            .await
            .expect("cancel");
        assert_eq!(cancelled, 1);
        assert_eq!(tenant.announcement(stale.id).await.expect("load").status, Status::Cancelled);
        assert_eq!(tenant.announcement(other.id).await.expect("load").status, Status::Pending);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn execution_claim_is_idempotent() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        let tenant = db.tenant(t);
        let id = Uuid::new_v4();
        let now = Utc::now();

        assert!(tenant.claim_execution(id, 1, now).await.expect("first"));
        assert!(!tenant.claim_execution(id, 1, now).await.expect("replay"));
        assert!(tenant.claim_execution(id, 2, now).await.expect("next slot"));
        db.shutdown().await;
    }
}
