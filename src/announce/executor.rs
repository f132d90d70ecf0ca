//! Scheduled announcement execution.
//!
//! Idempotent per (announcement, execution number): the first act of an
//! execution is claiming its log slot, so a replayed job delivery sends
//! nothing twice. Weekend and holiday skipping is evaluated per execution
//! in the announcement's timezone.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Announcement, LogStatus, ScheduleType, Status};
use crate::chat::{ChatMessaging, ChatTaskOps};
use crate::jobs;
use crate::store::TenantDb;
use crate::types::Classification;

/// External collaborators the executor needs.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub messaging: Arc<dyn ChatMessaging>,
    pub tasks: Arc<dyn ChatTaskOps>,
}

/// Fixed-date public holidays observed by the skip-holiday flag. Regional
/// calendars can extend this via configuration later.
const FIXED_HOLIDAYS: &[(u32, u32)] = &[
    (1, 1),
    (1, 2),
    (1, 3),
    (2, 11),
    (2, 23),
    (4, 29),
    (5, 3),
    (5, 4),
    (5, 5),
    (8, 11),
    (11, 3),
    (11, 23),
    (12, 31),
];

/// Is the local date a configured holiday?
pub fn is_holiday(date: NaiveDate) -> bool {
    FIXED_HOLIDAYS
        .iter()
        .any(|&(month, day)| date.month() == month && date.day() == day)
}

/// Is the local date a weekend?
pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Why an execution was skipped, if it was.
fn skip_reason(announcement: &Announcement, now: DateTime<Utc>) -> Option<&'static str> {
    let tz: chrono_tz::Tz = announcement.timezone.parse().ok()?;
    let local_date = now.with_timezone(&tz).date_naive();
    if announcement.skip_weekend && is_weekend(local_date) {
        return Some("weekend");
    }
    if announcement.skip_holiday && is_holiday(local_date) {
        return Some("holiday");
    }
    None
}

/// Entry point from the job runner.
///
/// # Errors
///
/// Returns an error on store failure; chat failures are absorbed into the
/// execution log as failed/partial outcomes.
pub async fn execute_announcement_job(
    db: &TenantDb,
    deps: &ExecutorDeps,
    payload: &Value,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let announcement_id = payload
        .get("announcement_id")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| anyhow::anyhow!("announcement job payload missing announcement_id"))?;
    let execution_number = payload
        .get("execution_number")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    execute(db, deps, announcement_id, execution_number, now).await
}

/// Execute one announcement slot.
///
/// # Errors
///
/// Returns an error on store failure.
pub async fn execute(
    db: &TenantDb,
    deps: &ExecutorDeps,
    announcement_id: Uuid,
    execution_number_hint: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let mut announcement = db.announcement(announcement_id).await?;

    // Recurring slots derive their number from the execution count; a
    // one-shot job carries it in the payload.
    let execution_number = if execution_number_hint > 0 {
        execution_number_hint
    } else {
        announcement.execution_count.saturating_add(1)
    };

    if !db
        .claim_execution(announcement_id, execution_number, now)
        .await?
    {
        info!(%announcement_id, execution_number, "execution already claimed, skipping replay");
        return Ok(());
    }

    if announcement.status.is_terminal() || announcement.status == Status::Paused {
        db.finish_execution(
            announcement_id,
            execution_number,
            LogStatus::Skipped,
            None,
            0,
            &[],
            Some(announcement.status.as_str()),
        )
        .await?;
        return Ok(());
    }

    if let Some(reason) = skip_reason(&announcement, now) {
        db.finish_execution(
            announcement_id,
            execution_number,
            LogStatus::Skipped,
            None,
            0,
            &[],
            Some(reason),
        )
        .await?;
        advance_schedule(db, &mut announcement, now).await?;
        db.record_audit(
            "scheduler",
            "announcement_skipped",
            "announcement",
            Some(&announcement_id.to_string()),
            Classification::Internal,
            now,
        )
        .await?;
        return Ok(());
    }

    db.set_announcement_status(announcement_id, Status::Executing, now)
        .await?;

    let Some(room_id) = announcement.target_room_id.clone() else {
        db.finish_execution(
            announcement_id,
            execution_number,
            LogStatus::Failed,
            None,
            0,
            &[],
            Some("no_target_room"),
        )
        .await?;
        db.set_announcement_status(announcement_id, Status::Failed, now)
            .await?;
        return Ok(());
    };

    // Send the message first; task creation failures downgrade to partial.
    let sent = deps
        .messaging
        .send_message(db.tenant_id(), &room_id, &announcement.message_body)
        .await;

    let sent_message_id = match sent {
        Ok(message_id) => message_id,
        Err(err) => {
            warn!(%announcement_id, error = %err, "announcement send failed");
            db.finish_execution(
                announcement_id,
                execution_number,
                LogStatus::Failed,
                None,
                0,
                &[],
                None,
            )
            .await?;
            let terminal = announcement.schedule_type != ScheduleType::Recurring;
            if terminal {
                db.set_announcement_status(announcement_id, Status::Failed, now)
                    .await?;
            } else {
                advance_schedule(db, &mut announcement, now).await?;
            }
            return Ok(());
        }
    };

    let (tasks_created, members, partial) = if announcement.create_tasks {
        create_member_tasks(db, deps, &announcement, &room_id).await
    } else {
        (0, Vec::new(), false)
    };

    let status = if partial {
        LogStatus::PartialFailure
    } else {
        LogStatus::Completed
    };
    db.finish_execution(
        announcement_id,
        execution_number,
        status,
        Some(&sent_message_id),
        tasks_created,
        &members,
        None,
    )
    .await?;

    announcement.execution_count = execution_number.max(announcement.execution_count);
    announcement.last_execution_at = Some(now);
    advance_schedule(db, &mut announcement, now).await?;

    db.record_audit(
        "scheduler",
        "announcement_executed",
        "announcement",
        Some(&announcement_id.to_string()),
        Classification::Internal,
        now,
    )
    .await?;
    info!(%announcement_id, execution_number, tasks_created, "announcement executed");
    Ok(())
}

async fn create_member_tasks(
    db: &TenantDb,
    deps: &ExecutorDeps,
    announcement: &Announcement,
    room_id: &str,
) -> (i64, Vec<String>, bool) {
    let members = match deps.tasks.room_members(db.tenant_id(), room_id).await {
        Ok(members) => members,
        Err(err) => {
            warn!(error = %err, "member fetch failed; skipping task creation");
            return (0, Vec::new(), true);
        }
    };

    let mut assignees: Vec<String> = members
        .iter()
        .map(|member| member.account_id.clone())
        .filter(|account| !announcement.task_exclude.contains(account))
        .collect();
    for included in &announcement.task_include {
        if !assignees.contains(included) {
            assignees.push(included.clone());
        }
    }
    if assignees.is_empty() {
        return (0, Vec::new(), false);
    }

    match deps
        .tasks
        .create_task(
            db.tenant_id(),
            room_id,
            &announcement.message_body,
            &assignees,
            announcement.task_deadline,
        )
        .await
    {
        Ok(task_ids) => (
            i64::try_from(task_ids.len()).unwrap_or(i64::MAX),
            assignees,
            false,
        ),
        Err(err) => {
            warn!(error = %err, "task creation failed");
            (0, assignees, true)
        }
    }
}

/// After an execution (or skip): recurring announcements move to their
/// next occurrence or complete at the max-execution cap; one-shots
/// complete.
async fn advance_schedule(
    db: &TenantDb,
    announcement: &mut Announcement,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    match announcement.schedule_type {
        ScheduleType::Recurring => {
            let capped = announcement
                .max_executions
                .is_some_and(|max| announcement.execution_count >= max);
            if capped {
                announcement.status = Status::Completed;
                announcement.next_execution_at = None;
                db.cancel_jobs_for_announcement(announcement.id).await?;
            } else {
                let next = announcement.cron_expression.as_deref().and_then(|expr| {
                    jobs::next_cron_occurrence(expr, &announcement.timezone, now)
                });
                match next {
                    Some(next) => {
                        announcement.status = Status::Scheduled;
                        announcement.next_execution_at = Some(next);
                    }
                    None => {
                        announcement.status = Status::Completed;
                        announcement.next_execution_at = None;
                    }
                }
            }
        }
        ScheduleType::Immediate | ScheduleType::OneTime => {
            announcement.status = Status::Completed;
            announcement.next_execution_at = None;
        }
    }
    db.save_announcement(announcement, now).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chat::{ChatError, RoomMember};
    use crate::store::testutil::seed_tenant;
    use crate::store::Db;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MockChat {
        pub sent: Mutex<Vec<(String, String)>>,
        pub tasks: Mutex<Vec<(String, Vec<String>)>>,
        pub send_calls: AtomicUsize,
        pub fail_sends: bool,
    }

    #[async_trait]
    impl ChatMessaging for MockChat {
        async fn send_message(
            &self,
            _tenant_id: Uuid,
            room_id: &str,
            text: &str,
        ) -> Result<String, ChatError> {
            self.send_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_sends {
                return Err(ChatError::Unavailable(503));
            }
            self.sent
                .lock()
                .expect("lock")
                .push((room_id.to_owned(), text.to_owned()));
            Ok(format!("sent-{}", self.send_calls.load(Ordering::SeqCst)))
        }
    }

    #[async_trait]
    impl ChatTaskOps for MockChat {
        async fn create_task(
            &self,
            _tenant_id: Uuid,
            room_id: &str,
            _body: &str,
            assignee_account_ids: &[String],
            _due_at: Option<DateTime<Utc>>,
        ) -> Result<Vec<String>, ChatError> {
            self.tasks
                .lock()
                .expect("lock")
                .push((room_id.to_owned(), assignee_account_ids.to_vec()));
            Ok(assignee_account_ids
                .iter()
                .enumerate()
                .map(|(i, _)| format!("task-{i}"))
                .collect())
        }

        async fn room_members(
            &self,
            _tenant_id: Uuid,
            _room_id: &str,
        ) -> Result<Vec<RoomMember>, ChatError> {
            Ok(vec![
                RoomMember {
                    account_id: "a1".to_owned(),
                    name: "一人目".to_owned(),
                },
                RoomMember {
                    account_id: "a2".to_owned(),
                    name: "二人目".to_owned(),
                },
            ])
        }
    }

    fn deps(chat: Arc<MockChat>) -> ExecutorDeps {
        ExecutorDeps {
            messaging: chat.clone(),
            tasks: chat,
        }
    }

    async fn scheduled_announcement(db: &Db, tenant: Uuid) -> Announcement {
        let t = db.tenant(tenant);
        let now = Utc::now();
        let mut announcement = Announcement::new(
            "明日はノートPC持参".to_owned(),
            "acct-9".to_owned(),
            "room-src".to_owned(),
            "Asia/Tokyo".to_owned(),
            now,
        );
        announcement.target_room_id = Some("room-t".to_owned());
        announcement.create_tasks = true;
        announcement.task_exclude = vec!["a2".to_owned()];
        announcement.status = Status::Scheduled;
        announcement.next_execution_at = Some(now);
        t.save_announcement(&announcement, now).await.expect("save");
        announcement
    }

    #[tokio::test]
    async fn happy_path_sends_and_creates_tasks() {
        let db = Db::open_in_memory().await.expect("open");
        let tenant_id = seed_tenant(&db, "org-1").await;
        let tenant = db.tenant(tenant_id);
        let announcement = scheduled_announcement(&db, tenant_id).await;
        let chat = Arc::new(MockChat::default());

        execute(&tenant, &deps(chat.clone()), announcement.id, 1, Utc::now())
            .await
            .expect("execute");

        assert_eq!(chat.sent.lock().expect("lock").len(), 1);
        let tasks = chat.tasks.lock().expect("lock");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].1, vec!["a1".to_owned()], "excluded member dropped");
        drop(tasks);

        let logs = tenant.execution_logs(announcement.id).await.expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].1, "completed");
        let after = tenant.announcement(announcement.id).await.expect("load");
        assert_eq!(after.status, Status::Completed);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn replayed_slot_sends_once() {
        let db = Db::open_in_memory().await.expect("open");
        let tenant_id = seed_tenant(&db, "org-1").await;
        let tenant = db.tenant(tenant_id);
        let announcement = scheduled_announcement(&db, tenant_id).await;
        let chat = Arc::new(MockChat::default());
        let now = Utc::now();

        execute(&tenant, &deps(chat.clone()), announcement.id, 1, now)
            .await
            .expect("first");
        execute(&tenant, &deps(chat.clone()), announcement.id, 1, now)
            .await
            .expect("replay");

        assert_eq!(chat.send_calls.load(Ordering::SeqCst), 1, "one send despite replay");
        let logs = tenant.execution_logs(announcement.id).await.expect("logs");
        assert_eq!(logs.len(), 1);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn weekend_execution_skips_with_reason() {
        let db = Db::open_in_memory().await.expect("open");
        let tenant_id = seed_tenant(&db, "org-1").await;
        let tenant = db.tenant(tenant_id);
        let mut announcement = scheduled_announcement(&db, tenant_id).await;
        announcement.skip_weekend = true;
        tenant
            .save_announcement(&announcement, Utc::now())
            .await
            .expect("save");
        let chat = Arc::new(MockChat::default());

        // 2026-08-01 is a Saturday in JST.
        let saturday = DateTime::parse_from_rfc3339("2026-08-01T01:00:00Z")
            .expect("parse")
            .with_timezone(&Utc);
        execute(&tenant, &deps(chat.clone()), announcement.id, 1, saturday)
            .await
            .expect("execute");

        assert_eq!(chat.send_calls.load(Ordering::SeqCst), 0);
        let logs = tenant.execution_logs(announcement.id).await.expect("logs");
        assert_eq!(logs[0].1, "skipped");
        assert_eq!(logs[0].2.as_deref(), Some("weekend"));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn send_failure_marks_failed() {
        let db = Db::open_in_memory().await.expect("open");
        let tenant_id = seed_tenant(&db, "org-1").await;
        let tenant = db.tenant(tenant_id);
        let announcement = scheduled_announcement(&db, tenant_id).await;
        let chat = Arc::new(MockChat {
            fail_sends: true,
            ..MockChat::default()
        });

        execute(&tenant, &deps(chat), announcement.id, 1, Utc::now())
            .await
            .expect("execute");
        let logs = tenant.execution_logs(announcement.id).await.expect("logs");
        assert_eq!(logs[0].1, "failed");
        let after = tenant.announcement(announcement.id).await.expect("load");
        assert_eq!(after.status, Status::Failed);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn recurring_advances_and_caps() {
        let db = Db::open_in_memory().await.expect("open");
        let tenant_id = seed_tenant(&db, "org-1").await;
        let tenant = db.tenant(tenant_id);
        let now = Utc::now();
        let mut announcement = scheduled_announcement(&db, tenant_id).await;
        announcement.schedule_type = ScheduleType::Recurring;
        announcement.cron_expression = Some("0 0 9 * * *".to_owned());
        announcement.max_executions = Some(2);
        announcement.create_tasks = false;
        tenant.save_announcement(&announcement, now).await.expect("save");
        let chat = Arc::new(MockChat::default());

        execute(&tenant, &deps(chat.clone()), announcement.id, 0, now)
            .await
            .expect("first");
        let after_first = tenant.announcement(announcement.id).await.expect("load");
        assert_eq!(after_first.status, Status::Scheduled);
        let next = after_first.next_execution_at.expect("next set");
        assert!(next > now, "next execution strictly in the future");

        execute(&tenant, &deps(chat.clone()), announcement.id, 0, now)
            .await
            .expect("second");
        let after_second = tenant.announcement(announcement.id).await.expect("load");
        assert_eq!(after_second.status, Status::Completed, "max executions reached");
        assert!(after_second.next_execution_at.is_none());
        db.shutdown().await;
    }

    #[test]
    fn holiday_and_weekend_calendar() {
        let new_year = NaiveDate::from_ymd_opt(2026, 1, 1).expect("date");
        assert!(is_holiday(new_year));
        let saturday = NaiveDate::from_ymd_opt(2026, 8, 1).expect("date");
        assert!(is_weekend(saturday));
        let monday = NaiveDate::from_ymd_opt(2026, 8, 3).expect("date");
        assert!(!is_weekend(monday) && !is_holiday(monday));
    }
}
