//! Tasks, goals, and insights.
//!
//! The Brain owns none of these as a subsystem of record — tasks mirror the
//! chat service, goals and insights have their own writers — but the task
//! handlers write through here so memory context stays coherent.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{fmt_ts, parse_ts, parse_uuid, StoreError, TenantDb};

/// An open or completed task.
#[derive(Debug, Clone)]
pub struct TaskItem {
    pub id: Uuid,
    pub room_id: String,
    pub assignee_user_id: Uuid,
    pub body: String,
    pub status: String,
    pub due_at: Option<DateTime<Utc>>,
    pub chat_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An active goal.
#[derive(Debug, Clone)]
pub struct Goal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub why: Option<String>,
    pub metric: Option<String>,
    pub deadline: Option<String>,
    pub status: String,
}

/// A detected insight.
#[derive(Debug, Clone)]
pub struct Insight {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub priority: i64,
    pub category: String,
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskItem, StoreError> {
    let due_at = match row.get::<Option<String>, _>("due_at") {
        Some(raw) => Some(parse_ts(&raw)?),
        None => None,
    };
    Ok(TaskItem {
        id: parse_uuid(row.get::<String, _>("id").as_str())?,
        room_id: row.get("room_id"),
        assignee_user_id: parse_uuid(row.get::<String, _>("assignee_user_id").as_str())?,
        body: row.get("body"),
        status: row.get("status"),
        due_at,
        chat_task_id: row.get("chat_task_id"),
        created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
    })
}

impl TenantDb {
    /// Open tasks assigned to a user across all rooms, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn open_tasks_for(
        &self,
        user_id: Uuid,
        limit: u32,
    ) -> Result<Vec<TaskItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, room_id, assignee_user_id, body, status, due_at, chat_task_id, created_at \
             FROM tasks WHERE tenant_id = ?1 AND assignee_user_id = ?2 AND status = 'open' \
             ORDER BY created_at DESC LIMIT ?3",
        )
        .bind(self.tid())
        .bind(user_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Insert a task mirror row.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn insert_task(
        &self,
        room_id: &str,
        assignee_user_id: Uuid,
        body: &str,
        due_at: Option<DateTime<Utc>>,
        chat_task_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO tasks \
               (tenant_id, id, room_id, assignee_user_id, body, status, due_at, chat_task_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7, ?8)",
        )
        .bind(self.tid())
        .bind(id.to_string())
        .bind(room_id)
        .bind(assignee_user_id.to_string())
        .bind(body)
        .bind(due_at.map(fmt_ts))
        .bind(chat_task_id)
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Mark a task done. Returns `false` when no open task matched.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn complete_task(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'done' \
             WHERE tenant_id = ?1 AND id = ?2 AND status = 'open'",
        )
        .bind(self.tid())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// The most recently created open task whose body contains the needle
    /// (ellipsis resolution support). The needle is bound, never
    /// interpolated; `instr` keeps LIKE metacharacters inert.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn find_open_task_matching(
        &self,
        user_id: Uuid,
        needle: &str,
    ) -> Result<Option<TaskItem>, StoreError> {
        let row = sqlx::query(
            "SELECT id, room_id, assignee_user_id, body, status, due_at, chat_task_id, created_at \
             FROM tasks \
             WHERE tenant_id = ?1 AND assignee_user_id = ?2 AND status = 'open' \
               AND (?3 = '' OR instr(body, ?3) > 0) \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(self.tid())
        .bind(user_id.to_string())
        .bind(needle)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Active goals for a user, bounded by `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn active_goals_for(&self, user_id: Uuid, limit: u32) -> Result<Vec<Goal>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, title, why, metric, deadline, status FROM goals \
             WHERE tenant_id = ?1 AND user_id = ?2 AND status = 'active' \
             ORDER BY created_at DESC LIMIT ?3",
        )
        .bind(self.tid())
        .bind(user_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        let mut goals = Vec::with_capacity(rows.len());
        for row in rows {
            goals.push(Goal {
                id: parse_uuid(row.get::<String, _>("id").as_str())?,
                user_id: parse_uuid(row.get::<String, _>("user_id").as_str())?,
                title: row.get("title"),
                why: row.get("why"),
                metric: row.get("metric"),
                deadline: row.get("deadline"),
                status: row.get("status"),
            });
        }
        Ok(goals)
    }

    /// Insert a goal captured by the goal-setting flow.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn insert_goal(
        &self,
        user_id: Uuid,
        title: &str,
        why: Option<&str>,
        metric: Option<&str>,
        deadline: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO goals (tenant_id, id, user_id, title, why, metric, deadline, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8)",
        )
        .bind(self.tid())
        .bind(id.to_string())
        .bind(user_id.to_string())
        .bind(title)
        .bind(why)
        .bind(metric)
        .bind(deadline)
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// High-priority open insights, bounded by `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn recent_insights(
        &self,
        min_priority: i64,
        limit: u32,
    ) -> Result<Vec<Insight>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, title, body, priority, category FROM insights \
             WHERE tenant_id = ?1 AND status = 'open' AND priority >= ?2 \
             ORDER BY priority DESC, created_at DESC LIMIT ?3",
        )
        .bind(self.tid())
        .bind(min_priority)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        let mut insights = Vec::with_capacity(rows.len());
        for row in rows {
            insights.push(Insight {
                id: parse_uuid(row.get::<String, _>("id").as_str())?,
                title: row.get("title"),
                body: row.get("body"),
                priority: row.get("priority"),
                category: row.get("category"),
            });
        }
        Ok(insights)
    }

    /// Raise an insight (recurrence proposals, pattern alerts).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn raise_insight(
        &self,
        title: &str,
        body: &str,
        priority: i64,
        category: &str,
        now: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO insights (tenant_id, id, title, body, priority, category, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7)",
        )
        .bind(self.tid())
        .bind(id.to_string())
        .bind(title)
        .bind(body)
        .bind(priority)
        .bind(category)
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }
}
