//! Task capabilities: search, create, complete.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::brain::memory::MemoryContext;
use crate::capability::{CapabilityHandler, Envelope, HandlerError, HandlerResult};
use crate::chat::ChatTaskOps;
use crate::store::Db;

/// List the sender's open tasks grouped by room.
pub struct TaskSearchHandler {
    db: Arc<Db>,
}

impl TaskSearchHandler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CapabilityHandler for TaskSearchHandler {
    async fn run(
        &self,
        _params: &Value,
        envelope: &Envelope,
        _context: &MemoryContext,
    ) -> Result<HandlerResult, HandlerError> {
        let tenant = self.db.tenant(envelope.tenant_id);
        let tasks = tenant
            .open_tasks_for(envelope.user_id, 20)
            .await
            .map_err(|e| HandlerError::UpstreamUnavailable(e.to_string()))?;

        if tasks.is_empty() {
            return Ok(HandlerResult::message(
                "未完了のタスクはありません。お疲れさまです！",
            ));
        }

        let mut by_room: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for task in &tasks {
            let mut line = format!("・{}", task.body);
            if let Some(due) = task.due_at {
                line.push_str(&format!("（期限 {}）", due.format("%m/%d %H:%M")));
            }
            by_room.entry(task.room_id.as_str()).or_default().push(line);
        }

        let mut reply = format!("未完了のタスクが{}件あります。\n", tasks.len());
        for (room, lines) in &by_room {
            reply.push_str(&format!("[ルーム {room}]\n{}\n", lines.join("\n")));
        }

        Ok(HandlerResult::message(reply.trim_end().to_owned()).with_data(json!({
            "count": tasks.len(),
            "rooms": by_room.keys().collect::<Vec<_>>(),
        })))
    }
}

/// Create a task for a person, mirrored locally and in the chat service.
pub struct TaskCreateHandler {
    db: Arc<Db>,
    chat_tasks: Arc<dyn ChatTaskOps>,
}

impl TaskCreateHandler {
    pub fn new(db: Arc<Db>, chat_tasks: Arc<dyn ChatTaskOps>) -> Self {
        Self { db, chat_tasks }
    }
}

#[async_trait]
impl CapabilityHandler for TaskCreateHandler {
    async fn run(
        &self,
        params: &Value,
        envelope: &Envelope,
        context: &MemoryContext,
    ) -> Result<HandlerResult, HandlerError> {
        let assignee_name = params
            .get("assignee")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::ParameterInvalid("assignee".to_owned()))?
            .trim()
            .trim_end_matches("さん")
            .to_owned();
        let body = params
            .get("body")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::ParameterInvalid("body".to_owned()))?;
        let deadline = params
            .get("deadline")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let tenant = self.db.tenant(envelope.tenant_id);

        // Resolve the assignee: context persons first, then the directory.
        let person = context
            .persons
            .iter()
            .find(|person| person.name == assignee_name)
            .cloned();
        let person = match person {
            Some(person) => Some(person),
            None => tenant
                .person_by_name(&assignee_name)
                .await
                .map_err(|e| HandlerError::UpstreamUnavailable(e.to_string()))?,
        };
        let Some(person) = person else {
            return Err(HandlerError::NotFound(format!("person {assignee_name}")));
        };

        // Chat-side task first (no DB transaction is held here), local
        // mirror second.
        let chat_task_id = match &person.account_id {
            Some(account_id) => self
                .chat_tasks
                .create_task(
                    envelope.tenant_id,
                    &envelope.room_id,
                    body,
                    &[account_id.clone()],
                    deadline,
                )
                .await
                .map_err(|e| HandlerError::UpstreamUnavailable(e.to_string()))?
                .into_iter()
                .next(),
            None => None,
        };

        let assignee_user = match &person.account_id {
            Some(account_id) => tenant
                .user_by_account_id(account_id)
                .await
                .map_err(|e| HandlerError::UpstreamUnavailable(e.to_string()))?
                .map(|identity| identity.user_id),
            None => None,
        };

        let task_id = tenant
            .insert_task(
                &envelope.room_id,
                assignee_user.unwrap_or(envelope.user_id),
                body,
                deadline,
                chat_task_id.as_deref(),
                envelope.now,
            )
            .await
            .map_err(|e| HandlerError::UpstreamUnavailable(e.to_string()))?;

        let deadline_note = deadline
            .map(|due| format!("（期限 {}）", due.format("%m/%d %H:%M")))
            .unwrap_or_default();
        Ok(HandlerResult::message(format!(
            "{}さんにタスクを作成しました{deadline_note}：{body}",
            person.name
        ))
        .with_data(json!({
            "task_id": task_id.to_string(),
            "assignee": person.name,
        })))
    }
}

/// Mark one of the sender's open tasks done.
pub struct TaskCompleteHandler {
    db: Arc<Db>,
}

impl TaskCompleteHandler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CapabilityHandler for TaskCompleteHandler {
    async fn run(
        &self,
        params: &Value,
        envelope: &Envelope,
        context: &MemoryContext,
    ) -> Result<HandlerResult, HandlerError> {
        let needle = params
            .get("task")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");

        let tenant = self.db.tenant(envelope.tenant_id);
        let task = tenant
            .find_open_task_matching(envelope.user_id, needle)
            .await
            .map_err(|e| HandlerError::UpstreamUnavailable(e.to_string()))?;

        // Fall back to the most recently discussed task (ellipsis: "mark
        // done" with no object).
        let task = match task {
            Some(task) => Some(task),
            None if needle.is_empty() => context.most_recent_task().cloned(),
            None => None,
        };
        let Some(task) = task else {
            return Err(HandlerError::NotFound("open task".to_owned()));
        };

        let completed = tenant
            .complete_task(task.id)
            .await
            .map_err(|e| HandlerError::UpstreamUnavailable(e.to_string()))?;
        if !completed {
            return Err(HandlerError::Conflict("task already done".to_owned()));
        }

        Ok(
            HandlerResult::message(format!("「{}」を完了にしました。お疲れさまです！", task.body))
                .with_data(json!({"task_id": task.id.to_string()})),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announce::executor::tests::MockChat;
    use crate::store::testutil::{seed_person, seed_task, seed_tenant, seed_user};
    use crate::types::{RoleLevel, SenderIdentity};
    use uuid::Uuid;

    fn envelope(tenant_id: Uuid, user_id: Uuid) -> Envelope {
        Envelope {
            tenant_id,
            room_id: "room-a".to_owned(),
            user_id,
            account_id: "acct-1".to_owned(),
            sender_name: "Sato".to_owned(),
            now: Utc::now(),
        }
    }

    fn context(user_id: Uuid) -> MemoryContext {
        MemoryContext::empty(SenderIdentity {
            user_id,
            account_id: "acct-1".to_owned(),
            display_name: "Sato".to_owned(),
            role_level: RoleLevel::LEAD,
        })
    }

    #[tokio::test]
    async fn search_groups_by_room() {
        let db = Arc::new(crate::store::Db::open_in_memory().await.expect("open"));
        let t = seed_tenant(&db, "org-1").await;
        let user = seed_user(&db, t, "acct-1", "Sato", 3).await;
        seed_task(&db, t, "room-a", user, "slide prep").await;
        seed_task(&db, t, "room-a", user, "budget review").await;
        seed_task(&db, t, "room-b", user, "venue booking").await;

        let handler = TaskSearchHandler::new(db.clone());
        let result = handler
            .run(&json!({}), &envelope(t, user), &context(user))
            .await
            .expect("run");
        assert!(result.success);
        assert!(result.user_message.contains("3件"));
        assert!(result.user_message.contains("room-a"));
        assert!(result.user_message.contains("room-b"));
    }

    #[tokio::test]
    async fn create_resolves_person_and_mirrors() {
        let db = Arc::new(crate::store::Db::open_in_memory().await.expect("open"));
        let t = seed_tenant(&db, "org-1").await;
        let user = seed_user(&db, t, "acct-1", "Sato", 3).await;
        let taro_user = seed_user(&db, t, "acct-taro", "太郎", 2).await;
        seed_person(&db, t, "太郎", Some("acct-taro")).await;
        let chat = Arc::new(MockChat::default());

        let handler = TaskCreateHandler::new(db.clone(), chat.clone());
        let deadline = Utc::now() + chrono::Duration::days(2);
        let result = handler
            .run(
                &json!({
                    "assignee": "太郎",
                    "body": "スライド準備",
                    "deadline": deadline.to_rfc3339(),
                }),
                &envelope(t, user),
                &context(user),
            )
            .await
            .expect("run");
        assert!(result.success);
        assert!(result.user_message.contains("太郎"));

        // Chat-side task created and mirrored to the assignee's user id.
        assert_eq!(chat.tasks.lock().expect("lock").len(), 1);
        let mirrored = db
            .tenant(t)
            .open_tasks_for(taro_user, 10)
            .await
            .expect("mirror");
        assert_eq!(mirrored.len(), 1);
        assert!(mirrored[0].due_at.is_some());
    }

    #[tokio::test]
    async fn create_unknown_person_is_not_found() {
        let db = Arc::new(crate::store::Db::open_in_memory().await.expect("open"));
        let t = seed_tenant(&db, "org-1").await;
        let user = seed_user(&db, t, "acct-1", "Sato", 3).await;
        let chat = Arc::new(MockChat::default());

        let handler = TaskCreateHandler::new(db.clone(), chat);
        let err = handler
            .run(
                &json!({"assignee": "存在しない", "body": "x"}),
                &envelope(t, user),
                &context(user),
            )
            .await
            .expect_err("missing person");
        assert!(matches!(err, HandlerError::NotFound(_)));
    }

    #[tokio::test]
    async fn complete_matches_fragment() {
        let db = Arc::new(crate::store::Db::open_in_memory().await.expect("open"));
        let t = seed_tenant(&db, "org-1").await;
        let user = seed_user(&db, t, "acct-1", "Sato", 3).await;
        seed_task(&db, t, "room-a", user, "スライド準備").await;

        let handler = TaskCompleteHandler::new(db.clone());
        let result = handler
            .run(
                &json!({"task": "スライド"}),
                &envelope(t, user),
                &context(user),
            )
            .await
            .expect("run");
        assert!(result.user_message.contains("完了"));
        assert!(db
            .tenant(t)
            .open_tasks_for(user, 10)
            .await
            .expect("query")
            .is_empty());
    }
}
