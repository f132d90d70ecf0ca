//! Shared fixtures for the end-to-end scenarios: a Brain wired over
//! in-memory SQLite, a recording chat double, and a scriptable LLM.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use kokoro::announce::flow::AnnouncementFlow;
use kokoro::brain::decision::DecisionEngine;
use kokoro::brain::execution::ExecutionEngine;
use kokoro::brain::post::PostLayer;
use kokoro::brain::state::StateEngine;
use kokoro::brain::understanding::Understander;
use kokoro::brain::{Brain, BrainDeps};
use kokoro::capability::handlers::{build_registry, HandlerDeps};
use kokoro::capability::CapabilityRegistry;
use kokoro::chat::{ChatError, ChatMessaging, ChatTaskOps, RoomMember};
use kokoro::config::BrainConfig;
use kokoro::knowledge::SqliteKnowledge;
use kokoro::llm::{LlmError, LlmPort, LlmRequest, LlmResponse, TokenUsage};
use kokoro::store::admin::AdminConfigCache;
use kokoro::store::{fmt_ts, Db};
use kokoro::tracker::TaskTracker;
use kokoro::types::InboundMessage;

/// The bot's chat account id used across scenarios.
pub const BOT_ACCOUNT: &str = "999";

/// Chat double recording sends and task creations.
#[derive(Default)]
pub struct RecordingChat {
    pub sent: Mutex<Vec<(String, String)>>,
    pub tasks: Mutex<Vec<(String, Vec<String>, Option<DateTime<Utc>>)>>,
    pub send_calls: AtomicUsize,
}

impl RecordingChat {
    pub fn sent_count(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn last_sent(&self) -> Option<(String, String)> {
        self.sent.lock().expect("lock").last().cloned()
    }
}

#[async_trait]
impl ChatMessaging for RecordingChat {
    async fn send_message(
        &self,
        _tenant_id: Uuid,
        room_id: &str,
        text: &str,
    ) -> Result<String, ChatError> {
        let n = self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.sent
            .lock()
            .expect("lock")
            .push((room_id.to_owned(), text.to_owned()));
        Ok(format!("sent-{n}"))
    }
}

#[async_trait]
impl ChatTaskOps for RecordingChat {
    async fn create_task(
        &self,
        _tenant_id: Uuid,
        room_id: &str,
        _body: &str,
        assignee_account_ids: &[String],
        due_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, ChatError> {
        self.tasks.lock().expect("lock").push((
            room_id.to_owned(),
            assignee_account_ids.to_vec(),
            due_at,
        ));
        Ok(assignee_account_ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("ct-{i}"))
            .collect())
    }

    async fn room_members(
        &self,
        _tenant_id: Uuid,
        _room_id: &str,
    ) -> Result<Vec<RoomMember>, ChatError> {
        Ok(vec![
            RoomMember {
                account_id: "m1".to_owned(),
                name: "メンバー1".to_owned(),
            },
            RoomMember {
                account_id: "m2".to_owned(),
                name: "メンバー2".to_owned(),
            },
        ])
    }
}

type LlmFn = dyn Fn(&LlmRequest) -> Result<LlmResponse, LlmError> + Send + Sync;

/// Scriptable LLM: a closure inspects each request.
pub struct FnLlm(Box<LlmFn>);

impl FnLlm {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&LlmRequest) -> Result<LlmResponse, LlmError> + Send + Sync + 'static,
    {
        Self(Box::new(f))
    }

    /// An LLM that rejects every call (non-retryable, so tests stay fast).
    pub fn down() -> Self {
        Self::new(|_| Err(LlmError::Rejected(500)))
    }

    /// Routes understanding requests by returning the given intent JSON
    /// when the message line contains the needle; every other request
    /// echoes a plain line.
    pub fn routing(rules: Vec<(&'static str, String)>) -> Self {
        Self::new(move |request| {
            if request.json_mode {
                // Match against the message itself, not the rendered
                // context (which carries earlier turns).
                let message_line = request
                    .prompt
                    .rsplit("Message: ")
                    .next()
                    .unwrap_or(&request.prompt);
                for (needle, response) in &rules {
                    if message_line.contains(needle) {
                        return Ok(text_response(response));
                    }
                }
                return Ok(text_response(
                    r#"{"intent": "unknown", "entities": {}, "confidence": 0.2, "reasoning": "no rule"}"#,
                ));
            }
            // Announcement rewrites echo the original wording so message
            // bodies stay assertable.
            if let Some(rest) = request.prompt.split("文面: ").nth(1) {
                let body = rest.lines().next().unwrap_or(rest);
                return Ok(text_response(body));
            }
            Ok(text_response("了解しました。"))
        })
    }
}

pub fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        text: text.to_owned(),
        model_id: "mock-primary".to_owned(),
        usage: TokenUsage {
            input_tokens: 120,
            output_tokens: 40,
        },
    }
}

#[async_trait]
impl LlmPort for FnLlm {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        (self.0)(&request)
    }
}

/// A fully wired Brain over in-memory storage.
pub struct Fixture {
    pub db: Arc<Db>,
    pub brain: Arc<Brain>,
    pub chat: Arc<RecordingChat>,
    pub tracker: Arc<TaskTracker>,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
}

impl Fixture {
    pub async fn new(llm: Arc<dyn LlmPort>) -> Self {
        let db = Arc::new(Db::open_in_memory().await.expect("open db"));
        let tenant_id = seed_tenant(&db, "org-1").await;
        let user_id = seed_user(&db, tenant_id, "acct-1", "佐藤", 3).await;
        seed_room(&db, tenant_id, "r-train", "研修チャット").await;
        seed_room(&db, tenant_id, "r-sales", "営業部").await;

        let chat = Arc::new(RecordingChat::default());
        let tracker = Arc::new(TaskTracker::new());
        let registry = Arc::new(CapabilityRegistry::with_defaults());
        let announce = Arc::new(AnnouncementFlow::new(
            llm.clone(),
            Arc::new(AdminConfigCache::new()),
            0.8,
            30,
        ));
        let handlers = Arc::new(build_registry(&HandlerDeps {
            db: db.clone(),
            chat_tasks: chat.clone(),
            knowledge: Arc::new(SqliteKnowledge::new(&db)),
            llm: llm.clone(),
            announce: announce.clone(),
        }));
        registry.validate(&handlers).expect("registry invariants");

        let brain = Arc::new(Brain::new(BrainDeps {
            db: db.clone(),
            understander: Understander::new(registry.clone(), llm.clone()),
            decision: DecisionEngine::new(registry.clone(), 0.7, 100_000.0),
            execution: ExecutionEngine::new(
                registry.clone(),
                handlers,
                Duration::from_secs(10),
            ),
            state: StateEngine::new(announce.clone(), registry.clone(), 30),
            post: PostLayer::new(db.clone(), chat.clone(), llm.clone(), tracker.clone()),
            config: BrainConfig::default(),
            bot_account_id: BOT_ACCOUNT.to_owned(),
        }));

        Self {
            db,
            brain,
            chat,
            tracker,
            tenant_id,
            user_id,
        }
    }

    /// An inbound message mentioning the bot.
    pub fn message(&self, id: &str, room: &str, text: &str) -> InboundMessage {
        InboundMessage {
            message_id: id.to_owned(),
            tenant_id: self.tenant_id,
            room_id: room.to_owned(),
            account_id: "acct-1".to_owned(),
            sender_name: "佐藤".to_owned(),
            body: format!("[To:{BOT_ACCOUNT}] {text}"),
            sent_at: Utc::now(),
        }
    }

    /// Settle background work so assertions observe everything.
    pub async fn settle(&self) {
        self.tracker.drain().await;
        self.db.flush_writes().await.expect("flush");
    }

    pub async fn decision_count(&self) -> u64 {
        self.db
            .tenant(self.tenant_id)
            .decision_count()
            .await
            .expect("count")
    }
}

pub async fn seed_tenant(db: &Db, org_key: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO tenants (id, org_key, name, webhook_secret, timezone) \
         VALUES (?1, ?2, 'Acme KK', 'secret-1', 'Asia/Tokyo')",
    )
    .bind(id.to_string())
    .bind(org_key)
    .execute(db.pool())
    .await
    .expect("seed tenant");
    id
}

pub async fn seed_user(db: &Db, tenant_id: Uuid, account_id: &str, name: &str, role: i64) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO users (tenant_id, id, account_id, display_name, role_level) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(tenant_id.to_string())
    .bind(id.to_string())
    .bind(account_id)
    .bind(name)
    .bind(role)
    .execute(db.pool())
    .await
    .expect("seed user");
    id
}

pub async fn seed_room(db: &Db, tenant_id: Uuid, room_id: &str, name: &str) {
    sqlx::query("INSERT INTO rooms (tenant_id, room_id, name, is_active) VALUES (?1, ?2, ?3, 1)")
        .bind(tenant_id.to_string())
        .bind(room_id)
        .bind(name)
        .execute(db.pool())
        .await
        .expect("seed room");
}

pub async fn seed_task(db: &Db, tenant_id: Uuid, room_id: &str, assignee: Uuid, body: &str) {
    sqlx::query(
        "INSERT INTO tasks (tenant_id, id, room_id, assignee_user_id, body, status, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6)",
    )
    .bind(tenant_id.to_string())
    .bind(Uuid::new_v4().to_string())
    .bind(room_id)
    .bind(assignee.to_string())
    .bind(body)
    .bind(fmt_ts(Utc::now()))
    .execute(db.pool())
    .await
    .expect("seed task");
}

pub async fn seed_person(db: &Db, tenant_id: Uuid, name: &str, account_id: Option<&str>) {
    sqlx::query("INSERT INTO persons (tenant_id, id, name, account_id) VALUES (?1, ?2, ?3, ?4)")
        .bind(tenant_id.to_string())
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(account_id)
        .execute(db.pool())
        .await
        .expect("seed person");
}
