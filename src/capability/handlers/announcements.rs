//! Announcement capabilities: create (opens the confirmation flow) and
//! cancel.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::announce::flow::{AnnouncementFlow, AnnouncementRequest};
use crate::brain::memory::MemoryContext;
use crate::capability::{CapabilityHandler, Envelope, HandlerError, HandlerResult};
use crate::store::Db;

fn parse_date(params: &Value, key: &str) -> Option<DateTime<Utc>> {
    params
        .get(key)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Capture an announcement request and open the confirmation flow.
pub struct AnnouncementCreateHandler {
    db: Arc<Db>,
    flow: Arc<AnnouncementFlow>,
}

impl AnnouncementCreateHandler {
    pub fn new(db: Arc<Db>, flow: Arc<AnnouncementFlow>) -> Self {
        Self { db, flow }
    }
}

#[async_trait]
impl CapabilityHandler for AnnouncementCreateHandler {
    async fn run(
        &self,
        params: &Value,
        envelope: &Envelope,
        _context: &MemoryContext,
    ) -> Result<HandlerResult, HandlerError> {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::ParameterInvalid("message".to_owned()))?;

        let request = AnnouncementRequest {
            message: message.to_owned(),
            room_query: params
                .get("room")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            create_tasks: params
                .get("create_tasks")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            task_deadline: parse_date(params, "task_deadline"),
            schedule_at: parse_date(params, "schedule_at"),
            cron_expression: params
                .get("cron")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            requester_account_id: envelope.account_id.clone(),
            source_room_id: envelope.room_id.clone(),
        };

        let tenant = self.db.tenant(envelope.tenant_id);
        self.flow.start(&tenant, request, envelope.now).await
    }
}

/// Cancel the requester's most recent open announcement.
pub struct AnnouncementCancelHandler {
    db: Arc<Db>,
    flow: Arc<AnnouncementFlow>,
}

impl AnnouncementCancelHandler {
    pub fn new(db: Arc<Db>, flow: Arc<AnnouncementFlow>) -> Self {
        Self { db, flow }
    }
}

#[async_trait]
impl CapabilityHandler for AnnouncementCancelHandler {
    async fn run(
        &self,
        _params: &Value,
        envelope: &Envelope,
        _context: &MemoryContext,
    ) -> Result<HandlerResult, HandlerError> {
        let tenant = self.db.tenant(envelope.tenant_id);
        let open = tenant
            .latest_open_announcement(&envelope.account_id)
            .await
            .map_err(|e| HandlerError::UpstreamUnavailable(e.to_string()))?;

        let Some(announcement) = open else {
            return Err(HandlerError::NotFound("open announcement".to_owned()));
        };

        self.flow
            .cancel_by_reference(&tenant, &announcement.id.to_string())
            .await
            .map_err(|e| HandlerError::UpstreamUnavailable(e.to_string()))?;

        let excerpt: String = announcement.message_body.chars().take(40).collect();
        Ok(
            HandlerResult::message(format!("アナウンス「{excerpt}」を取り消しました。"))
                .with_data(json!({"announcement_id": announcement.id.to_string()})),
        )
    }
}
