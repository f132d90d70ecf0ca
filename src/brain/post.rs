//! Post layer: persistence, observability, and the reply.
//!
//! Every completed invocation lands here exactly once: the turn pair is
//! appended, the decision log row is written, an audit entry is queued,
//! latency-tolerant work (summary regeneration, preference learning) goes
//! to the supervised tracker, and the reply is sent through the chat
//! adapter. Handlers never send; this is the only outbound message path
//! for the request pipeline.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::chat::ChatMessaging;
use crate::llm::{complete_with_retry, LlmPort, LlmRequest, ModelTier};
use crate::store::decision_log::DecisionRecord;
use crate::store::{Db, StoreError};
use crate::tracker::TaskTracker;
use crate::types::{BrainInput, Classification, Reply};

/// Buffered turns beyond which the rolling summary regenerates.
const SUMMARY_TRIGGER: u32 = 10;

/// Turns folded into one summarization pass.
const SUMMARY_WINDOW: u32 = 30;

/// Preference signals: (needle in the user message, key, value).
const PREFERENCE_SIGNALS: &[(&str, &str, &str)] = &[
    ("簡潔に", "tone", "brief"),
    ("短く", "tone", "brief"),
    ("詳しく", "tone", "detailed"),
    ("敬語", "register", "formal"),
    ("タメ口", "register", "casual"),
    ("英語で", "language", "en"),
];

/// Everything the Post layer records for one invocation.
pub struct PostInputs {
    pub reply_text: String,
    pub suggestions: Vec<String>,
    pub record: DecisionRecord,
    /// Audit action name, e.g. `capability_executed` or `state_cancelled`.
    pub audit_action: String,
    pub audit_resource_type: String,
    pub audit_resource_id: Option<String>,
    pub classification: Classification,
    /// Suppress the user/assistant turn append (e.g. interim notices).
    pub record_turns: bool,
}

/// The Post layer.
pub struct PostLayer {
    db: Arc<Db>,
    messaging: Arc<dyn ChatMessaging>,
    llm: Arc<dyn LlmPort>,
    tracker: Arc<TaskTracker>,
}

impl PostLayer {
    /// Create the layer.
    pub fn new(
        db: Arc<Db>,
        messaging: Arc<dyn ChatMessaging>,
        llm: Arc<dyn LlmPort>,
        tracker: Arc<TaskTracker>,
    ) -> Self {
        Self {
            db,
            messaging,
            llm,
            tracker,
        }
    }

    /// Persist, audit, and reply. Returns the reply that was sent.
    ///
    /// # Errors
    ///
    /// Returns an error only when the decision log cannot be written —
    /// that row is the one non-negotiable artifact of an invocation.
    pub async fn finalize(
        &self,
        input: &BrainInput,
        outputs: PostInputs,
    ) -> Result<Reply, StoreError> {
        let tenant = self.db.tenant(input.tenant_id);
        let now = Utc::now();

        // Decision log first: exactly one row per invocation, even when
        // later steps degrade.
        tenant.record_decision(&outputs.record, now).await?;

        if let Err(err) = tenant
            .record_audit(
                &format!("user:{}", input.sender.account_id),
                &outputs.audit_action,
                &outputs.audit_resource_type,
                outputs.audit_resource_id.as_deref(),
                outputs.classification,
                now,
            )
            .await
        {
            warn!(error = %err, "audit queue unavailable");
        }

        let mut reply_text = outputs.reply_text;
        if !outputs.suggestions.is_empty() {
            reply_text.push_str("\n\n");
            for suggestion in outputs.suggestions.iter().take(3) {
                reply_text.push_str(&format!("💡 {suggestion}\n"));
            }
            reply_text = reply_text.trim_end().to_owned();
        }

        if outputs.record_turns {
            let _ = tenant
                .append_turn(&input.room_id, input.sender.user_id, "user", &input.text, now)
                .await;
            let _ = tenant
                .append_turn(
                    &input.room_id,
                    input.sender.user_id,
                    "assistant",
                    &reply_text,
                    now,
                )
                .await;
            self.maybe_regenerate_summary(input);
            self.maybe_learn_preferences(input);
        }

        if let Err(err) = self
            .messaging
            .send_message(input.tenant_id, &input.room_id, &reply_text)
            .await
        {
            warn!(error = %err, "reply delivery failed");
        }

        Ok(Reply {
            room_id: input.room_id.clone(),
            text: reply_text,
        })
    }

    /// Send an interim notice ("one moment", "cannot understand") without
    /// touching the decision log or the turn history.
    pub async fn notify(&self, tenant_id: Uuid, room_id: &str, text: &str) {
        if let Err(err) = self.messaging.send_message(tenant_id, room_id, text).await {
            warn!(error = %err, "notice delivery failed");
        }
    }

    /// Schedule summary regeneration when the buffer is deep enough.
    fn maybe_regenerate_summary(&self, input: &BrainInput) {
        let db = self.db.clone();
        let llm = self.llm.clone();
        let tenant_id = input.tenant_id;
        let room_id = input.room_id.clone();
        let user_id = input.sender.user_id;

        self.tracker.spawn("summary_regeneration", async move {
            let tenant = db.tenant(tenant_id);
            let buffered = tenant.buffered_turn_count(&room_id, user_id).await?;
            if buffered <= SUMMARY_TRIGGER {
                return Ok(());
            }
            regenerate_summary(&tenant, llm.as_ref(), &room_id, user_id).await
        });
    }

    /// Detect explicit feedback and fold it into preferences.
    fn maybe_learn_preferences(&self, input: &BrainInput) {
        let matched: Vec<(&str, &str)> = PREFERENCE_SIGNALS
            .iter()
            .filter(|(needle, _, _)| input.text.contains(needle))
            .map(|(_, key, value)| (*key, *value))
            .collect();
        if matched.is_empty() {
            return;
        }

        let db = self.db.clone();
        let tenant_id = input.tenant_id;
        let user_id = input.sender.user_id;
        self.tracker.spawn("preference_learning", async move {
            let tenant = db.tenant(tenant_id);
            let mut preferences = tenant
                .preferences_for(user_id)
                .await?
                .unwrap_or_else(|| json!({}));
            if !preferences.is_object() {
                preferences = json!({});
            }
            for (key, value) in matched {
                preferences[key] = json!(value);
            }
            tenant.save_preferences(user_id, preferences, Utc::now()).await?;
            Ok(())
        });
    }
}

async fn regenerate_summary(
    tenant: &crate::store::TenantDb,
    llm: &dyn LlmPort,
    room_id: &str,
    user_id: Uuid,
) -> anyhow::Result<()> {
    let turns = tenant.recent_turns(room_id, user_id, SUMMARY_WINDOW).await?;
    let previous = tenant.rolling_summary(room_id, user_id).await?;
    let transcript = turns
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.content))
        .collect::<Vec<_>>()
        .join("\n");

    let request = LlmRequest {
        tier: ModelTier::Fast,
        system: "会話ログを3文以内の日本語で要約してください。既存の要約があれば統合します。"
            .to_owned(),
        prompt: format!(
            "既存の要約: {}\nログ:\n{transcript}",
            previous.as_deref().unwrap_or("（なし）")
        ),
        max_tokens: 300,
        json_mode: false,
    };
    let summary = complete_with_retry(llm, request).await?.text;
    let covered = tenant.total_turn_count(room_id, user_id).await?;
    tenant
        .save_summary(room_id, user_id, summary.trim(), covered, Utc::now())
        .await?;
    Ok(())
}
