//! The Brain: seven layers wired into one request pipeline.
//!
//! Data flows strictly ingress → memory → state → understanding →
//! decision → execution → post. Requests are serialized per
//! (tenant, room, user); cross-user concurrency is unrestricted. Every
//! invocation that enters the pipeline writes exactly one decision log
//! row; duplicate webhook deliveries short-circuit before it.

pub mod decision;
pub mod execution;
pub mod ingress;
pub mod memory;
pub mod post;
pub mod state;
pub mod understanding;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{error, info, info_span, warn, Instrument};

use self::decision::{Decision, DecisionEngine, ExecutionPlan};
use self::execution::{ExecutionEngine, ExecutionOutcome, STILL_WORKING};
use self::memory::{MemoryContext, MemoryDeadlines};
use self::post::{PostInputs, PostLayer};
use self::state::{StateEngine, StateOutcome, CANCEL_ACK};
use self::understanding::{Understander, Understanding};
use crate::capability::Envelope;
use crate::config::BrainConfig;
use crate::llm::TokenUsage;
use crate::store::conversation::{ConversationState, StateType, Transition};
use crate::store::decision_log::{DecisionRecord, GuardrailAction};
use crate::store::{Db, TenantDb};
use crate::types::{BrainInput, Classification, ConversationKey, InboundMessage, Reply};

/// Interim reply when a second message queues behind the serial lock.
const ONE_MOMENT: &str = "少々お待ちください。前のメッセージを処理しています。";

/// Conjunction markers splitting a multi-action request.
const CONJUNCTIONS: &[&str] = &["それと、", "それから、", "あと、", "さらに、", " and also "];

/// Everything the Brain needs, wired once at startup.
pub struct BrainDeps {
    pub db: Arc<Db>,
    pub understander: Understander,
    pub decision: DecisionEngine,
    pub execution: ExecutionEngine,
    pub state: StateEngine,
    pub post: PostLayer,
    pub config: BrainConfig,
    /// The bot's own chat account id, for toall mention checks.
    pub bot_account_id: String,
}

/// Per-key serial locks. Entries are created on demand and shared via Arc
/// so waiting tasks queue on the same mutex.
#[derive(Default)]
struct KeyedLocks {
    locks: StdMutex<HashMap<ConversationKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    fn lock_for(&self, key: &ConversationKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.clone()).or_default().clone()
    }
}

/// The orchestration pipeline.
pub struct Brain {
    db: Arc<Db>,
    understander: Understander,
    decision: DecisionEngine,
    execution: ExecutionEngine,
    state: StateEngine,
    post: PostLayer,
    config: BrainConfig,
    bot_account_id: String,
    locks: KeyedLocks,
}

impl Brain {
    /// Assemble the Brain.
    pub fn new(deps: BrainDeps) -> Self {
        Self {
            db: deps.db,
            understander: deps.understander,
            decision: deps.decision,
            execution: deps.execution,
            state: deps.state,
            post: deps.post,
            config: deps.config,
            bot_account_id: deps.bot_account_id,
            locks: KeyedLocks::default(),
        }
    }

    /// Handle one inbound message end to end.
    ///
    /// Returns the reply that was sent, or `None` when the message was a
    /// duplicate delivery or could not be answered at all. Semantic
    /// failures never escape as errors; the webhook adapter answers 200
    /// either way.
    pub async fn handle(&self, message: InboundMessage) -> Option<Reply> {
        let span = info_span!(
            "brain_request",
            tenant_id = %message.tenant_id,
            room_id = %message.room_id,
            message_id = %message.message_id,
        );
        self.handle_inner(message).instrument(span).await
    }

    async fn handle_inner(&self, message: InboundMessage) -> Option<Reply> {
        let tenant = self.db.tenant(message.tenant_id);
        let now = Utc::now();

        // Serial ordering per (tenant, room, sender). The account id is a
        // stable stand-in for the user id before identity resolution.
        let key = ConversationKey::new(
            message.tenant_id,
            &message.room_id,
            uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, message.account_id.as_bytes()),
        );
        let lock = self.locks.lock_for(&key);
        let wait = Duration::from_secs(self.config.serial_lock_wait_secs);
        let _guard = match timeout(wait, lock.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.post
                    .notify(message.tenant_id, &message.room_id, ONE_MOMENT)
                    .await;
                let deadline = Duration::from_secs(self.config.request_deadline_secs);
                match timeout(deadline, lock.lock_owned()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        warn!("serial lock starved past the request deadline");
                        return None;
                    }
                }
            }
        };

        // Duplicate webhook delivery: same message id is a no-op with no
        // decision log row.
        match tenant.mark_message_processed(&message.message_id, now).await {
            Ok(true) => {}
            Ok(false) => {
                info!("duplicate delivery short-circuited");
                return None;
            }
            Err(err) => {
                error!(error = %err, "dedupe check failed");
                return None;
            }
        }

        // Ingress: normalize and resolve, failing closed.
        let input = match ingress::normalize(&tenant, &self.bot_account_id, &message).await {
            Ok(input) => input,
            Err(err) => {
                warn!(code = err.code(), "ingress rejected message");
                let _ = tenant
                    .record_audit(
                        &format!("account:{}", message.account_id),
                        err.code(),
                        "message",
                        Some(&message.message_id),
                        Classification::Internal,
                        now,
                    )
                    .await;
                self.post
                    .notify(message.tenant_id, &message.room_id, ingress::CANNOT_UNDERSTAND)
                    .await;
                return Some(Reply {
                    room_id: message.room_id,
                    text: ingress::CANNOT_UNDERSTAND.to_owned(),
                });
            }
        };

        let deadline = Duration::from_secs(self.config.request_deadline_secs);
        match timeout(deadline, self.pipeline(&tenant, &input)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                error!(error = %err, "pipeline failed");
                let record = self.base_record(&input, "error", None, 0.0);
                let outputs = PostInputs {
                    reply_text: "申し訳ありません、処理中に問題が発生しました。".to_owned(),
                    suggestions: Vec::new(),
                    record: DecisionRecord {
                        success: false,
                        error_code: Some("internal".to_owned()),
                        ..record
                    },
                    audit_action: "pipeline_error".to_owned(),
                    audit_resource_type: "message".to_owned(),
                    audit_resource_id: Some(input.message_id.clone()),
                    classification: Classification::Internal,
                    record_turns: false,
                };
                self.post.finalize(&input, outputs).await.ok()
            }
            Err(_) => {
                warn!("request deadline exceeded");
                let record = self.base_record(&input, "timeout", None, 0.0);
                let outputs = PostInputs {
                    reply_text: STILL_WORKING.to_owned(),
                    suggestions: Vec::new(),
                    record: DecisionRecord {
                        success: false,
                        error_code: Some("timeout".to_owned()),
                        ..record
                    },
                    audit_action: "request_timeout".to_owned(),
                    audit_resource_type: "message".to_owned(),
                    audit_resource_id: Some(input.message_id.clone()),
                    classification: Classification::Internal,
                    record_turns: false,
                };
                self.post.finalize(&input, outputs).await.ok()
            }
        }
    }

    async fn pipeline(
        &self,
        tenant: &TenantDb,
        input: &BrainInput,
    ) -> anyhow::Result<Option<Reply>> {
        let started = Instant::now();
        let now = input.received_at;

        let current_state = tenant
            .current_state(&input.room_id, input.sender.user_id, now)
            .await?;
        let state_outcome = self.state.on_message(tenant, input, &current_state).await?;

        match state_outcome {
            StateOutcome::Cancelled { flow } => {
                let mut record = self.base_record(input, "cancel", None, 1.0);
                record.confirmation_resolution = Some("cancelled".to_owned());
                let outputs = PostInputs {
                    reply_text: CANCEL_ACK.to_owned(),
                    suggestions: Vec::new(),
                    record,
                    audit_action: "state_cancelled".to_owned(),
                    audit_resource_type: "conversation_state".to_owned(),
                    audit_resource_id: Some(flow.as_str().to_owned()),
                    classification: Classification::Internal,
                    record_turns: true,
                };
                Ok(Some(self.post.finalize(input, outputs).await?))
            }
            StateOutcome::Handled(result) => {
                if let Some(delta) = result.state_delta.clone() {
                    self.apply_state_delta(tenant, input, delta).await?;
                }
                let mut record = self.base_record(
                    input,
                    &format!("continuation:{}", current_state.state_type.as_str()),
                    None,
                    1.0,
                );
                record.success = result.success;
                record.timing_ms = json!({"total": elapsed_ms(started)});
                let outputs = PostInputs {
                    reply_text: result.user_message.clone(),
                    suggestions: result.suggestions.clone(),
                    record,
                    audit_action: "flow_continued".to_owned(),
                    audit_resource_type: "conversation_state".to_owned(),
                    audit_resource_id: Some(current_state.state_type.as_str().to_owned()),
                    classification: Classification::Internal,
                    record_turns: true,
                };
                Ok(Some(self.post.finalize(input, outputs).await?))
            }
            StateOutcome::Resume { plan, resolution } => {
                let memory_started = Instant::now();
                let context = self.load_memory(tenant, input).await;
                let timings = json!({
                    "memory": elapsed_ms(memory_started),
                    "total": elapsed_ms(started),
                });
                self.run_plan(
                    tenant,
                    input,
                    &context,
                    plan,
                    None,
                    Some(resolution),
                    timings,
                    started,
                )
                .await
            }
            StateOutcome::Proceed { active } => {
                self.full_pipeline(tenant, input, active, started).await
            }
        }
    }

    async fn full_pipeline(
        &self,
        tenant: &TenantDb,
        input: &BrainInput,
        active: Option<ConversationState>,
        started: Instant,
    ) -> anyhow::Result<Option<Reply>> {
        let now = input.received_at;
        let memory_started = Instant::now();
        let context = self.load_memory(tenant, input).await;
        let memory_ms = elapsed_ms(memory_started);

        let segments = split_conjunctive(&input.text);
        let multi_enabled = tenant
            .feature_enabled_or("multi_action", true)
            .await
            .unwrap_or(true);
        if active.is_none() && multi_enabled && segments.len() > 1 {
            if let Some(reply) = self
                .try_multi_action(tenant, input, &context, &segments, started)
                .await?
            {
                return Ok(Some(reply));
            }
        }

        let understanding_started = Instant::now();
        let understanding = self
            .understander
            .understand(&input.text, &context, active.as_ref())
            .await;
        let understanding_ms = elapsed_ms(understanding_started);

        let decision_started = Instant::now();
        let outcome = self
            .decision
            .decide(
                tenant,
                &input.text,
                &input.room_id,
                &understanding,
                &context,
                active.as_ref().and_then(flow_category),
                now,
            )
            .await?;
        let decision_ms = elapsed_ms(decision_started);

        let timings = json!({
            "memory": memory_ms,
            "understanding": understanding_ms,
            "decision": decision_ms,
        });

        match outcome.decision {
            Decision::Refuse(refusal) => {
                let mut record = self.base_record(
                    input,
                    &understanding.intent,
                    None,
                    understanding.confidence,
                );
                record.success = false;
                record.guardrail_action = outcome.guardrail;
                record.policy_reason = outcome.policy_reason;
                record.error_code = Some(refusal.policy_code.to_owned());
                record.tokens_in = understanding.usage.input_tokens;
                record.tokens_out = understanding.usage.output_tokens;
                record.model_id = understanding.model_id.clone();
                record.warnings = context.warnings.iter().map(|w| (*w).to_owned()).collect();
                record.timing_ms = timings;
                let outputs = PostInputs {
                    reply_text: refusal.user_message,
                    suggestions: Vec::new(),
                    record,
                    audit_action: "request_refused".to_owned(),
                    audit_resource_type: "capability".to_owned(),
                    audit_resource_id: Some(understanding.intent.clone()),
                    classification: Classification::Internal,
                    record_turns: true,
                };
                Ok(Some(self.post.finalize(input, outputs).await?))
            }
            Decision::Confirm(request) => {
                tenant
                    .transition_state(
                        &input.room_id,
                        input.sender.user_id,
                        Transition {
                            state_type: StateType::Confirmation,
                            step: "await_answer".to_owned(),
                            data: json!({
                                "plan": request.pending_plan,
                                "question": request.question,
                                "options": request.options,
                            }),
                            reference: None,
                            timeout_minutes: self.config.state_timeout_minutes,
                        },
                        now,
                    )
                    .await?;

                let mut reply_text = request.question.clone();
                for (index, option) in request.options.iter().enumerate() {
                    reply_text.push_str(&format!("\n{}. {option}", index.saturating_add(1)));
                }

                let mut record = self.base_record(
                    input,
                    &understanding.intent,
                    Some(request.pending_plan.capability_key.clone()),
                    understanding.confidence,
                );
                record.guardrail_action = outcome.guardrail;
                record.policy_reason = outcome.policy_reason;
                record.confirmation_needed = true;
                record.confirmation_question = Some(request.question.clone());
                record.tokens_in = understanding.usage.input_tokens;
                record.tokens_out = understanding.usage.output_tokens;
                record.model_id = understanding.model_id.clone();
                record.warnings = context.warnings.iter().map(|w| (*w).to_owned()).collect();
                record.timing_ms = timings;
                let outputs = PostInputs {
                    reply_text,
                    suggestions: Vec::new(),
                    record,
                    audit_action: "confirmation_requested".to_owned(),
                    audit_resource_type: "capability".to_owned(),
                    audit_resource_id: Some(request.pending_plan.capability_key.clone()),
                    classification: Classification::Internal,
                    record_turns: true,
                };
                Ok(Some(self.post.finalize(input, outputs).await?))
            }
            Decision::Execute(plan) => {
                self.run_plan(
                    tenant,
                    input,
                    &context,
                    plan,
                    Some(&understanding),
                    None,
                    timings,
                    started,
                )
                .await
            }
        }
    }

    /// Execute a plan and finalize. `resolution` is set when a
    /// confirmation released the plan.
    #[allow(clippy::too_many_arguments)]
    async fn run_plan(
        &self,
        tenant: &TenantDb,
        input: &BrainInput,
        context: &MemoryContext,
        plan: ExecutionPlan,
        understanding: Option<&Understanding>,
        resolution: Option<String>,
        mut timings: Value,
        _started: Instant,
    ) -> anyhow::Result<Option<Reply>> {
        let now = input.received_at;
        let envelope = self.envelope(input);
        let execution_started = Instant::now();
        let outcome = self.execution.execute(tenant, &plan, &envelope, context).await;
        timings["execution"] = json!(elapsed_ms(execution_started));

        let usage = understanding.map(|u| u.usage).unwrap_or(TokenUsage::default());
        let intent = understanding
            .map(|u| u.intent.clone())
            .unwrap_or_else(|| plan.capability_key.clone());
        let model_id = understanding.and_then(|u| u.model_id.clone());

        match outcome {
            ExecutionOutcome::NeedParameters {
                plan,
                missing,
                question,
            } => {
                tenant
                    .transition_state(
                        &input.room_id,
                        input.sender.user_id,
                        Transition {
                            state_type: StateType::TaskPending,
                            step: format!("await_{}", missing[0]),
                            data: json!({"plan": plan, "missing": missing}),
                            reference: None,
                            timeout_minutes: self.config.state_timeout_minutes,
                        },
                        now,
                    )
                    .await?;

                let mut record =
                    self.base_record(input, &intent, Some(plan.capability_key.clone()), plan.confidence);
                record.confirmation_needed = true;
                record.confirmation_question = Some(question.clone());
                record.parameter_confidence = 0.0;
                record.tokens_in = usage.input_tokens;
                record.tokens_out = usage.output_tokens;
                record.model_id = model_id;
                record.warnings = context.warnings.iter().map(|w| (*w).to_owned()).collect();
                record.timing_ms = timings;
                let outputs = PostInputs {
                    reply_text: question,
                    suggestions: Vec::new(),
                    record,
                    audit_action: "parameter_requested".to_owned(),
                    audit_resource_type: "capability".to_owned(),
                    audit_resource_id: Some(plan.capability_key.clone()),
                    classification: Classification::Internal,
                    record_turns: true,
                };
                Ok(Some(self.post.finalize(input, outputs).await?))
            }
            ExecutionOutcome::Completed(result) => {
                if let Some(delta) = result.state_delta.clone() {
                    self.apply_state_delta(tenant, input, delta).await?;
                }

                let error_code = result
                    .data
                    .get("error_code")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
                let mut record = self.base_record(
                    input,
                    &intent,
                    Some(plan.capability_key.clone()),
                    plan.confidence,
                );
                record.success = result.success;
                record.error_code = error_code;
                record.parameters = scrub_parameters(&plan.parameters);
                record.confirmation_resolution = resolution;
                record.tokens_in = usage.input_tokens;
                record.tokens_out = usage.output_tokens;
                record.model_id = model_id;
                record.warnings = context.warnings.iter().map(|w| (*w).to_owned()).collect();
                record.timing_ms = timings;

                let outputs = PostInputs {
                    reply_text: result.user_message.clone(),
                    suggestions: result.suggestions.clone(),
                    record,
                    audit_action: if result.success {
                        "capability_executed".to_owned()
                    } else {
                        "capability_failed".to_owned()
                    },
                    audit_resource_type: "capability".to_owned(),
                    audit_resource_id: Some(plan.capability_key.clone()),
                    classification: Classification::Internal,
                    record_turns: true,
                };
                Ok(Some(self.post.finalize(input, outputs).await?))
            }
        }
    }

    /// "create a task and also search my tasks": run per-segment plans
    /// sequentially under a multi-action state. Falls back to the single
    /// path (returning `None`) unless at least two segments yield
    /// directly executable plans.
    async fn try_multi_action(
        &self,
        tenant: &TenantDb,
        input: &BrainInput,
        context: &MemoryContext,
        segments: &[String],
        started: Instant,
    ) -> anyhow::Result<Option<Reply>> {
        let now = input.received_at;
        let mut plans = Vec::new();
        for segment in segments.iter().take(3) {
            let understanding = self.understander.understand(segment, context, None).await;
            let outcome = self
                .decision
                .decide(
                    tenant,
                    segment,
                    &input.room_id,
                    &understanding,
                    context,
                    Some("multi"),
                    now,
                )
                .await?;
            match outcome.decision {
                Decision::Execute(plan) => plans.push(plan),
                _ => break,
            }
        }
        if plans.len() < 2 {
            return Ok(None);
        }

        let envelope = self.envelope(input);
        let mut replies = Vec::new();
        let mut all_succeeded = true;
        let executed_keys: Vec<String> =
            plans.iter().map(|plan| plan.capability_key.clone()).collect();

        let mut remaining = plans.clone();
        while !remaining.is_empty() {
            let plan = remaining.remove(0);
            let outcome = self.execution.execute(tenant, &plan, &envelope, context).await;
            match outcome {
                ExecutionOutcome::Completed(result) if result.success => {
                    replies.push(result.user_message);
                }
                ExecutionOutcome::Completed(result) => {
                    // First failure: skip the rest and ask how to proceed.
                    all_succeeded = false;
                    replies.push(result.user_message);
                    if !remaining.is_empty() {
                        tenant
                            .transition_state(
                                &input.room_id,
                                input.sender.user_id,
                                Transition {
                                    state_type: StateType::MultiAction,
                                    step: "await_continue".to_owned(),
                                    data: json!({"pending": remaining}),
                                    reference: None,
                                    timeout_minutes: self.config.state_timeout_minutes,
                                },
                                now,
                            )
                            .await?;
                        replies.push(
                            "残りの操作は保留しています。続ける場合は「はい」とお答えください。"
                                .to_owned(),
                        );
                    }
                    break;
                }
                ExecutionOutcome::NeedParameters { question, .. } => {
                    all_succeeded = false;
                    replies.push(question);
                    break;
                }
            }
        }

        let mut record = self.base_record(input, "multi_action", Some("multi_action".to_owned()), 0.8);
        record.success = all_succeeded;
        record.parameters = json!({"actions": executed_keys});
        record.timing_ms = json!({"total": elapsed_ms(started)});
        record.warnings = context.warnings.iter().map(|w| (*w).to_owned()).collect();
        let outputs = PostInputs {
            reply_text: replies.join("\n"),
            suggestions: Vec::new(),
            record,
            audit_action: "multi_action_executed".to_owned(),
            audit_resource_type: "capability".to_owned(),
            audit_resource_id: Some("multi_action".to_owned()),
            classification: Classification::Internal,
            record_turns: true,
        };
        Ok(Some(self.post.finalize(input, outputs).await?))
    }

    async fn load_memory(&self, tenant: &TenantDb, input: &BrainInput) -> MemoryContext {
        memory::load(
            tenant,
            &input.sender,
            &input.room_id,
            &input.text,
            MemoryDeadlines {
                per_fetch: Duration::from_secs(self.config.memory_fetch_deadline_secs),
                aggregate: Duration::from_secs(self.config.memory_aggregate_deadline_secs),
            },
        )
        .await
    }

    async fn apply_state_delta(
        &self,
        tenant: &TenantDb,
        input: &BrainInput,
        delta: crate::capability::StateDelta,
    ) -> anyhow::Result<()> {
        match delta {
            crate::capability::StateDelta::Transition(transition) => {
                tenant
                    .transition_state(
                        &input.room_id,
                        input.sender.user_id,
                        transition,
                        input.received_at,
                    )
                    .await?;
            }
            crate::capability::StateDelta::Clear => {
                tenant.clear_state(&input.room_id, input.sender.user_id).await?;
            }
        }
        Ok(())
    }

    fn envelope(&self, input: &BrainInput) -> Envelope {
        Envelope {
            tenant_id: input.tenant_id,
            room_id: input.room_id.clone(),
            user_id: input.sender.user_id,
            account_id: input.sender.account_id.clone(),
            sender_name: input.sender.display_name.clone(),
            now: input.received_at,
        }
    }

    fn base_record(
        &self,
        input: &BrainInput,
        intent: &str,
        capability: Option<String>,
        confidence: f64,
    ) -> DecisionRecord {
        DecisionRecord {
            user_id: input.sender.user_id,
            room_id: input.room_id.clone(),
            message_excerpt: DecisionRecord::excerpt(&input.text),
            intent: intent.to_owned(),
            capability,
            parameters: json!({}),
            confidence,
            intent_confidence: confidence,
            parameter_confidence: 1.0,
            guardrail_action: GuardrailAction::None,
            policy_reason: None,
            success: true,
            error_code: None,
            tokens_in: 0,
            tokens_out: 0,
            model_id: None,
            timing_ms: json!({}),
            confirmation_needed: false,
            confirmation_question: None,
            confirmation_resolution: None,
            warnings: Vec::new(),
        }
    }
}

/// Capability category hinted by an active flow, feeding the continuity
/// term of decision scoring.
fn flow_category(state: &ConversationState) -> Option<&'static str> {
    match state.state_type {
        StateType::GoalSetting => Some("goals"),
        StateType::Announcement => Some("announcements"),
        StateType::TaskPending => Some("tasks"),
        StateType::Confirmation | StateType::MultiAction | StateType::Normal => None,
    }
}

fn elapsed_ms(from: Instant) -> u64 {
    u64::try_from(from.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Drop values that look like free text from the logged parameters; keys
/// and short scalar values are enough for forensics.
fn scrub_parameters(parameters: &Value) -> Value {
    match parameters.as_object() {
        None => json!({}),
        Some(map) => {
            let scrubbed: serde_json::Map<String, Value> = map
                .iter()
                .map(|(key, value)| {
                    let kept = match value {
                        Value::String(text) if text.chars().count() > 40 => {
                            json!(format!("<{} chars>", text.chars().count()))
                        }
                        other => other.clone(),
                    };
                    (key.clone(), kept)
                })
                .collect();
            Value::Object(scrubbed)
        }
    }
}

/// Split a request into conjunctive segments; returns the whole text as a
/// single segment when no marker splits it meaningfully.
fn split_conjunctive(text: &str) -> Vec<String> {
    for marker in CONJUNCTIONS {
        if let Some(index) = text.find(marker) {
            let head = text[..index].trim();
            let tail = text[index.saturating_add(marker.len())..].trim();
            if head.chars().count() >= 4 && tail.chars().count() >= 4 {
                let mut segments = vec![head.to_owned()];
                segments.extend(split_conjunctive(tail));
                return segments;
            }
        }
    }
    vec![text.trim().to_owned()]
}
