//! State layer: cancel detection and multi-step flow continuations.
//!
//! When the conversation key has an active state, the incoming message is
//! consumed here: cancel keywords clear immediately (bypassing
//! Understanding), a confirmation state interprets the message as a
//! yes/no/choice against the stored plan, and flow states advance their
//! own steps. A message that does not fit the expected answer shape is
//! not swallowed as a literal slot value: it deflects into the full
//! pipeline carrying the active state, so Understanding can resolve
//! pronouns against the flow's scratch data.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use super::decision::ExecutionPlan;
use super::understanding::score_keywords;
use crate::announce::flow::AnnouncementFlow;
use crate::capability::{CapabilityRegistry, HandlerResult};
use crate::store::conversation::{ClearReason, ConversationState, StateType, Transition};
use crate::store::{StoreError, TenantDb};
use crate::types::BrainInput;

/// Closed set of cancel keywords (locale synonyms for cancel/stop/quit).
pub const CANCEL_KEYWORDS: &[&str] = &[
    "キャンセル",
    "やめる",
    "やめて",
    "やめます",
    "中止",
    "取り消し",
    "取消",
    "やっぱりいい",
    "cancel",
    "stop",
    "quit",
    "never mind",
    "nevermind",
];

/// Canonical acknowledgement for a cancelled flow.
pub const CANCEL_ACK: &str = "わかりました。いったん中止しますね。";

/// Affirmative answers in confirmation mode.
const YES_TOKENS: &[&str] = &[
    "はい", "ok", "おけ", "オッケー", "了解", "お願いします", "進めて", "yes", "y",
];

/// Negative answers in confirmation mode.
const NO_TOKENS: &[&str] = &["いいえ", "no", "n", "だめ", "なし"];

/// Raw keyword score above which an in-flow message reads as a new
/// request rather than an answer to the pending step.
const DEFLECT_SCORE: f64 = 0.55;

/// State layer errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Store failure.
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    /// Stored flow data did not match its expected shape.
    #[error("corrupt flow data for {state:?}: {detail}")]
    CorruptFlow { state: StateType, detail: String },
}

/// What the state layer decided about the message.
#[derive(Debug)]
pub enum StateOutcome {
    /// Run the full pipeline. `active` carries the flow the message
    /// deflected out of (preserved in the store), so Understanding can
    /// resolve references against its scratch data; `None` when no flow
    /// was active.
    Proceed {
        active: Option<ConversationState>,
    },
    /// Cancel keyword consumed; state cleared.
    Cancelled { flow: StateType },
    /// The continuation consumed the message and produced a reply.
    Handled(HandlerResult),
    /// A stored plan was released (confirmation accepted or parameters
    /// completed); Execution runs it directly.
    Resume {
        plan: ExecutionPlan,
        resolution: String,
    },
}

/// Does the trimmed message match a cancel keyword?
pub fn is_cancel(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    let short = lowered.chars().count() <= 12;
    CANCEL_KEYWORDS
        .iter()
        .any(|keyword| lowered == *keyword || (short && lowered.contains(keyword)))
}

fn is_yes(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    YES_TOKENS
        .iter()
        .any(|token| lowered == *token || lowered.starts_with(token))
}

fn is_no(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    NO_TOKENS.iter().any(|token| lowered == *token)
}

/// The state engine. Continuations for the announcement flow delegate to
/// the announcement subsystem, which shares this layer's state rows.
pub struct StateEngine {
    announce: Arc<AnnouncementFlow>,
    registry: Arc<CapabilityRegistry>,
    timeout_minutes: i64,
}

impl StateEngine {
    /// Create the engine.
    pub fn new(
        announce: Arc<AnnouncementFlow>,
        registry: Arc<CapabilityRegistry>,
        timeout_minutes: i64,
    ) -> Self {
        Self {
            announce,
            registry,
            timeout_minutes,
        }
    }

    /// Does the message carry a clear capability signal of its own? Such
    /// messages deflect out of the flow instead of being consumed as a
    /// literal answer.
    fn is_new_request(&self, input: &BrainInput) -> bool {
        score_keywords(&self.registry, input.sender.role_level, &input.text)
            .first()
            .is_some_and(|top| top.score >= DEFLECT_SCORE)
    }

    fn deflect(&self, input: &BrainInput, state: &ConversationState) -> StateOutcome {
        debug!(
            flow = state.state_type.as_str(),
            step = %state.step,
            message_id = %input.message_id,
            "in-flow message deflected to the full pipeline"
        );
        StateOutcome::Proceed {
            active: Some(state.clone()),
        }
    }

    /// Route a message that landed on the given (already expiry-checked)
    /// state.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure; corrupt flow data clears the
    /// state and surfaces as an error outcome upstream.
    pub async fn on_message(
        &self,
        db: &TenantDb,
        input: &BrainInput,
        state: &ConversationState,
    ) -> Result<StateOutcome, StateError> {
        if !state.is_active() {
            return Ok(StateOutcome::Proceed { active: None });
        }

        if is_cancel(&input.text) {
            self.cancel_flow(db, input, state).await?;
            return Ok(StateOutcome::Cancelled {
                flow: state.state_type,
            });
        }

        match state.state_type {
            StateType::Normal => Ok(StateOutcome::Proceed { active: None }),
            StateType::Confirmation => self.continue_confirmation(db, input, state).await,
            StateType::GoalSetting => self.continue_goal_setting(db, input, state).await,
            StateType::TaskPending => self.continue_task_pending(db, input, state).await,
            StateType::MultiAction => self.continue_multi_action(db, input, state).await,
            StateType::Announcement => {
                let result = self.announce.continue_flow(db, input, state).await?;
                Ok(StateOutcome::Handled(result))
            }
        }
    }

    async fn cancel_flow(
        &self,
        db: &TenantDb,
        input: &BrainInput,
        state: &ConversationState,
    ) -> Result<(), StateError> {
        // Announcement flows own an external row that must not stay pending.
        if state.reference_type.as_deref() == Some("announcement") {
            if let Some(reference_id) = &state.reference_id {
                self.announce.cancel_by_reference(db, reference_id).await?;
            }
        }
        db.clear_state(&input.room_id, input.sender.user_id).await?;
        info!(
            flow = state.state_type.as_str(),
            reason = ClearReason::UserCancel.as_str(),
            "flow cancelled by user"
        );
        Ok(())
    }

    async fn continue_confirmation(
        &self,
        db: &TenantDb,
        input: &BrainInput,
        state: &ConversationState,
    ) -> Result<StateOutcome, StateError> {
        let plan: ExecutionPlan = match state
            .data
            .get("plan")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
        {
            Some(plan) => plan,
            None => {
                db.clear_state(&input.room_id, input.sender.user_id).await?;
                return Err(StateError::CorruptFlow {
                    state: StateType::Confirmation,
                    detail: "missing pending plan".to_owned(),
                });
            }
        };

        if is_yes(&input.text) {
            db.clear_state(&input.room_id, input.sender.user_id).await?;
            return Ok(StateOutcome::Resume {
                plan,
                resolution: "yes".to_owned(),
            });
        }
        if is_no(&input.text) {
            db.clear_state(&input.room_id, input.sender.user_id).await?;
            return Ok(StateOutcome::Handled(HandlerResult::message(CANCEL_ACK)));
        }

        // Choice: option index or alternate capability text.
        let trimmed = input.text.trim();
        if let Some(choice) = parse_choice_index(trimmed) {
            let options = state
                .data
                .get("options")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if let Some(option) = options.get(choice).and_then(Value::as_str) {
                return self.resolve_choice(db, input, &plan, option).await;
            }
        }
        for alternate in &plan.alternates {
            if trimmed.contains(alternate.as_str()) {
                let mut switched = plan.clone();
                switched.capability_key = alternate.clone();
                db.clear_state(&input.room_id, input.sender.user_id).await?;
                return Ok(StateOutcome::Resume {
                    plan: switched,
                    resolution: format!("choice:{alternate}"),
                });
            }
        }

        // Not a yes/no/choice. A message with its own capability signal
        // is a new request, not a garbled answer: hand it to the full
        // pipeline with the flow attached (the pending state stays put).
        if self.is_new_request(input) {
            return Ok(self.deflect(input, state));
        }

        // Otherwise keep waiting, restate the question.
        let question = state
            .data
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or("よろしいですか？");
        Ok(StateOutcome::Handled(HandlerResult::message(format!(
            "「はい」か「いいえ」でお答えください。{question}"
        ))))
    }

    async fn resolve_choice(
        &self,
        db: &TenantDb,
        input: &BrainInput,
        plan: &ExecutionPlan,
        option: &str,
    ) -> Result<StateOutcome, StateError> {
        db.clear_state(&input.room_id, input.sender.user_id).await?;
        if option.contains("やめる") {
            return Ok(StateOutcome::Handled(HandlerResult::message(CANCEL_ACK)));
        }
        if let Some(alternate) = plan
            .alternates
            .iter()
            .find(|alternate| option.contains(alternate.as_str()))
        {
            let mut switched = plan.clone();
            switched.capability_key = alternate.clone();
            return Ok(StateOutcome::Resume {
                plan: switched,
                resolution: format!("choice:{alternate}"),
            });
        }
        Ok(StateOutcome::Resume {
            plan: plan.clone(),
            resolution: format!("choice:{option}"),
        })
    }

    async fn continue_goal_setting(
        &self,
        db: &TenantDb,
        input: &BrainInput,
        state: &ConversationState,
    ) -> Result<StateOutcome, StateError> {
        // Steps take free text, so only a message with its own capability
        // signal escapes being stored as the answer.
        if self.is_new_request(input) {
            return Ok(self.deflect(input, state));
        }

        let mut data = state.data.clone();
        let answer = input.text.trim().to_owned();

        let (next_step, reply) = match state.step.as_str() {
            "title" => {
                data["title"] = json!(answer);
                (
                    "why",
                    "いい目標ですね。なぜその目標を達成したいのですか？".to_owned(),
                )
            }
            "why" => {
                data["why"] = json!(answer);
                (
                    "metric",
                    "達成できたかどうかは、何で測りましょうか？".to_owned(),
                )
            }
            "metric" => {
                data["metric"] = json!(answer);
                (
                    "deadline",
                    "いつまでに達成したいですか？".to_owned(),
                )
            }
            "deadline" => {
                data["deadline"] = json!(answer);
                let title = data.get("title").and_then(Value::as_str).unwrap_or("目標");
                db.insert_goal(
                    input.sender.user_id,
                    title,
                    data.get("why").and_then(Value::as_str),
                    data.get("metric").and_then(Value::as_str),
                    data.get("deadline").and_then(Value::as_str),
                    input.received_at,
                )
                .await?;
                db.clear_state(&input.room_id, input.sender.user_id).await?;
                return Ok(StateOutcome::Handled(
                    HandlerResult::message(format!(
                        "目標「{title}」を登録しました。応援しています！"
                    ))
                    .with_suggestions(vec!["週次で進捗を確認しましょうか？".to_owned()]),
                ));
            }
            other => {
                db.clear_state(&input.room_id, input.sender.user_id).await?;
                return Err(StateError::CorruptFlow {
                    state: StateType::GoalSetting,
                    detail: format!("unknown step {other}"),
                });
            }
        };

        db.transition_state(
            &input.room_id,
            input.sender.user_id,
            Transition {
                state_type: StateType::GoalSetting,
                step: next_step.to_owned(),
                data,
                reference: None,
                timeout_minutes: self.timeout_minutes,
            },
            input.received_at,
        )
        .await?;
        Ok(StateOutcome::Handled(HandlerResult::message(reply)))
    }

    async fn continue_task_pending(
        &self,
        db: &TenantDb,
        input: &BrainInput,
        state: &ConversationState,
    ) -> Result<StateOutcome, StateError> {
        if self.is_new_request(input) {
            return Ok(self.deflect(input, state));
        }

        let mut plan: ExecutionPlan = match state
            .data
            .get("plan")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
        {
            Some(plan) => plan,
            None => {
                db.clear_state(&input.room_id, input.sender.user_id).await?;
                return Err(StateError::CorruptFlow {
                    state: StateType::TaskPending,
                    detail: "missing pending plan".to_owned(),
                });
            }
        };
        let mut missing: Vec<String> = state
            .data
            .get("missing")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();

        if !plan.parameters.is_object() {
            plan.parameters = json!({});
        }
        if let Some(parameter) = missing.first().cloned() {
            plan.parameters[parameter.as_str()] = json!(input.text.trim());
            missing.remove(0);
        }

        if let Some(next_parameter) = missing.first() {
            let question = parameter_question(next_parameter);
            db.transition_state(
                &input.room_id,
                input.sender.user_id,
                Transition {
                    state_type: StateType::TaskPending,
                    step: format!("await_{next_parameter}"),
                    data: json!({"plan": plan, "missing": missing}),
                    reference: None,
                    timeout_minutes: self.timeout_minutes,
                },
                input.received_at,
            )
            .await?;
            return Ok(StateOutcome::Handled(HandlerResult::message(question)));
        }

        db.clear_state(&input.room_id, input.sender.user_id).await?;
        Ok(StateOutcome::Resume {
            plan,
            resolution: "parameters_completed".to_owned(),
        })
    }

    async fn continue_multi_action(
        &self,
        db: &TenantDb,
        input: &BrainInput,
        state: &ConversationState,
    ) -> Result<StateOutcome, StateError> {
        let pending: Vec<ExecutionPlan> = state
            .data
            .get("pending")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();

        if is_yes(&input.text) {
            if let Some((next, rest)) = pending.split_first() {
                if rest.is_empty() {
                    db.clear_state(&input.room_id, input.sender.user_id).await?;
                } else {
                    db.transition_state(
                        &input.room_id,
                        input.sender.user_id,
                        Transition {
                            state_type: StateType::MultiAction,
                            step: "await_continue".to_owned(),
                            data: json!({"pending": rest}),
                            reference: None,
                            timeout_minutes: self.timeout_minutes,
                        },
                        input.received_at,
                    )
                    .await?;
                }
                return Ok(StateOutcome::Resume {
                    plan: next.clone(),
                    resolution: "multi_action_continue".to_owned(),
                });
            }
            db.clear_state(&input.room_id, input.sender.user_id).await?;
            return Ok(StateOutcome::Handled(HandlerResult::message(
                "残りの操作はありません。",
            )));
        }

        if self.is_new_request(input) {
            return Ok(self.deflect(input, state));
        }

        db.clear_state(&input.room_id, input.sender.user_id).await?;
        Ok(StateOutcome::Handled(HandlerResult::message(CANCEL_ACK)))
    }
}

/// "what is the …?" question for a missing parameter.
pub fn parameter_question(name: &str) -> String {
    match name {
        "assignee" => "どなたへのタスクですか？".to_owned(),
        "body" => "タスクの内容を教えてください。".to_owned(),
        "deadline" => "期限はいつにしますか？".to_owned(),
        "message" => "配信する内容を教えてください。".to_owned(),
        "room" => "どのルームに配信しますか？".to_owned(),
        "query" => "何についてお調べしますか？".to_owned(),
        "task" => "どのタスクのことですか？".to_owned(),
        "statement" => "記録する内容を教えてください。".to_owned(),
        other => format!("{other}を教えてください。"),
    }
}

fn parse_choice_index(text: &str) -> Option<usize> {
    let normalized = text
        .trim()
        .trim_end_matches(['番', '.', ')'])
        .trim();
    let index: usize = normalized.parse().ok()?;
    index.checked_sub(1)
}
