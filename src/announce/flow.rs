//! Announcement confirmation flow.
//!
//! Five user-observable stages: capture → room resolution → confirmation
//! preview (with targeted modifications) → scheduling → execution. The
//! flow owns the announcement row and the Announcement conversation state;
//! execution belongs to [`super::executor`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::rooms::{self, RoomResolution};
use super::{job_payload, render_preview, Announcement, ScheduleType, Status};
use crate::capability::{HandlerError, HandlerResult, StateDelta};
use crate::jobs::KIND_ANNOUNCEMENT;
use crate::llm::{complete_with_retry, LlmPort, LlmRequest, ModelTier};
use crate::store::admin::AdminConfigCache;
use crate::store::conversation::{ConversationState, StateType, Transition};
use crate::store::{StoreError, TenantDb};
use crate::types::BrainInput;

/// Delay applied to "immediate" sends so the confirmation reply lands
/// before the announcement itself.
const IMMEDIATE_DELAY_SECS: i64 = 5;

/// The announcement flow engine.
pub struct AnnouncementFlow {
    llm: Arc<dyn LlmPort>,
    admin_cache: Arc<AdminConfigCache>,
    default_room_threshold: f64,
    state_timeout_minutes: i64,
}

/// Inputs captured from the requesting message.
#[derive(Debug, Clone)]
pub struct AnnouncementRequest {
    pub message: String,
    pub room_query: Option<String>,
    pub create_tasks: bool,
    pub task_deadline: Option<DateTime<Utc>>,
    pub schedule_at: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub requester_account_id: String,
    pub source_room_id: String,
}

impl AnnouncementFlow {
    /// Create the flow engine.
    pub fn new(
        llm: Arc<dyn LlmPort>,
        admin_cache: Arc<AdminConfigCache>,
        default_room_threshold: f64,
        state_timeout_minutes: i64,
    ) -> Self {
        Self {
            llm,
            admin_cache,
            default_room_threshold,
            state_timeout_minutes,
        }
    }

    /// Test constructor with an unavailable LLM (rewrites fall back to the
    /// original text).
    #[cfg(test)]
    pub async fn for_tests(_db: &crate::store::Db) -> Self {
        struct NoLlm;
        #[async_trait::async_trait]
        impl LlmPort for NoLlm {
            async fn complete(
                &self,
                _request: LlmRequest,
            ) -> Result<crate::llm::LlmResponse, crate::llm::LlmError> {
                Err(crate::llm::LlmError::Unavailable(503))
            }
        }
        Self::new(Arc::new(NoLlm), Arc::new(AdminConfigCache::new()), 0.8, 30)
    }

    async fn room_threshold(&self, db: &TenantDb) -> f64 {
        match self.admin_cache.get(db).await {
            Ok(config) => config
                .room_match_threshold
                .unwrap_or(self.default_room_threshold),
            Err(_) => self.default_room_threshold,
        }
    }

    /// Stage (a): capture a request, resolve the room, and present the
    /// confirmation.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] mapped by the Execution layer.
    pub async fn start(
        &self,
        db: &TenantDb,
        request: AnnouncementRequest,
        now: DateTime<Utc>,
    ) -> Result<HandlerResult, HandlerError> {
        if request.message.trim().is_empty() {
            return Err(HandlerError::ParameterInvalid("message".to_owned()));
        }

        // A newer request from the same user supersedes any still-pending
        // announcement.
        let superseded = db
            .cancel_stale_pending_announcements(&request.requester_account_id, now)
            .await
            .map_err(store_err)?;
        if superseded > 0 {
            info!(superseded, "older pending announcements auto-cancelled");
        }

        let patterns_enabled = db
            .feature_enabled_or("pattern_detection", true)
            .await
            .unwrap_or(true);
        let pattern = if patterns_enabled {
            db.record_announcement_pattern(&request.message, &request.requester_account_id, now)
                .await
                .map_err(store_err)?
        } else {
            super::patterns::PatternObservation {
                occurrence_count: 0,
                propose_recurrence: false,
            }
        };

        let timezone = db.tenant_timezone().await.map_err(store_err)?;
        let mut announcement = Announcement::new(
            self.rewrite(&request.message, None).await,
            request.requester_account_id.clone(),
            request.source_room_id.clone(),
            timezone,
            now,
        );
        // The title keeps the raw request wording for pattern bookkeeping.
        announcement.title = request.message.clone();
        announcement.create_tasks = request.create_tasks;
        announcement.task_deadline = request.task_deadline;
        if let Some(cron) = &request.cron_expression {
            announcement.schedule_type = ScheduleType::Recurring;
            announcement.cron_expression = Some(cron.clone());
        } else if let Some(at) = request.schedule_at {
            announcement.schedule_type = ScheduleType::OneTime;
            announcement.scheduled_at = Some(at);
        }

        // Room resolution.
        let mut candidates_data = json!([]);
        let mut room_name: Option<String> = None;
        match &request.room_query {
            None => {
                announcement.target_room_id = Some(request.source_room_id.clone());
            }
            Some(query) => {
                let directory = db.room_directory().await.map_err(store_err)?;
                let threshold = self.room_threshold(db).await;
                match rooms::resolve(&directory, query, threshold) {
                    RoomResolution::Auto(matched) => {
                        announcement.target_room_id = Some(matched.room_id);
                        room_name = Some(matched.name);
                    }
                    RoomResolution::Ambiguous(candidates) => {
                        announcement.status = Status::PendingRoom;
                        candidates_data = json!(candidates
                            .iter()
                            .map(|c| json!({"room_id": c.room_id, "name": c.name}))
                            .collect::<Vec<_>>());
                    }
                    RoomResolution::NoMatch => {
                        return Err(HandlerError::NotFound(format!(
                            "room matching {query}"
                        )));
                    }
                }
            }
        }

        db.save_announcement(&announcement, now).await.map_err(store_err)?;

        let (step, message) = if announcement.status == Status::PendingRoom {
            let listed: Vec<String> = candidates_data
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .enumerate()
                        .filter_map(|(i, item)| {
                            item.get("name")
                                .and_then(Value::as_str)
                                .map(|name| format!("{}. {name}", i.saturating_add(1)))
                        })
                        .collect()
                })
                .unwrap_or_default();
            (
                "choose_room",
                format!(
                    "どのルームに配信しますか？番号でお答えください。\n{}",
                    listed.join("\n")
                ),
            )
        } else {
            ("confirm", render_preview(&announcement, room_name.as_deref()))
        };

        let mut result = HandlerResult::message(message).with_state(StateDelta::Transition(
            Transition {
                state_type: StateType::Announcement,
                step: step.to_owned(),
                data: json!({
                    "candidates": candidates_data,
                    "subject": announcement.message_body,
                }),
                reference: Some(("announcement".to_owned(), announcement.id.to_string())),
                timeout_minutes: self.state_timeout_minutes,
            },
        ));
        if pattern.propose_recurrence {
            result = result.with_suggestions(vec![
                "この連絡は繰り返し依頼されています。定期配信にしませんか？".to_owned(),
            ]);
        }
        Ok(result)
    }

    /// Stages (b)–(d): consume the next message while the Announcement
    /// state is active.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn continue_flow(
        &self,
        db: &TenantDb,
        input: &BrainInput,
        state: &ConversationState,
    ) -> Result<HandlerResult, StoreError> {
        let Some(reference_id) = state.reference_id.as_deref() else {
            db.clear_state(&input.room_id, input.sender.user_id).await?;
            return Ok(HandlerResult::message(
                "アナウンスの情報が見つかりませんでした。もう一度最初からお願いします。",
            ));
        };
        let announcement_id = match Uuid::parse_str(reference_id) {
            Ok(id) => id,
            Err(_) => {
                db.clear_state(&input.room_id, input.sender.user_id).await?;
                return Ok(HandlerResult::message(
                    "アナウンスの情報が見つかりませんでした。もう一度最初からお願いします。",
                ));
            }
        };
        let mut announcement = match db.announcement(announcement_id).await {
            Ok(announcement) => announcement,
            Err(StoreError::NotFound { .. }) => {
                db.clear_state(&input.room_id, input.sender.user_id).await?;
                return Ok(HandlerResult::message(
                    "このアナウンスはすでに取り消されています。",
                ));
            }
            Err(err) => return Err(err),
        };

        match state.step.as_str() {
            "choose_room" => {
                self.handle_room_choice(db, input, state, &mut announcement)
                    .await
            }
            _ => self.handle_confirm_step(db, input, &mut announcement).await,
        }
    }

    async fn handle_room_choice(
        &self,
        db: &TenantDb,
        input: &BrainInput,
        state: &ConversationState,
        announcement: &mut Announcement,
    ) -> Result<HandlerResult, StoreError> {
        let candidates: Vec<(String, String)> = state
            .data
            .get("candidates")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some((
                            item.get("room_id")?.as_str()?.to_owned(),
                            item.get("name")?.as_str()?.to_owned(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let trimmed = input.text.trim();
        let chosen = trimmed
            .trim_end_matches(['番', '.', ')'])
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|index| candidates.get(index))
            .or_else(|| {
                candidates
                    .iter()
                    .find(|(_, name)| trimmed.contains(name.as_str()) || name.contains(trimmed))
            });

        let Some((room_id, room_name)) = chosen.cloned() else {
            return Ok(HandlerResult::message(
                "番号かルーム名でお答えください。中止する場合は「キャンセル」とどうぞ。",
            ));
        };

        announcement.target_room_id = Some(room_id);
        announcement.status = Status::Pending;
        db.save_announcement(announcement, input.received_at).await?;
        db.transition_state(
            &input.room_id,
            input.sender.user_id,
            Transition {
                state_type: StateType::Announcement,
                step: "confirm".to_owned(),
                data: json!({"subject": announcement.message_body}),
                reference: Some(("announcement".to_owned(), announcement.id.to_string())),
                timeout_minutes: self.state_timeout_minutes,
            },
            input.received_at,
        )
        .await?;
        Ok(HandlerResult::message(render_preview(
            announcement,
            Some(&room_name),
        )))
    }

    async fn handle_confirm_step(
        &self,
        db: &TenantDb,
        input: &BrainInput,
        announcement: &mut Announcement,
    ) -> Result<HandlerResult, StoreError> {
        let text = input.text.trim();

        if is_affirmative(text) {
            return self.confirm_and_schedule(db, input, announcement).await;
        }

        if let Some(instruction) = rewrite_instruction(text) {
            announcement.message_body = self
                .rewrite(&announcement.message_body, Some(&instruction))
                .await;
            db.save_announcement(announcement, input.received_at).await?;
            return Ok(HandlerResult::message(render_preview(announcement, None)));
        }

        if let Some(name) = excluded_name(text) {
            let account = self.account_for_name(db, &name).await;
            if !announcement.task_exclude.contains(&account) {
                announcement.task_exclude.push(account);
            }
            db.save_announcement(announcement, input.received_at).await?;
            return Ok(HandlerResult::message(format!(
                "{name}さんをタスク対象から外しました。\n{}",
                render_preview(announcement, None)
            )));
        }

        if let Some(name) = included_name(text) {
            let account = self.account_for_name(db, &name).await;
            if !announcement.task_include.contains(&account) {
                announcement.task_include.push(account);
            }
            announcement.create_tasks = true;
            db.save_announcement(announcement, input.received_at).await?;
            return Ok(HandlerResult::message(format!(
                "{name}さんをタスク対象に追加しました。\n{}",
                render_preview(announcement, None)
            )));
        }

        Ok(HandlerResult::message(format!(
            "「はい」で確定、「キャンセル」で中止できます。\n{}",
            render_preview(announcement, None)
        )))
    }

    /// Stage (d): confirm and hand to the job store.
    async fn confirm_and_schedule(
        &self,
        db: &TenantDb,
        input: &BrainInput,
        announcement: &mut Announcement,
    ) -> Result<HandlerResult, StoreError> {
        let now = input.received_at;
        announcement.status = Status::Confirmed;

        let (next_at, reply) = match announcement.schedule_type {
            ScheduleType::Immediate => {
                let at = now + Duration::seconds(IMMEDIATE_DELAY_SECS);
                db.enqueue_once(
                    KIND_ANNOUNCEMENT,
                    &job_payload(announcement.id, announcement.execution_count.saturating_add(1)),
                    at,
                    now,
                )
                .await?;
                (at, "承知しました。まもなく配信します。".to_owned())
            }
            ScheduleType::OneTime => {
                let Some(at) = announcement.scheduled_at else {
                    return Ok(HandlerResult::message(
                        "配信時刻が未設定です。「明日9時に」のように教えてください。",
                    ));
                };
                if at <= now {
                    return Ok(HandlerResult::message(
                        "配信時刻が過去になっています。改めて時刻を教えてください。",
                    ));
                }
                db.enqueue_once(
                    KIND_ANNOUNCEMENT,
                    &job_payload(announcement.id, announcement.execution_count.saturating_add(1)),
                    at,
                    now,
                )
                .await?;
                (
                    at,
                    format!("予約しました。{}に配信します。", at.format("%m/%d %H:%M")),
                )
            }
            ScheduleType::Recurring => {
                let Some(cron) = announcement.cron_expression.clone() else {
                    return Ok(HandlerResult::message(
                        "繰り返しの設定が未指定です。配信の周期を教えてください。",
                    ));
                };
                db.enqueue_recurring(
                    KIND_ANNOUNCEMENT,
                    &job_payload(announcement.id, 0),
                    &cron,
                    &announcement.timezone,
                    now,
                )
                .await?;
                let next = crate::jobs::next_cron_occurrence(&cron, &announcement.timezone, now)
                    .unwrap_or(now + Duration::seconds(IMMEDIATE_DELAY_SECS));
                // The proposal that produced a recurring schedule is now
                // addressed.
                db.set_pattern_status(
                    &announcement.title,
                    super::patterns::PatternStatus::Addressed,
                )
                .await?;
                (
                    next,
                    format!("定期配信を設定しました。次回は{}です。", next.format("%m/%d %H:%M")),
                )
            }
        };

        announcement.status = Status::Scheduled;
        announcement.next_execution_at = Some(next_at);
        db.save_announcement(announcement, now).await?;
        db.clear_state(&input.room_id, input.sender.user_id).await?;
        info!(announcement = %announcement.id, "announcement scheduled");
        Ok(HandlerResult::message(reply))
    }

    /// Cancel the referenced announcement (flow cancel or explicit
    /// cancellation capability).
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn cancel_by_reference(
        &self,
        db: &TenantDb,
        reference_id: &str,
    ) -> Result<(), StoreError> {
        let Ok(id) = Uuid::parse_str(reference_id) else {
            return Ok(());
        };
        match db.announcement(id).await {
            Ok(announcement) if !announcement.status.is_terminal() => {
                db.set_announcement_status(id, Status::Cancelled, Utc::now())
                    .await?;
                db.cancel_jobs_for_announcement(id).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Rewrite announcement text in the assistant's voice; optional
    /// targeted instruction. Falls back to the input on any LLM failure.
    async fn rewrite(&self, original: &str, instruction: Option<&str>) -> String {
        let system = "社内チャットのアナウンス文面を整えるアシスタントです。\
                      事実は変えず、丁寧で温かい日本語に直してください。\
                      文面のみを返してください。"
            .to_owned();
        let prompt = match instruction {
            Some(instruction) => format!("文面: {original}\n修正指示: {instruction}"),
            None => format!("文面: {original}"),
        };
        let request = LlmRequest {
            tier: ModelTier::Fast,
            system,
            prompt,
            max_tokens: 400,
            json_mode: false,
        };
        match complete_with_retry(self.llm.as_ref(), request).await {
            Ok(response) if !response.text.trim().is_empty() => response.text.trim().to_owned(),
            Ok(_) => original.to_owned(),
            Err(err) => {
                warn!(error = %err, "announcement rewrite unavailable, keeping original");
                original.to_owned()
            }
        }
    }

    async fn account_for_name(&self, db: &TenantDb, name: &str) -> String {
        match db.person_by_name(name).await {
            Ok(Some(person)) => person.account_id.unwrap_or_else(|| name.to_owned()),
            _ => name.to_owned(),
        }
    }
}

fn store_err(err: StoreError) -> HandlerError {
    HandlerError::UpstreamUnavailable(err.to_string())
}

fn is_affirmative(text: &str) -> bool {
    let lowered = text.to_lowercase();
    ["はい", "ok", "おけ", "了解", "お願いします", "yes"]
        .iter()
        .any(|token| lowered == *token || lowered.starts_with(token))
}

/// "文面を変えて：..." style instruction, if present.
fn rewrite_instruction(text: &str) -> Option<String> {
    for marker in ["文面を変えて", "文章を変えて", "メッセージを変えて", "書き直して"] {
        if let Some(index) = text.find(marker) {
            let rest = &text[index.saturating_add(marker.len())..];
            let instruction = rest.trim_start_matches(['：', ':', ' ', '　']).trim();
            if instruction.is_empty() {
                return Some(text.to_owned());
            }
            return Some(instruction.to_owned());
        }
    }
    None
}

fn excluded_name(text: &str) -> Option<String> {
    let index = text.find("を外して").or_else(|| text.find("は外して"))?;
    let name = text[..index]
        .trim()
        .trim_end_matches("さん")
        .trim()
        .to_owned();
    (!name.is_empty()).then_some(name)
}

fn included_name(text: &str) -> Option<String> {
    let index = text.find("も追加").or_else(|| text.find("を追加"))?;
    let name = text[..index]
        .trim()
        .trim_end_matches("さん")
        .trim()
        .to_owned();
    (!name.is_empty()).then_some(name)
}
