//! Understanding layer: intent, entities, urgency, ambiguity resolution.
//!
//! Two paths merged with tie-breaks: keyword scoring against the registry's
//! intent keywords, and a single JSON-mode LLM inference over the message
//! plus a compact context rendering. An LLM outage degrades to
//! keyword-only with confidence capped, which forces a confirmation
//! downstream.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::memory::MemoryContext;
use crate::capability::CapabilityRegistry;
use crate::llm::{complete_with_retry, parse_json_output, LlmPort, LlmRequest, ModelTier, TokenUsage};
use crate::store::conversation::ConversationState;
use crate::types::{RoleLevel, Urgency};

/// Raw keyword score above which the keyword path is considered strong.
const STRONG_KEYWORD_SCORE: f64 = 0.9;
/// Raw keyword score below which the keyword path carries no signal.
const MIN_KEYWORD_SCORE: f64 = 0.25;
/// Penalty applied when the two paths disagree.
const DISAGREEMENT_PENALTY: f64 = 0.1;
/// LLM self-confidence needed to win a disagreement.
const LLM_OVERRIDE_CONFIDENCE: f64 = 0.6;
/// Confidence ceiling when the LLM path is unavailable.
const KEYWORD_ONLY_CAP: f64 = 0.6;
/// Margin under which two candidates count as rivals.
const RIVAL_MARGIN: f64 = 0.1;

/// Pronouns and deictic tokens that demand a referent.
const PRONOUN_TOKENS: &[&str] = &[
    "それ", "あれ", "その件", "さっきの", "例の", "that", "the one", "it",
];

/// Destructive verbs that tighten the confirmation hint.
const DESTRUCTIVE_TOKENS: &[&str] = &[
    "削除", "消して", "取り消し", "中止", "キャンセル", "delete", "remove", "cancel",
];

/// One resolved pronoun or ellipsis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAmbiguity {
    pub token: String,
    pub resolved_to: String,
    /// Where the referent came from: `state`, `last_turn`, or `recent_task`.
    pub source: &'static str,
}

/// Output of the Understanding layer.
#[derive(Debug, Clone)]
pub struct Understanding {
    /// Capability key, or `unknown`.
    pub intent: String,
    /// Entity object extracted by the LLM (may be empty).
    pub entities: Value,
    pub urgency: Urgency,
    pub resolved: Vec<ResolvedAmbiguity>,
    /// Merged confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    pub needs_confirmation_hint: bool,
    /// Token usage of the inference path (zero when degraded).
    pub usage: TokenUsage,
    pub model_id: Option<String>,
    /// Runner-up capability keys, best first, for confirmation options.
    pub alternates: Vec<String>,
}

/// A scored capability from the keyword path.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordScore {
    pub key: String,
    pub score: f64,
}

/// Score every enabled capability's intent keywords against the text.
/// Primary hits weigh 1.0, secondary 0.4, negative −0.6, all scaled by
/// descriptor priority; results are sorted best first.
pub fn score_keywords(
    registry: &CapabilityRegistry,
    role: RoleLevel,
    text: &str,
) -> Vec<KeywordScore> {
    let lowered = text.to_lowercase();
    let mut scores: Vec<KeywordScore> = registry
        .enabled_for(role)
        .map(|descriptor| {
            let weight = f64::from(descriptor.priority) / 10.0;
            let keywords = &descriptor.intent_keywords;
            let mut score = 0.0;
            for keyword in &keywords.primary {
                if lowered.contains(&keyword.to_lowercase()) {
                    score += 1.0 * weight;
                }
            }
            for keyword in &keywords.secondary {
                if lowered.contains(&keyword.to_lowercase()) {
                    score += 0.4 * weight;
                }
            }
            for keyword in &keywords.negative {
                if lowered.contains(&keyword.to_lowercase()) {
                    score -= 0.6 * weight;
                }
            }
            KeywordScore {
                key: descriptor.key.to_owned(),
                score: score.max(0.0),
            }
        })
        .collect();
    scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scores
}

/// Normalize a raw keyword score into [0, 1).
fn normalize(score: f64) -> f64 {
    score / (score + 1.0)
}

/// The Understanding engine.
pub struct Understander {
    registry: Arc<CapabilityRegistry>,
    llm: Arc<dyn LlmPort>,
}

impl Understander {
    /// Create an engine over the registry and LLM seam.
    pub fn new(registry: Arc<CapabilityRegistry>, llm: Arc<dyn LlmPort>) -> Self {
        Self { registry, llm }
    }

    /// Run both paths and merge.
    pub async fn understand(
        &self,
        text: &str,
        context: &MemoryContext,
        active_state: Option<&ConversationState>,
    ) -> Understanding {
        let scores = score_keywords(&self.registry, context.sender.role_level, text);
        let keyword_top = scores.first().cloned();
        let keyword_second = scores.get(1).cloned();

        let llm_outcome = self.infer(text, context).await;

        let mut usage = TokenUsage::default();
        let mut model_id = None;
        let (intent, mut confidence, reasoning) = match (&keyword_top, &llm_outcome) {
            (_, Some(inference)) => {
                usage = inference.usage;
                model_id = Some(inference.model_id.clone());
                self.merge(keyword_top.as_ref(), inference)
            }
            (Some(top), None) if top.score >= MIN_KEYWORD_SCORE => (
                top.key.clone(),
                normalize(top.score).min(KEYWORD_ONLY_CAP),
                "keyword-only (inference unavailable)".to_owned(),
            ),
            _ => (
                "unknown".to_owned(),
                0.0,
                "no keyword signal and inference unavailable".to_owned(),
            ),
        };

        let entities = llm_outcome
            .as_ref()
            .map(|inference| inference.entities.clone())
            .unwrap_or_else(|| json!({}));
        let urgency = llm_outcome
            .as_ref()
            .map(|inference| inference.urgency)
            .unwrap_or_default();

        let resolved = resolve_ambiguities(text, active_state, context);

        // Rivals: keyword candidates within the margin of the top.
        let mut alternates: Vec<String> = Vec::new();
        if let (Some(top), Some(second)) = (&keyword_top, &keyword_second) {
            if second.score > 0.0
                && normalize(top.score) - normalize(second.score) < RIVAL_MARGIN
            {
                alternates.push(second.key.clone());
            }
        }
        for score in scores.iter().skip(2).take(2) {
            if score.score >= MIN_KEYWORD_SCORE {
                alternates.push(score.key.clone());
            }
        }
        alternates.retain(|key| key != &intent);
        alternates.truncate(3);

        let unresolved_pronoun = PRONOUN_TOKENS.iter().any(|t| text.contains(t))
            && resolved.is_empty();
        let destructive_with_rivals = DESTRUCTIVE_TOKENS.iter().any(|t| text.contains(t))
            && (context.tasks.len() > 1 || !alternates.is_empty());

        confidence = confidence.clamp(0.0, 1.0);
        let needs_confirmation_hint = confidence < 0.7
            || !alternates.is_empty()
            || unresolved_pronoun
            || destructive_with_rivals;

        debug!(
            intent = %intent,
            confidence,
            alternates = alternates.len(),
            "understanding complete"
        );

        Understanding {
            intent,
            entities,
            urgency,
            resolved,
            confidence,
            reasoning,
            needs_confirmation_hint,
            usage,
            model_id,
            alternates,
        }
    }

    fn merge(
        &self,
        keyword_top: Option<&KeywordScore>,
        inference: &Inference,
    ) -> (String, f64, String) {
        let keyword_norm = keyword_top.map(|top| normalize(top.score)).unwrap_or(0.0);
        match keyword_top {
            Some(top) if top.score >= STRONG_KEYWORD_SCORE && top.key == inference.intent => (
                inference.intent.clone(),
                keyword_norm.max(inference.confidence),
                format!("keyword and inference agree on {}", inference.intent),
            ),
            Some(top) if top.score >= MIN_KEYWORD_SCORE && top.key != inference.intent => {
                let merged = (keyword_norm.min(inference.confidence) - DISAGREEMENT_PENALTY)
                    .max(0.0);
                if inference.confidence >= LLM_OVERRIDE_CONFIDENCE {
                    (
                        inference.intent.clone(),
                        merged,
                        format!(
                            "paths disagree ({} vs {}), inference wins",
                            top.key, inference.intent
                        ),
                    )
                } else {
                    (
                        top.key.clone(),
                        merged,
                        format!(
                            "paths disagree ({} vs {}), keyword wins",
                            top.key, inference.intent
                        ),
                    )
                }
            }
            _ => (
                inference.intent.clone(),
                inference.confidence,
                "inference only (no keyword signal)".to_owned(),
            ),
        }
    }

    async fn infer(&self, text: &str, context: &MemoryContext) -> Option<Inference> {
        let capability_lines: Vec<String> = self
            .registry
            .all()
            .iter()
            .filter(|descriptor| descriptor.enabled)
            .map(|descriptor| format!("- {}: {}", descriptor.key, descriptor.description))
            .collect();

        let system = format!(
            "You route corporate chat messages to one capability.\n\
             Capabilities:\n{}\n\
             Return JSON: {{\"intent\": key or \"unknown\", \"entities\": object, \
             \"confidence\": 0.0-1.0, \"urgency\": \"low\"|\"normal\"|\"high\", \
             \"reasoning\": short string}}.\n\
             Extract entities the capability needs (assignee, body, deadline, room, \
             message, query, task, statement, title, text, cron).",
            capability_lines.join("\n")
        );
        let prompt = format!(
            "Context:\n{}\nMessage: {text}",
            context.render_compact()
        );

        let request = LlmRequest {
            tier: ModelTier::Primary,
            system,
            prompt,
            max_tokens: 700,
            json_mode: true,
        };

        let response = match complete_with_retry(self.llm.as_ref(), request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "understanding inference unavailable");
                return None;
            }
        };

        let parsed = match parse_json_output(&response.text) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "understanding inference returned non-JSON");
                return None;
            }
        };

        let intent = parsed
            .get("intent")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        // Unknown capability keys from the model degrade to "unknown".
        let intent = if intent == "unknown" || self.registry.get(&intent).is_some() {
            intent
        } else {
            "unknown".to_owned()
        };

        let confidence = parsed
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let urgency = match parsed.get("urgency").and_then(Value::as_str) {
            Some("high") => Urgency::High,
            Some("low") => Urgency::Low,
            _ => Urgency::Normal,
        };

        Some(Inference {
            intent,
            entities: parsed.get("entities").cloned().unwrap_or_else(|| json!({})),
            confidence,
            urgency,
            usage: response.usage,
            model_id: response.model_id,
        })
    }
}

struct Inference {
    intent: String,
    entities: Value,
    confidence: f64,
    urgency: Urgency,
    usage: TokenUsage,
    model_id: String,
}

/// Resolve pronouns and deictic references against, in order: the active
/// flow's scratch data, the last conversation turn, and recent tasks.
fn resolve_ambiguities(
    text: &str,
    active_state: Option<&ConversationState>,
    context: &MemoryContext,
) -> Vec<ResolvedAmbiguity> {
    let mut resolved = Vec::new();
    for token in PRONOUN_TOKENS {
        if !text.contains(token) {
            continue;
        }
        if let Some(state) = active_state {
            if let Some(subject) = state
                .data
                .get("subject")
                .or_else(|| state.data.get("title"))
                .and_then(Value::as_str)
            {
                resolved.push(ResolvedAmbiguity {
                    token: (*token).to_owned(),
                    resolved_to: subject.to_owned(),
                    source: "state",
                });
                continue;
            }
        }
        if let Some(turn) = context.recent_turns.last() {
            resolved.push(ResolvedAmbiguity {
                token: (*token).to_owned(),
                resolved_to: turn.content.chars().take(60).collect(),
                source: "last_turn",
            });
            continue;
        }
        if let Some(task) = context.most_recent_task() {
            resolved.push(ResolvedAmbiguity {
                token: (*token).to_owned(),
                resolved_to: task.body.clone(),
                source: "recent_task",
            });
        }
    }
    resolved
}
