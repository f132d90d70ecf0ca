//! Decision layer: capability scoring, confirmation gating, value alignment.
//!
//! Produces exactly one of: an execution plan, a confirmation request with
//! the pending plan embedded, or a refusal. Role gating happens before
//! scoring; a capability the sender's level cannot reach is refused, never
//! planned.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::memory::MemoryContext;
use super::understanding::Understanding;
use crate::capability::{CapabilityDescriptor, CapabilityRegistry};
use crate::store::decision_log::GuardrailAction;
use crate::store::{StoreError, TenantDb};
use crate::types::RiskLevel;

/// Score weights per the selection formula.
const W_KEYWORDS: f64 = 0.4;
const W_INTENT: f64 = 0.3;
const W_CONTINUITY: f64 = 0.2;
const W_RECENCY: f64 = 0.1;

/// Lookback window for recency affinity.
const RECENCY_WINDOW_MINUTES: i64 = 30;

/// Minimum winning score; below this the Brain asks instead of acting.
const MIN_ACTIONABLE_SCORE: f64 = 0.15;

/// Recipient count at or above which a confirmation is forced.
const RECIPIENT_CONFIRMATION_FLOOR: u64 = 3;

/// Phrases that violate organizational no-go rules outright.
const BLOCKED_PHRASES: &[&str] = &["クビにする", "罰として", "無能", "土下座", "見せしめ"];

/// Phrases that demand a reworded confirmation rather than a block.
const REFORM_PHRASES: &[&str] = &["強制参加", "休み返上", "絶対参加", "自腹で"];

/// Teaching categories that activate outbound-text guards.
const GUARDED_CATEGORIES: &[&str] = &[
    "psych-safety",
    "sdt",
    "choice-theory",
    "mission",
    "vision",
    "values",
];

/// A category-scoped violation vocabulary. Live only while the tenant has
/// an active verified teaching in one of the categories.
struct CategoryGuard {
    categories: &'static [&'static str],
    /// Matching text is blocked outright.
    block: &'static [&'static str],
    /// Matching text is downgraded to a reworded confirmation.
    reform: &'static [&'static str],
}

const CATEGORY_GUARDS: &[CategoryGuard] = &[
    // Psychological safety: blaming or coercive framing.
    CategoryGuard {
        categories: &["psych-safety"],
        block: &["吊し上げ", "連帯責任", "戦犯"],
        reform: &["必ず", "絶対に", "強制", "言い訳", "反省文"],
    },
    // Autonomy (self-determination / choice theory): wording that removes
    // choice.
    CategoryGuard {
        categories: &["sdt", "choice-theory"],
        block: &[],
        reform: &[
            "拒否できません",
            "選択の余地",
            "問答無用",
            "従ってください",
            "希望は聞きません",
        ],
    },
];

/// Dismissive tokens that, next to a term from a declared mission
/// statement, read as overriding the mission language.
const MISSION_DISMISSALS: &[&str] = &["後回し", "不要", "必要ない", "無視して", "やめて", "二の次"];

/// Destructive verbs that always gate on confirmation.
const DESTRUCTIVE_VERBS: &[&str] = &["削除", "全員に送", "配信を中止", "delete", "cancel-scheduled"];

/// A validated, executable plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub capability_key: String,
    pub parameters: Value,
    pub confidence: f64,
    pub reasoning: String,
    /// Runner-up capability keys, at most three.
    pub alternates: Vec<String>,
    pub followups_allowed: bool,
}

/// A confirmation put to the user, with the plan it would release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub question: String,
    /// At most three concrete options.
    pub options: Vec<String>,
    pub pending_plan: ExecutionPlan,
}

/// A policy-blocked selection, explained in user-safe terms.
#[derive(Debug, Clone)]
pub struct Refusal {
    pub user_message: String,
    pub policy_code: &'static str,
}

/// The three possible decision outputs.
#[derive(Debug, Clone)]
pub enum Decision {
    Execute(ExecutionPlan),
    Confirm(ConfirmationRequest),
    Refuse(Refusal),
}

/// Decision plus the guardrail evidence for the decision log.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub guardrail: GuardrailAction,
    pub policy_reason: Option<String>,
}

/// The Decision engine.
pub struct DecisionEngine {
    registry: Arc<CapabilityRegistry>,
    confirmation_threshold: f64,
    amount_threshold: f64,
}

impl DecisionEngine {
    /// Create an engine with the configured thresholds.
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        confirmation_threshold: f64,
        amount_threshold: f64,
    ) -> Self {
        Self {
            registry,
            confirmation_threshold,
            amount_threshold,
        }
    }

    /// Select a capability and gate it.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure while reading recency data.
    pub async fn decide(
        &self,
        db: &TenantDb,
        text: &str,
        room_id: &str,
        understanding: &Understanding,
        context: &MemoryContext,
        active_flow_category: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DecisionOutcome, StoreError> {
        let role = context.sender.role_level;

        // Role gate on the understood intent: insufficient level refuses.
        if let Some(descriptor) = self.registry.get(&understanding.intent) {
            if descriptor.required_role_level > role {
                return Ok(DecisionOutcome {
                    decision: Decision::Refuse(Refusal {
                        user_message: "この操作を行う権限がありません。管理者にご相談ください。"
                            .to_owned(),
                        policy_code: "role_insufficient",
                    }),
                    guardrail: GuardrailAction::Blocked,
                    policy_reason: Some("required role level not met".to_owned()),
                });
            }
        }

        let recent = db
            .recent_capabilities(
                context.sender.user_id,
                now - Duration::minutes(RECENCY_WINDOW_MINUTES),
                10,
            )
            .await?;
        let last_category = match db
            .last_successful_capability(context.sender.user_id, room_id)
            .await
        {
            Ok(Some(key)) => self.registry.get(&key).map(|d| d.category.to_owned()),
            _ => None,
        };

        let mut scored: Vec<(&CapabilityDescriptor, f64)> = self
            .registry
            .enabled_for(role)
            .map(|descriptor| {
                let score = self.score(
                    descriptor,
                    text,
                    understanding,
                    active_flow_category,
                    last_category.as_deref(),
                    &recent,
                );
                (descriptor, score)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.0.priority.cmp(&a.0.priority))
        });

        let Some(&(winner, top_score)) = scored.first() else {
            return Ok(refuse_nothing_available());
        };

        if top_score < MIN_ACTIONABLE_SCORE || understanding.intent == "unknown" {
            // Nothing actionable: ask, listing concrete referents. The
            // parked plan falls back to conversation so a bare "yes"
            // cannot trigger an operation the user never named.
            let fallback = self.registry.get("general_chat").unwrap_or(winner);
            let plan = self.plan_for(fallback, understanding);
            return Ok(DecisionOutcome {
                decision: Decision::Confirm(ConfirmationRequest {
                    question: "どの件についてでしょうか？".to_owned(),
                    options: ambiguity_options(context),
                    pending_plan: plan,
                }),
                guardrail: GuardrailAction::None,
                policy_reason: None,
            });
        }

        let plan = self.plan_for(winner, understanding);

        // Value alignment before gating: a blocked plan never executes.
        match self.value_alignment(db, &plan).await? {
            Alignment::Block(reason) => {
                return Ok(DecisionOutcome {
                    decision: Decision::Refuse(Refusal {
                        user_message:
                            "その内容はお手伝いできません。伝え方を変えてもう一度ご相談ください。"
                                .to_owned(),
                        policy_code: "value_alignment",
                    }),
                    guardrail: GuardrailAction::Blocked,
                    policy_reason: Some(reason),
                });
            }
            Alignment::Reform(reason) => {
                return Ok(DecisionOutcome {
                    decision: Decision::Confirm(ConfirmationRequest {
                        question: format!(
                            "{}の前に、表現を見直しませんか？このまま進める場合は「はい」とお答えください。",
                            winner.display_name
                        ),
                        options: vec!["はい".to_owned(), "やめる".to_owned()],
                        pending_plan: plan,
                    }),
                    guardrail: GuardrailAction::Confirmed,
                    policy_reason: Some(reason),
                });
            }
            Alignment::Pass => {}
        }

        if let Some(reason) = self.confirmation_reason(winner, &plan, understanding) {
            let question = confirmation_question(winner, &plan);
            let options = confirmation_options(winner, understanding, context);
            return Ok(DecisionOutcome {
                decision: Decision::Confirm(ConfirmationRequest {
                    question,
                    options,
                    pending_plan: plan,
                }),
                guardrail: GuardrailAction::Confirmed,
                policy_reason: Some(reason),
            });
        }

        Ok(DecisionOutcome {
            decision: Decision::Execute(plan),
            guardrail: GuardrailAction::None,
            policy_reason: None,
        })
    }

    fn score(
        &self,
        descriptor: &CapabilityDescriptor,
        text: &str,
        understanding: &Understanding,
        active_flow_category: Option<&str>,
        last_category: Option<&str>,
        recent: &[String],
    ) -> f64 {
        let keywords = &descriptor.decision_keywords;
        let denominator = keywords.primary.len().max(1);
        let entities_text = understanding.entities.to_string().to_lowercase();
        let haystack = format!("{} {entities_text}", text.to_lowercase());
        let mut hits = 0.0;
        for keyword in &keywords.primary {
            if haystack.contains(&keyword.to_lowercase()) {
                hits += 1.0;
            }
        }
        for keyword in &keywords.secondary {
            if haystack.contains(&keyword.to_lowercase()) {
                hits += 0.4;
            }
        }
        for keyword in &keywords.negative {
            if haystack.contains(&keyword.to_lowercase()) {
                hits -= 0.6;
            }
        }
        let hit_ratio = (hits / denominator_as_f64(denominator)).clamp(0.0, 1.0);

        let intent_match = if descriptor.key == understanding.intent {
            1.0
        } else if understanding.alternates.iter().any(|a| a == descriptor.key) {
            0.5
        } else {
            0.0
        };

        let continuity = if Some(descriptor.category) == active_flow_category
            || Some(descriptor.category) == last_category
        {
            1.0
        } else {
            0.0
        };

        let recency = if recent.iter().any(|key| key == descriptor.key) {
            1.0
        } else {
            0.0
        };

        W_KEYWORDS * hit_ratio + W_INTENT * intent_match + W_CONTINUITY * continuity
            + W_RECENCY * recency
    }

    fn plan_for(
        &self,
        descriptor: &CapabilityDescriptor,
        understanding: &Understanding,
    ) -> ExecutionPlan {
        // Scrub: only declared parameter names survive into the plan.
        let mut parameters = serde_json::Map::new();
        if let Some(entities) = understanding.entities.as_object() {
            for spec in &descriptor.parameters {
                if let Some(value) = entities.get(spec.name) {
                    parameters.insert(spec.name.to_owned(), value.clone());
                }
            }
        }
        ExecutionPlan {
            capability_key: descriptor.key.to_owned(),
            parameters: Value::Object(parameters),
            confidence: understanding.confidence,
            reasoning: understanding.reasoning.clone(),
            alternates: understanding.alternates.clone(),
            followups_allowed: !descriptor.chain_hints.is_empty(),
        }
    }

    /// The first gating rule the plan trips, if any.
    fn confirmation_reason(
        &self,
        descriptor: &CapabilityDescriptor,
        plan: &ExecutionPlan,
        understanding: &Understanding,
    ) -> Option<String> {
        // The announcement flow runs its own confirmation state machine;
        // gating here would make the user confirm twice.
        if descriptor.manages_own_confirmation {
            return None;
        }
        if descriptor.requires_confirmation {
            return Some("capability requires confirmation".to_owned());
        }
        if descriptor.risk_level == RiskLevel::High {
            return Some("high risk capability".to_owned());
        }
        if plan.confidence < self.confirmation_threshold {
            return Some(format!("confidence {:.2} below threshold", plan.confidence));
        }
        if recipient_count(&plan.parameters) >= RECIPIENT_CONFIRMATION_FLOOR {
            return Some("three or more recipients".to_owned());
        }
        if let Some(amount) = monetary_amount(&plan.parameters) {
            if amount > self.amount_threshold {
                return Some("monetary amount above threshold".to_owned());
            }
        }
        let text = plan.parameters.to_string();
        if DESTRUCTIVE_VERBS.iter().any(|verb| text.contains(verb))
            && !understanding.alternates.is_empty()
        {
            return Some("destructive verb with multiple targets".to_owned());
        }
        None
    }

    /// Evaluate the plan against active teachings (category-filtered) and
    /// the closed no-go set.
    ///
    /// The closed set applies unconditionally; each category guard is
    /// live only while the tenant has an active verified teaching in that
    /// category, and a triggered guard bumps the teaching's usage count.
    async fn value_alignment(
        &self,
        db: &TenantDb,
        plan: &ExecutionPlan,
    ) -> Result<Alignment, StoreError> {
        let outbound_text = ["message", "body", "statement"]
            .iter()
            .filter_map(|key| plan.parameters.get(*key).and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        if outbound_text.is_empty() {
            return Ok(Alignment::Pass);
        }

        for phrase in BLOCKED_PHRASES {
            if outbound_text.contains(phrase) {
                return Ok(Alignment::Block(format!("no-go phrase matched: {phrase}")));
            }
        }
        for phrase in REFORM_PHRASES {
            if outbound_text.contains(phrase) {
                return Ok(Alignment::Reform(format!("reform phrase matched: {phrase}")));
            }
        }

        let teachings = db
            .teachings_in_categories(GUARDED_CATEGORIES, 10)
            .await?;
        if teachings.is_empty() {
            return Ok(Alignment::Pass);
        }

        for guard in CATEGORY_GUARDS {
            let Some(teaching) = teachings
                .iter()
                .find(|t| guard.categories.contains(&t.category.as_str()))
            else {
                continue;
            };
            for token in guard.block {
                if outbound_text.contains(token) {
                    let _ = db.bump_teaching_usage(teaching.id).await;
                    return Ok(Alignment::Block(format!(
                        "{} guard: blocked token {token}",
                        teaching.category
                    )));
                }
            }
            for token in guard.reform {
                if outbound_text.contains(token) {
                    let _ = db.bump_teaching_usage(teaching.id).await;
                    return Ok(Alignment::Reform(format!(
                        "{} guard: reform token {token}",
                        teaching.category
                    )));
                }
            }
        }

        // Mission-language conflicts: dismissive wording next to a term
        // from a declared mission/vision/values statement.
        for teaching in &teachings {
            if !matches!(teaching.category.as_str(), "mission" | "vision" | "values") {
                continue;
            }
            if MISSION_DISMISSALS.iter().any(|d| outbound_text.contains(d))
                && shares_statement_term(&teaching.statement, &outbound_text)
            {
                let _ = db.bump_teaching_usage(teaching.id).await;
                return Ok(Alignment::Reform(format!(
                    "{} guard: dismissive wording against \"{}\"",
                    teaching.category,
                    teaching.statement.chars().take(30).collect::<String>()
                )));
            }
        }

        Ok(Alignment::Pass)
    }
}

enum Alignment {
    Pass,
    Reform(String),
    Block(String),
}

/// Does the outbound text share a term with the teaching statement?
///
/// English words compare whole; Japanese statements have no whitespace, so
/// character bigrams over the non-ASCII runs stand in for tokenization.
fn shares_statement_term(statement: &str, text: &str) -> bool {
    let text_lower = text.to_lowercase();
    for word in statement
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
    {
        if word.chars().count() >= 3 && text_lower.contains(word) {
            return true;
        }
    }
    let chars: Vec<char> = statement.chars().filter(|c| !c.is_ascii()).collect();
    chars.windows(2).any(|window| {
        let bigram: String = window.iter().collect();
        text.contains(&bigram)
    })
}

fn denominator_as_f64(denominator: usize) -> f64 {
    f64::from(u32::try_from(denominator).unwrap_or(u32::MAX))
}

fn refuse_nothing_available() -> DecisionOutcome {
    DecisionOutcome {
        decision: Decision::Refuse(Refusal {
            user_message: "利用できる操作がありません。".to_owned(),
            policy_code: "no_capability",
        }),
        guardrail: GuardrailAction::Blocked,
        policy_reason: Some("no enabled capability for role".to_owned()),
    }
}

/// Recipient count hinted by the entities.
fn recipient_count(parameters: &Value) -> u64 {
    if let Some(count) = parameters.get("recipient_count").and_then(Value::as_u64) {
        return count;
    }
    parameters
        .get("recipients")
        .and_then(Value::as_array)
        .map(|list| u64::try_from(list.len()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Monetary amount hinted by the entities.
fn monetary_amount(parameters: &Value) -> Option<f64> {
    parameters.get("amount").and_then(Value::as_f64)
}

fn confirmation_question(descriptor: &CapabilityDescriptor, plan: &ExecutionPlan) -> String {
    let detail = plan
        .parameters
        .get("message")
        .or_else(|| plan.parameters.get("body"))
        .and_then(Value::as_str)
        .map(|text| {
            let excerpt: String = text.chars().take(60).collect();
            format!("「{excerpt}」")
        })
        .unwrap_or_default();
    format!(
        "{}を実行してよろしいですか？{detail}",
        descriptor.display_name
    )
}

fn confirmation_options(
    descriptor: &CapabilityDescriptor,
    understanding: &Understanding,
    _context: &MemoryContext,
) -> Vec<String> {
    let mut options = vec!["はい".to_owned(), "やめる".to_owned()];
    if let Some(alternate) = understanding.alternates.first() {
        if alternate != descriptor.key {
            options.push(format!("別の操作（{alternate}）"));
        }
    }
    options.truncate(3);
    options
}

/// Options for the "which one did you mean" confirmation: the last two
/// task names plus the most recent announcement reference.
fn ambiguity_options(context: &MemoryContext) -> Vec<String> {
    let mut options: Vec<String> = context
        .tasks
        .iter()
        .take(2)
        .map(|task| {
            let excerpt: String = task.body.chars().take(40).collect();
            format!("タスク: {excerpt}")
        })
        .collect();
    if let Some(insight) = context.insights.first() {
        options.push(format!("お知らせ: {}", insight.title));
    }
    options.truncate(3);
    options
}
