//! Execution layer: parameter validation, handler dispatch, chaining.
//!
//! Handlers run under a deadline and never see unvalidated parameters.
//! Missing required parameters flip the request into a targeted
//! confirmation instead of failing. Chained `next_action`s re-enter
//! through the same registry path, bounded to depth three.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Utc, Weekday};
use serde_json::{json, Value};
use tracing::warn;

use super::decision::ExecutionPlan;
use super::memory::MemoryContext;
use super::state::parameter_question;
use crate::capability::{
    CapabilityRegistry, Envelope, HandlerError, HandlerRegistry, HandlerResult, ParamKind,
    ParameterSpec,
};
use crate::store::TenantDb;

/// Maximum chained handler invocations per request.
const MAX_CHAIN_DEPTH: usize = 3;

/// Canonical reply for a timed-out handler.
pub const STILL_WORKING: &str = "処理に時間がかかっています。完了したらお知らせします。";

/// What Execution produced.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// A final result (possibly `success = false` with a user-safe
    /// message and an `error_code` in `data`).
    Completed(HandlerResult),
    /// Required parameters are missing: ask for the first one and park
    /// the plan.
    NeedParameters {
        plan: ExecutionPlan,
        missing: Vec<String>,
        question: String,
    },
}

/// The Execution engine.
pub struct ExecutionEngine {
    registry: Arc<CapabilityRegistry>,
    handlers: Arc<HandlerRegistry>,
    handler_deadline: Duration,
}

impl ExecutionEngine {
    /// Create an engine.
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        handlers: Arc<HandlerRegistry>,
        handler_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            handlers,
            handler_deadline,
        }
    }

    /// Validate and run a plan, following chained actions.
    pub async fn execute(
        &self,
        db: &TenantDb,
        plan: &ExecutionPlan,
        envelope: &Envelope,
        context: &MemoryContext,
    ) -> ExecutionOutcome {
        let timezone = db
            .tenant_timezone()
            .await
            .unwrap_or_else(|_| "Asia/Tokyo".to_owned());

        let mut current = plan.clone();
        let mut combined: Option<HandlerResult> = None;

        for depth in 0..MAX_CHAIN_DEPTH {
            let Some(descriptor) = self.registry.get(&current.capability_key) else {
                return ExecutionOutcome::Completed(failure(
                    HandlerError::NotFound(current.capability_key.clone()),
                ));
            };

            // Validate and coerce against the declared schema.
            match validate_parameters(&descriptor.parameters, &current.parameters, &timezone, envelope.now)
            {
                Validated::Ok(parameters) => current.parameters = parameters,
                Validated::Missing(missing) => {
                    let question = parameter_question(&missing[0]);
                    return ExecutionOutcome::NeedParameters {
                        plan: current,
                        missing,
                        question,
                    };
                }
                Validated::Invalid(parameter) => {
                    return ExecutionOutcome::NeedParameters {
                        question: parameter_question(&parameter),
                        missing: vec![parameter],
                        plan: current,
                    };
                }
            }

            let Some(handler) = self.handlers.get(descriptor.handler_key) else {
                return ExecutionOutcome::Completed(failure(HandlerError::Internal(format!(
                    "no handler for {}",
                    descriptor.handler_key
                ))));
            };

            let outcome = tokio::time::timeout(
                self.handler_deadline,
                handler.run(&current.parameters, envelope, context),
            )
            .await;

            let mut result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    warn!(capability = %current.capability_key, code = err.code(), "handler failed");
                    failure(err)
                }
                Err(_) => {
                    warn!(capability = %current.capability_key, "handler deadline exceeded");
                    let mut result = failure(HandlerError::Timeout);
                    result.user_message = STILL_WORKING.to_owned();
                    result
                }
            };

            // Offer descriptor chain hints when the handler declared none.
            if result.success && result.suggestions.is_empty() && current.followups_allowed {
                result.suggestions = descriptor
                    .chain_hints
                    .iter()
                    .take(3)
                    .map(|hint| (*hint).to_owned())
                    .collect();
            }

            let next = result.next_action.take().map(|action| {
                let params = result.next_params.take().unwrap_or_else(|| json!({}));
                (action, params)
            });

            combined = Some(match combined.take() {
                None => result,
                Some(previous) => merge(previous, result),
            });

            match next {
                Some((action, parameters)) if depth + 1 < MAX_CHAIN_DEPTH => {
                    current = ExecutionPlan {
                        capability_key: action,
                        parameters,
                        confidence: current.confidence,
                        reasoning: "chained action".to_owned(),
                        alternates: Vec::new(),
                        followups_allowed: false,
                    };
                }
                Some((action, _)) => {
                    warn!(action = %action, "chain depth exceeded, dropping follow-on action");
                    break;
                }
                None => break,
            }

            // A failed link stops the chain.
            if combined.as_ref().is_some_and(|result| !result.success) {
                break;
            }
        }

        ExecutionOutcome::Completed(combined.unwrap_or_else(|| {
            failure(HandlerError::Internal("empty execution".to_owned()))
        }))
    }
}

fn failure(err: HandlerError) -> HandlerResult {
    HandlerResult {
        success: false,
        user_message: err.user_message().to_owned(),
        data: json!({"error_code": err.code()}),
        next_action: None,
        next_params: None,
        state_delta: None,
        suggestions: Vec::new(),
    }
}

fn merge(mut first: HandlerResult, second: HandlerResult) -> HandlerResult {
    first.user_message = format!("{}\n{}", first.user_message, second.user_message);
    first.success = first.success && second.success;
    if second.state_delta.is_some() {
        first.state_delta = second.state_delta;
    }
    if !second.suggestions.is_empty() {
        first.suggestions = second.suggestions;
    }
    first.data = json!({"first": first.data, "then": second.data});
    first
}

enum Validated {
    Ok(Value),
    Missing(Vec<String>),
    Invalid(String),
}

/// Validate required presence and coerce types explicitly.
fn validate_parameters(
    specs: &[ParameterSpec],
    raw: &Value,
    timezone: &str,
    now: DateTime<Utc>,
) -> Validated {
    let mut coerced = serde_json::Map::new();
    let mut missing = Vec::new();

    for spec in specs {
        let value = raw.get(spec.name).filter(|v| !v.is_null());
        match value {
            None => {
                if spec.required {
                    missing.push(spec.name.to_owned());
                }
            }
            Some(value) => match coerce(spec.kind, value, timezone, now) {
                Some(coerced_value) => {
                    coerced.insert(spec.name.to_owned(), coerced_value);
                }
                None => return Validated::Invalid(spec.name.to_owned()),
            },
        }
    }

    if !missing.is_empty() {
        return Validated::Missing(missing);
    }
    Validated::Ok(Value::Object(coerced))
}

fn coerce(kind: ParamKind, value: &Value, timezone: &str, now: DateTime<Utc>) -> Option<Value> {
    match kind {
        ParamKind::Text => match value {
            Value::String(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| json!(trimmed))
            }
            other => Some(json!(other.to_string())),
        },
        ParamKind::AccountId => match value {
            Value::String(text) => Some(json!(text.trim())),
            Value::Number(number) => Some(json!(number.to_string())),
            _ => None,
        },
        ParamKind::Integer => match value {
            Value::Number(number) => number.as_i64().map(|n| json!(n)),
            Value::String(text) => text.trim().parse::<i64>().ok().map(|n| json!(n)),
            _ => None,
        },
        ParamKind::Number => match value {
            Value::Number(number) => number.as_f64().map(|n| json!(n)),
            Value::String(text) => parse_locale_number(text).map(|n| json!(n)),
            _ => None,
        },
        ParamKind::Boolean => match value {
            Value::Bool(flag) => Some(json!(flag)),
            Value::String(text) => match text.trim().to_lowercase().as_str() {
                "true" | "yes" | "はい" | "1" => Some(json!(true)),
                "false" | "no" | "いいえ" | "0" => Some(json!(false)),
                _ => None,
            },
            _ => None,
        },
        ParamKind::Date => match value {
            Value::String(text) => {
                coerce_date(text, timezone, now).map(|dt| json!(dt.to_rfc3339()))
            }
            _ => None,
        },
        ParamKind::TextList => match value {
            Value::Array(items) => Some(json!(items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .collect::<Vec<_>>())),
            Value::String(text) => Some(json!(text
                .split(['、', ','])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>())),
            _ => None,
        },
    }
}

/// Parse amounts like "12,000" or "１２０００円".
fn parse_locale_number(text: &str) -> Option<f64> {
    let normalized: String = text
        .chars()
        .filter_map(|c| match c {
            '０'..='９' => char::from_u32(u32::from(c) - u32::from('０') + u32::from('0')),
            ',' | '，' | '円' | '¥' | ' ' | '　' => None,
            other => Some(other),
        })
        .collect();
    normalized.parse::<f64>().ok()
}

/// Parse a date expression against the tenant timezone.
///
/// Accepts RFC 3339, `YYYY-MM-DD[ HH:MM]`, relative day words
/// (今日/明日/明後日) with an optional hour, and weekday names resolved to
/// their next occurrence at end of business day.
pub fn coerce_date(text: &str, timezone: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }

    let tz: chrono_tz::Tz = timezone.parse().ok()?;
    let local_now = now.with_timezone(&tz);

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return local_date_time(&tz, date, 23, 59);
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M") {
        return tz.from_local_datetime(&naive).single().map(|dt| dt.with_timezone(&Utc));
    }

    let hour = extract_hour(trimmed);
    let relative_days = if trimmed.contains("明後日") {
        Some(2)
    } else if trimmed.contains("明日") || trimmed.to_lowercase().contains("tomorrow") {
        Some(1)
    } else if trimmed.contains("今日") || trimmed.to_lowercase().contains("today") {
        Some(0)
    } else {
        None
    };
    if let Some(days) = relative_days {
        let date = local_now.date_naive() + ChronoDuration::days(days);
        let (h, m) = hour.unwrap_or((23, 59));
        return local_date_time(&tz, date, h, m);
    }

    if let Some(weekday) = parse_weekday(trimmed) {
        let mut date = local_now.date_naive() + ChronoDuration::days(1);
        while date.weekday() != weekday {
            date = date + ChronoDuration::days(1);
        }
        let (h, m) = hour.unwrap_or((23, 59));
        return local_date_time(&tz, date, h, m);
    }

    None
}

fn local_date_time(tz: &chrono_tz::Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    tz.with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, 0)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn extract_hour(text: &str) -> Option<(u32, u32)> {
    // "18:00" or "18時" forms.
    if let Some(index) = text.find(':') {
        let hour: u32 = text[..index]
            .chars()
            .rev()
            .take_while(char::is_ascii_digit)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<String>()
            .parse()
            .ok()?;
        let minute: u32 = text[index.saturating_add(1)..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .ok()?;
        if hour < 24 && minute < 60 {
            return Some((hour, minute));
        }
    }
    if let Some(index) = text.find('時') {
        let digits: String = text[..index]
            .chars()
            .rev()
            .take_while(char::is_ascii_digit)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if let Ok(hour) = digits.parse::<u32>() {
            if hour < 24 {
                return Some((hour, 0));
            }
        }
    }
    None
}

fn parse_weekday(text: &str) -> Option<Weekday> {
    let lowered = text.to_lowercase();
    let table: &[(&str, Weekday)] = &[
        ("月曜", Weekday::Mon),
        ("火曜", Weekday::Tue),
        ("水曜", Weekday::Wed),
        ("木曜", Weekday::Thu),
        ("金曜", Weekday::Fri),
        ("土曜", Weekday::Sat),
        ("日曜", Weekday::Sun),
        ("monday", Weekday::Mon),
        ("tuesday", Weekday::Tue),
        ("wednesday", Weekday::Wed),
        ("thursday", Weekday::Thu),
        ("friday", Weekday::Fri),
        ("saturday", Weekday::Sat),
        ("sunday", Weekday::Sun),
    ];
    table
        .iter()
        .find(|(name, _)| lowered.contains(name))
        .map(|(_, weekday)| *weekday)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::handlers::{build_registry, HandlerDeps};
    use crate::capability::{CapabilityHandler, CapabilityRegistry};
    use crate::knowledge::SqliteKnowledge;
    use crate::store::testutil::{seed_person, seed_tenant, seed_user};
    use crate::store::Db;
    use crate::types::{RoleLevel, SenderIdentity};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct DownLlm;

    #[async_trait]
    impl crate::llm::LlmPort for DownLlm {
        async fn complete(
            &self,
            _request: crate::llm::LlmRequest,
        ) -> Result<crate::llm::LlmResponse, crate::llm::LlmError> {
            Err(crate::llm::LlmError::Unavailable(503))
        }
    }

    async fn engine_for(db: &Arc<Db>) -> ExecutionEngine {
        let chat = Arc::new(crate::announce::executor::tests::MockChat::default());
        let llm: Arc<dyn crate::llm::LlmPort> = Arc::new(DownLlm);
        let announce = Arc::new(crate::announce::flow::AnnouncementFlow::for_tests(db).await);
        let deps = HandlerDeps {
            db: db.clone(),
            chat_tasks: chat,
            knowledge: Arc::new(SqliteKnowledge::new(db)),
            llm,
            announce,
        };
        let registry = Arc::new(CapabilityRegistry::with_defaults());
        let handlers = Arc::new(build_registry(&deps));
        registry.validate(&handlers).expect("registry invariants");
        ExecutionEngine::new(registry, handlers, Duration::from_secs(5))
    }

    fn plan(key: &str, parameters: Value) -> ExecutionPlan {
        ExecutionPlan {
            capability_key: key.to_owned(),
            parameters,
            confidence: 0.9,
            reasoning: "test".to_owned(),
            alternates: vec![],
            followups_allowed: true,
        }
    }

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
    async fn missing_required_parameter_asks() {
        let db = Arc::new(Db::open_in_memory().await.expect("open"));
        let t = seed_tenant(&db, "org-1").await;
        let user = seed_user(&db, t, "acct-1", "Sato", 3).await;
        let engine = engine_for(&db).await;

        let outcome = engine
            .execute(
                &db.tenant(t),
                &plan("task_create", json!({"assignee": "太郎"})),
                &envelope(t, user),
                &context(user),
            )
            .await;
        match outcome {
            ExecutionOutcome::NeedParameters { missing, question, .. } => {
                assert_eq!(missing, vec!["body".to_owned()]);
                assert!(question.contains("内容"));
            }
            other => panic!("expected NeedParameters, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn date_parameter_coerced_against_tenant_timezone() {
        let db = Arc::new(Db::open_in_memory().await.expect("open"));
        let t = seed_tenant(&db, "org-1").await;
        let user = seed_user(&db, t, "acct-1", "Sato", 3).await;
        seed_person(&db, t, "太郎", Some("acct-taro")).await;
        let engine = engine_for(&db).await;

        let outcome = engine
            .execute(
                &db.tenant(t),
                &plan(
                    "task_create",
                    json!({"assignee": "太郎", "body": "資料準備", "deadline": "金曜"}),
                ),
                &envelope(t, user),
                &context(user),
            )
            .await;
        match outcome {
            ExecutionOutcome::Completed(result) => {
                assert!(result.success, "{}", result.user_message);
                assert!(result.user_message.contains("期限"));
                // Scenario 2: the create-success reply carries the
                // reminder suggestion from the chain hints.
                assert!(!result.suggestions.is_empty());
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_error_folds_to_safe_message() {
        let db = Arc::new(Db::open_in_memory().await.expect("open"));
        let t = seed_tenant(&db, "org-1").await;
        let user = seed_user(&db, t, "acct-1", "Sato", 3).await;
        let engine = engine_for(&db).await;

        // Unknown assignee: NotFound surfaces as a safe sentence.
        let outcome = engine
            .execute(
                &db.tenant(t),
                &plan("task_create", json!({"assignee": "誰それ", "body": "x"})),
                &envelope(t, user),
                &context(user),
            )
            .await;
        match outcome {
            ExecutionOutcome::Completed(result) => {
                assert!(!result.success);
                assert_eq!(result.data["error_code"], "not_found");
                assert!(!result.user_message.contains("誰それ"), "no entity echo");
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chained_action_depth_is_bounded() {
        struct LoopingHandler;
        #[async_trait]
        impl CapabilityHandler for LoopingHandler {
            async fn run(
                &self,
                _params: &Value,
                _envelope: &Envelope,
                _context: &MemoryContext,
            ) -> Result<HandlerResult, HandlerError> {
                Ok(HandlerResult::message("step").then("loop_cap", json!({})))
            }
        }

        let registry = Arc::new(CapabilityRegistry::from_descriptors(vec![
            crate::capability::CapabilityDescriptor {
                key: "loop_cap",
                display_name: "loop",
                description: "loops",
                category: "test",
                enabled: true,
                required_role_level: RoleLevel::GUEST,
                risk_level: crate::types::RiskLevel::Low,
                requires_confirmation: false,
                manages_own_confirmation: false,
                priority: 5,
                intent_keywords: crate::capability::KeywordSet::of(&["loop"], &[], &[]),
                decision_keywords: crate::capability::KeywordSet::of(&["loop"], &[], &[]),
                parameters: vec![],
                handler_key: "loop_cap",
                chain_hints: vec![],
            },
        ]));
        let mut handlers = HandlerRegistry::new();
        handlers.register("loop_cap", Arc::new(LoopingHandler));
        let engine = ExecutionEngine::new(registry, Arc::new(handlers), Duration::from_secs(5));

        let db = Arc::new(Db::open_in_memory().await.expect("open"));
        let t = seed_tenant(&db, "org-1").await;
        let user = Uuid::new_v4();
        let outcome = engine
            .execute(
                &db.tenant(t),
                &plan("loop_cap", json!({})),
                &envelope(t, user),
                &context(user),
            )
            .await;
        match outcome {
            ExecutionOutcome::Completed(result) => {
                // Exactly three invocations despite the endless chain.
                assert_eq!(result.user_message.matches("step").count(), 3);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn date_coercion_forms() {
        let now = DateTime::parse_from_rfc3339("2026-08-03T03:00:00Z")
            .expect("parse")
            .with_timezone(&Utc); // Monday 12:00 JST
        let friday = coerce_date("金曜", "Asia/Tokyo", now).expect("weekday");
        assert_eq!(friday.with_timezone(&chrono_tz::Asia::Tokyo).weekday(), Weekday::Fri);

        let tomorrow_18 = coerce_date("明日 18:00", "Asia/Tokyo", now).expect("relative");
        let local = tomorrow_18.with_timezone(&chrono_tz::Asia::Tokyo);
        assert_eq!(local.format("%H:%M").to_string(), "18:00");

        assert!(coerce_date("2026-09-01", "Asia/Tokyo", now).is_some());
        assert!(coerce_date("そのうち", "Asia/Tokyo", now).is_none());
    }

    #[test]
    fn locale_number_parsing() {
        assert_eq!(parse_locale_number("12,000"), Some(12_000.0));
        assert_eq!(parse_locale_number("１２０００円"), Some(12_000.0));
        assert_eq!(parse_locale_number("abc"), None);
    }
}
