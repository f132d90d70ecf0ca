//! Goal-setting capability: opens the multi-step flow.
//!
//! The steps themselves live in the state layer's continuation; this
//! handler only starts the dialogue.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::brain::memory::MemoryContext;
use crate::capability::{CapabilityHandler, Envelope, HandlerError, HandlerResult, StateDelta};
use crate::store::conversation::{StateType, Transition};

/// Flow timeout in minutes.
const GOAL_FLOW_TIMEOUT_MINUTES: i64 = 30;

/// Start the goal-setting dialogue.
pub struct GoalSetHandler;

impl GoalSetHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GoalSetHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityHandler for GoalSetHandler {
    async fn run(
        &self,
        params: &Value,
        _envelope: &Envelope,
        _context: &MemoryContext,
    ) -> Result<HandlerResult, HandlerError> {
        let title = params
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let (step, data, question) = match title {
            Some(title) => (
                "why",
                json!({"title": title, "subject": title}),
                format!("「{title}」、いい目標ですね。なぜ達成したいのですか？"),
            ),
            None => (
                "title",
                json!({}),
                "どんな目標を立てますか？一言で教えてください。".to_owned(),
            ),
        };

        Ok(
            HandlerResult::message(question).with_state(StateDelta::Transition(Transition {
                state_type: StateType::GoalSetting,
                step: step.to_owned(),
                data,
                reference: None,
                timeout_minutes: GOAL_FLOW_TIMEOUT_MINUTES,
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RoleLevel, SenderIdentity};
    use uuid::Uuid;

    fn envelope() -> Envelope {
        Envelope {
            tenant_id: Uuid::new_v4(),
            room_id: "room-1".to_owned(),
            user_id: Uuid::new_v4(),
            account_id: "acct-1".to_owned(),
            sender_name: "Sato".to_owned(),
            now: chrono::Utc::now(),
        }
    }

    fn context() -> MemoryContext {
        MemoryContext::empty(SenderIdentity {
            user_id: Uuid::new_v4(),
            account_id: "acct-1".to_owned(),
            display_name: "Sato".to_owned(),
            role_level: RoleLevel::MEMBER,
        })
    }

    #[tokio::test]
    async fn with_title_skips_to_why() {
        let handler = GoalSetHandler::new();
        let result = handler
            .run(&json!({"title": "簿記2級合格"}), &envelope(), &context())
            .await
            .expect("run");
        match result.state_delta {
            Some(StateDelta::Transition(transition)) => {
                assert_eq!(transition.state_type, StateType::GoalSetting);
                assert_eq!(transition.step, "why");
                assert_eq!(transition.data["title"], "簿記2級合格");
            }
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn without_title_asks_for_one() {
        let handler = GoalSetHandler::new();
        let result = handler
            .run(&json!({}), &envelope(), &context())
            .await
            .expect("run");
        match result.state_delta {
            Some(StateDelta::Transition(transition)) => assert_eq!(transition.step, "title"),
            other => panic!("expected transition, got {other:?}"),
        }
    }
}
