//! Conversational fallback capability.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::brain::memory::MemoryContext;
use crate::capability::{CapabilityHandler, Envelope, HandlerError, HandlerResult};
use crate::llm::{complete_with_retry, LlmPort, LlmRequest, ModelTier};

/// Fixed reply when the LLM is unavailable.
const FALLBACK_REPLY: &str = "はい、ここにいますよ。何かお手伝いできることはありますか？";

/// Reply conversationally when no operation applies.
pub struct GeneralChatHandler {
    llm: Arc<dyn LlmPort>,
}

impl GeneralChatHandler {
    pub fn new(llm: Arc<dyn LlmPort>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl CapabilityHandler for GeneralChatHandler {
    async fn run(
        &self,
        params: &Value,
        envelope: &Envelope,
        context: &MemoryContext,
    ) -> Result<HandlerResult, HandlerError> {
        let text = params
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("こんにちは");

        let request = LlmRequest {
            tier: ModelTier::Fast,
            system: format!(
                "社内チャットのアシスタントです。{}さんに、短く温かい日本語で返事をしてください。\
                 業務の相談には対応できる操作（タスク、アナウンス、目標設定、ナレッジ検索）を\
                 さりげなく案内します。",
                envelope.sender_name
            ),
            prompt: format!("{}\nメッセージ: {text}", context.render_compact()),
            max_tokens: 300,
            json_mode: false,
        };

        let reply = match complete_with_retry(self.llm.as_ref(), request).await {
            Ok(response) if !response.text.trim().is_empty() => response.text.trim().to_owned(),
            _ => FALLBACK_REPLY.to_owned(),
        };
        Ok(HandlerResult::message(reply))
    }
}
