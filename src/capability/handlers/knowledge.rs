//! Knowledge query capability.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::brain::memory::MemoryContext;
use crate::capability::{CapabilityHandler, Envelope, HandlerError, HandlerResult};
use crate::knowledge::KnowledgePort;
use crate::llm::{complete_with_retry, LlmPort, LlmRequest, ModelTier};
use crate::types::Classification;

/// Chunks retrieved per query.
const TOP_K: usize = 3;

/// Answer from the tenant's knowledge base.
pub struct KnowledgeQueryHandler {
    knowledge: Arc<dyn KnowledgePort>,
    llm: Arc<dyn LlmPort>,
}

impl KnowledgeQueryHandler {
    pub fn new(knowledge: Arc<dyn KnowledgePort>, llm: Arc<dyn LlmPort>) -> Self {
        Self { knowledge, llm }
    }
}

#[async_trait]
impl CapabilityHandler for KnowledgeQueryHandler {
    async fn run(
        &self,
        params: &Value,
        envelope: &Envelope,
        _context: &MemoryContext,
    ) -> Result<HandlerResult, HandlerError> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::ParameterInvalid("query".to_owned()))?;

        let chunks = self
            .knowledge
            .search(envelope.tenant_id, query, TOP_K, Classification::Confidential)
            .await
            .map_err(|e| HandlerError::UpstreamUnavailable(e.to_string()))?;

        if chunks.is_empty() {
            return Ok(HandlerResult::message(
                "該当する社内情報が見つかりませんでした。別の言い方で聞いていただけますか？",
            ));
        }

        let sources: Vec<String> = chunks
            .iter()
            .filter_map(|chunk| chunk.source.clone())
            .collect();
        let excerpts = chunks
            .iter()
            .map(|chunk| chunk.content.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n");

        // Synthesize with the fast model; degrade to the best excerpt.
        let request = LlmRequest {
            tier: ModelTier::Fast,
            system: "社内ナレッジの抜粋だけを根拠に、質問へ日本語で簡潔に答えてください。\
                     抜粋にないことは「資料にはありません」と答えます。"
                .to_owned(),
            prompt: format!("質問: {query}\n抜粋:\n{excerpts}"),
            max_tokens: 500,
            json_mode: false,
        };
        let answer = match complete_with_retry(self.llm.as_ref(), request).await {
            Ok(response) if !response.text.trim().is_empty() => response.text.trim().to_owned(),
            Ok(_) | Err(_) => {
                warn!("knowledge synthesis unavailable, returning excerpt");
                let excerpt: String = chunks[0].content.chars().take(300).collect();
                excerpt
            }
        };

        Ok(HandlerResult::message(answer).with_data(json!({
            "chunks": chunks.len(),
            "sources": sources,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{KnowledgeChunk, KnowledgeError};
    use crate::llm::{LlmError, LlmResponse, TokenUsage};
    use crate::types::{RoleLevel, SenderIdentity};
    use uuid::Uuid;

    struct FixedKnowledge(Vec<KnowledgeChunk>);

    #[async_trait]
    impl KnowledgePort for FixedKnowledge {
        async fn search(
            &self,
            _tenant_id: Uuid,
            _query: &str,
            _top_k: usize,
            _max_classification: Classification,
        ) -> Result<Vec<KnowledgeChunk>, KnowledgeError> {
            Ok(self.0.clone())
        }
    }

    struct DownLlm;

    #[async_trait]
    impl LlmPort for DownLlm {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            Err(LlmError::Unavailable(503))
        }
    }

    struct EchoLlm;

    #[async_trait]
    impl LlmPort for EchoLlm {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                text: "経費精算は月末締めです。".to_owned(),
                model_id: "mock-fast".to_owned(),
                usage: TokenUsage::default(),
            })
        }
    }

    fn chunk(content: &str) -> KnowledgeChunk {
        KnowledgeChunk {
            id: Uuid::new_v4(),
            content: content.to_owned(),
            source: Some("rules.md".to_owned()),
            classification: Classification::Internal,
            score: 0.9,
        }
    }

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
    async fn synthesized_answer_with_sources() {
        let handler = KnowledgeQueryHandler::new(
            Arc::new(FixedKnowledge(vec![chunk("経費精算は月末締め、翌月10日払い")])),
            Arc::new(EchoLlm),
        );
        let result = handler
            .run(&json!({"query": "経費精算の締め日"}), &envelope(), &context())
            .await
            .expect("run");
        assert!(result.user_message.contains("月末"));
        assert_eq!(result.data["chunks"], 1);
    }

    #[tokio::test]
    async fn llm_outage_degrades_to_excerpt() {
        let handler = KnowledgeQueryHandler::new(
            Arc::new(FixedKnowledge(vec![chunk("経費精算は月末締めです")])),
            Arc::new(DownLlm),
        );
        let result = handler
            .run(&json!({"query": "経費精算"}), &envelope(), &context())
            .await
            .expect("run");
        assert!(result.user_message.contains("経費精算"));
    }

    #[tokio::test]
    async fn empty_results_reply_politely() {
        let handler =
            KnowledgeQueryHandler::new(Arc::new(FixedKnowledge(vec![])), Arc::new(DownLlm));
        let result = handler
            .run(&json!({"query": "宇宙旅行規定"}), &envelope(), &context())
            .await
            .expect("run");
        assert!(result.user_message.contains("見つかりませんでした"));
    }
}
