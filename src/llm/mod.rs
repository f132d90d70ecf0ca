//! LLM provider seam.
//!
//! [`LlmPort`] is the only way the Brain reaches a language model. The HTTP
//! implementation lives in [`client`]; tests substitute mocks. Transient
//! failures retry with exponential backoff and ±50 % jitter, three attempts
//! total. Understanding and Execution issue distinct calls; they are never
//! merged.

pub mod client;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which configured model a call should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// The reasoning model (understanding, value-laden rewrites).
    Primary,
    /// The fast model (summaries, field extraction).
    Fast,
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub tier: ModelTier,
    /// System prompt framing the task.
    pub system: String,
    /// User content.
    pub prompt: String,
    pub max_tokens: u32,
    /// When set, the prompt demands a single JSON object and the response
    /// is parsed as one.
    pub json_mode: bool,
}

/// Token accounting surfaced into the decision log.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Combine usage across multiple calls in one request.
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub model_id: String,
    pub usage: TokenUsage,
}

/// LLM provider errors.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network-level failure (retryable).
    #[error("llm transport error: {0}")]
    Transport(String),
    /// 429 or 5xx from the provider (retryable).
    #[error("llm unavailable: status {0}")]
    Unavailable(u16),
    /// 4xx other than 429 (not retryable).
    #[error("llm rejected request: status {0}")]
    Rejected(u16),
    /// Response body did not parse.
    #[error("llm response malformed: {0}")]
    Malformed(String),
    /// Deadline elapsed.
    #[error("llm call timed out")]
    Timeout,
}

impl LlmError {
    /// Whether the retry policy applies.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Unavailable(_) | Self::Timeout
        )
    }
}

/// The provider seam.
#[async_trait]
pub trait LlmPort: Send + Sync {
    /// Issue a single completion.
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Retry attempts for transient upstream failures.
pub const RETRY_ATTEMPTS: u32 = 3;

/// Base delay for the first retry.
const RETRY_BASE: Duration = Duration::from_millis(400);

/// Compute the backoff delay for an attempt (0-based), with ±50 % jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE.saturating_mul(2_u32.saturating_pow(attempt));
    let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.5);
    exp.mul_f64(jitter)
}

/// Run a completion with the standard retry policy.
///
/// # Errors
///
/// Returns the final error once attempts are exhausted, or immediately for
/// non-transient failures.
pub async fn complete_with_retry(
    port: &dyn LlmPort,
    request: LlmRequest,
) -> Result<LlmResponse, LlmError> {
    let mut last_err = None;
    for attempt in 0..RETRY_ATTEMPTS {
        match port.complete(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(err) if err.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                tracing::warn!(attempt, error = %err, "llm call failed, retrying");
                tokio::time::sleep(backoff_delay(attempt)).await;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| LlmError::Transport("retries exhausted".to_owned())))
}

/// Extract a JSON object from model output, tolerating code fences and
/// surrounding prose.
///
/// # Errors
///
/// Returns [`LlmError::Malformed`] when no JSON object can be recovered.
pub fn parse_json_output(text: &str) -> Result<serde_json::Value, LlmError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Ok(value);
    }
    // Fall back to the outermost brace pair.
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }
    Err(LlmError::Malformed(format!(
        "no JSON object in {} chars of output",
        text.chars().count()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyPort {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmPort for FlakyPort {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(LlmError::Unavailable(503))
            } else {
                Ok(LlmResponse {
                    text: "ok".to_owned(),
                    model_id: "mock".to_owned(),
                    usage: TokenUsage::default(),
                })
            }
        }
    }

    fn request() -> LlmRequest {
        LlmRequest {
            tier: ModelTier::Fast,
            system: "test".to_owned(),
            prompt: "hello".to_owned(),
            max_tokens: 64,
            json_mode: false,
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let port = FlakyPort {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        };
        let response = complete_with_retry(&port, request()).await.expect("succeeds");
        assert_eq!(response.text, "ok");
        assert_eq!(port.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_error() {
        let port = FlakyPort {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
        };
        let err = complete_with_retry(&port, request()).await.expect_err("fails");
        assert!(err.is_transient());
        assert_eq!(port.calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn rejected_is_not_retried() {
        struct RejectingPort(AtomicU32);
        #[async_trait]
        impl LlmPort for RejectingPort {
            async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Rejected(400))
            }
        }
        let port = RejectingPort(AtomicU32::new(0));
        let err = complete_with_retry(&port, request()).await.expect_err("fails");
        assert!(!err.is_transient());
        assert_eq!(port.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn json_recovered_from_fenced_output() {
        let out = "Here you go:\n```json\n{\"intent\": \"task_search\", \"confidence\": 0.9}\n```";
        let value = parse_json_output(out).expect("parse");
        assert_eq!(value["intent"], "task_search");
    }

    #[test]
    fn json_plain_object() {
        let value = parse_json_output("{\"a\": 1}").expect("parse");
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn non_json_rejected() {
        assert!(parse_json_output("I could not decide").is_err());
    }

    #[test]
    fn backoff_grows_with_jitter_bounds() {
        for attempt in 0..3 {
            let d = backoff_delay(attempt);
            let base = 400u64 * 2u64.pow(attempt);
            assert!(d.as_millis() >= u128::from(base / 2));
            assert!(d.as_millis() <= u128::from(base * 3 / 2) + 1);
        }
    }
}
