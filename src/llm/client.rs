//! HTTP client for the messages-style completion API.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{LlmError, LlmPort, LlmRequest, LlmResponse, ModelTier, TokenUsage};
use crate::config::LlmConfig;

const API_VERSION: &str = "2023-06-01";

/// Messages-API completion client.
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    config: LlmConfig,
    api_key: String,
    client: reqwest::Client,
}

impl HttpLlmClient {
    /// Create a client from config plus the API key from the environment.
    pub fn new(config: LlmConfig, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            config,
            api_key,
            client,
        }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Primary => &self.config.primary_model,
            ModelTier::Fast => &self.config.fast_model,
        }
    }
}

#[async_trait]
impl LlmPort for HttpLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let model = self.model_for(request.tier).to_owned();
        let mut system = request.system.clone();
        if request.json_mode {
            system.push_str("\n\nRespond with a single JSON object and nothing else.");
        }

        let body = json!({
            "model": model,
            "system": system,
            "messages": [{"role": "user", "content": request.prompt}],
            "max_tokens": request.max_tokens,
            "temperature": self.config.temperature,
        });

        let response = self
            .client
            .post(&self.config.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if status == 429 || status >= 500 {
            return Err(LlmError::Unavailable(status));
        }
        if status >= 400 {
            return Err(LlmError::Rejected(status));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;

        let text = parse_content_text(&payload)?;
        let usage = parse_usage(&payload);
        Ok(LlmResponse {
            text,
            model_id: model,
            usage,
        })
    }
}

fn parse_content_text(value: &Value) -> Result<String, LlmError> {
    let Some(content_items) = value.get("content").and_then(Value::as_array) else {
        return Err(LlmError::Malformed("missing content array".to_owned()));
    };

    let mut text = String::new();
    for item in content_items {
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
        if item_type == "text" {
            text.push_str(item.get("text").and_then(Value::as_str).unwrap_or_default());
        }
    }
    Ok(text)
}

fn parse_usage(value: &Value) -> TokenUsage {
    let usage = value.get("usage");
    let read = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    TokenUsage {
        input_tokens: read("input_tokens"),
        output_tokens: read("output_tokens"),
    }
}
