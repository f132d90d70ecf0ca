//! Configuration loading and validation.
//!
//! Kokoro reads a single `kokoro.toml` supplemented by environment variables
//! for secrets (`KOKORO_LLM_API_KEY`, `KOKORO_CHAT_API_TOKEN`,
//! `DATABASE_URL`). TOML carries the tunables an operator adjusts; env vars
//! carry credentials that must never land in a file.

use std::path::Path;

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Webhook server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Chat service settings.
    #[serde(default)]
    pub chat: ChatConfig,

    /// Brain thresholds and deadlines.
    #[serde(default)]
    pub brain: BrainConfig,

    /// Job runner settings.
    #[serde(default)]
    pub jobs: JobsConfig,
}

/// Webhook server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the webhook listener.
    #[serde(default = "default_bind")]
    pub bind: String,
}

/// LLM provider settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the completion endpoint.
    #[serde(default = "default_llm_base")]
    pub base_url: String,
    /// Primary model for reasoning (understanding, announcement rewrite).
    #[serde(default = "default_primary_model")]
    pub primary_model: String,
    /// Fast model for ambient tasks (summaries, extraction).
    #[serde(default = "default_fast_model")]
    pub fast_model: String,
    /// Sampling temperature for reasoning calls.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Per-call timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

/// Chat service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// Base URL of the chat service API.
    #[serde(default = "default_chat_base")]
    pub base_url: String,
    /// Sends allowed per minute per tenant (token bucket capacity).
    #[serde(default = "default_sends_per_minute")]
    pub sends_per_minute: u32,
}

/// Brain thresholds and deadlines.
#[derive(Debug, Clone, Deserialize)]
pub struct BrainConfig {
    /// Hard cap on a single request, in seconds.
    #[serde(default = "default_request_deadline")]
    pub request_deadline_secs: u64,
    /// Per-handler execution deadline, in seconds.
    #[serde(default = "default_handler_deadline")]
    pub handler_deadline_secs: u64,
    /// Per-fetch memory deadline, in seconds.
    #[serde(default = "default_fetch_deadline")]
    pub memory_fetch_deadline_secs: u64,
    /// Aggregate memory deadline, in seconds.
    #[serde(default = "default_memory_deadline")]
    pub memory_aggregate_deadline_secs: u64,
    /// Seconds a second message waits for the serial lock before the
    /// "one moment" acknowledgement is sent.
    #[serde(default = "default_lock_wait")]
    pub serial_lock_wait_secs: u64,
    /// Confidence below which Decision demands a confirmation.
    #[serde(default = "default_confirm_threshold")]
    pub confirmation_threshold: f64,
    /// Default room fuzzy-match score for auto-picking a target room.
    /// Admin config can override this per tenant.
    #[serde(default = "default_room_threshold")]
    pub room_match_threshold: f64,
    /// Monetary amount above which a confirmation is always required.
    #[serde(default = "default_amount_threshold")]
    pub amount_confirmation_threshold: f64,
    /// Conversation state timeout, in minutes.
    #[serde(default = "default_state_timeout")]
    pub state_timeout_minutes: i64,
}

/// Job runner settings.
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Seconds between runner ticks.
    #[serde(default = "default_tick")]
    pub tick_secs: u64,
    /// Per-execution deadline for a scheduled announcement, in seconds.
    #[serde(default = "default_job_deadline")]
    pub execution_deadline_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8720".to_owned()
}
fn default_llm_base() -> String {
    "https://api.anthropic.com/v1/messages".to_owned()
}
fn default_primary_model() -> String {
    "claude-sonnet-4-5".to_owned()
}
fn default_fast_model() -> String {
    "claude-haiku-4-5".to_owned()
}
fn default_temperature() -> f64 {
    0.2
}
fn default_llm_timeout() -> u64 {
    20
}
fn default_chat_base() -> String {
    "https://api.chat.example.com/v2".to_owned()
}
fn default_sends_per_minute() -> u32 {
    50
}
fn default_request_deadline() -> u64 {
    45
}
fn default_handler_deadline() -> u64 {
    30
}
fn default_fetch_deadline() -> u64 {
    2
}
fn default_memory_deadline() -> u64 {
    3
}
fn default_lock_wait() -> u64 {
    3
}
fn default_confirm_threshold() -> f64 {
    0.7
}
fn default_room_threshold() -> f64 {
    0.8
}
fn default_amount_threshold() -> f64 {
    100_000.0
}
fn default_state_timeout() -> i64 {
    30
}
fn default_tick() -> u64 {
    30
}
fn default_job_deadline() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base(),
            primary_model: default_primary_model(),
            fast_model: default_fast_model(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: default_chat_base(),
            sends_per_minute: default_sends_per_minute(),
        }
    }
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            request_deadline_secs: default_request_deadline(),
            handler_deadline_secs: default_handler_deadline(),
            memory_fetch_deadline_secs: default_fetch_deadline(),
            memory_aggregate_deadline_secs: default_memory_deadline(),
            serial_lock_wait_secs: default_lock_wait(),
            confirmation_threshold: default_confirm_threshold(),
            room_match_threshold: default_room_threshold(),
            amount_confirmation_threshold: default_amount_threshold(),
            state_timeout_minutes: default_state_timeout(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick(),
            execution_deadline_secs: default_job_deadline(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            chat: ChatConfig::default(),
            brain: BrainConfig::default(),
            jobs: JobsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate threshold ranges.
    ///
    /// # Errors
    ///
    /// Returns an error when a threshold is outside its meaningful range.
    pub fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.llm.base_url)
            .map_err(|e| anyhow::anyhow!("llm.base_url is not a valid URL: {e}"))?;
        url::Url::parse(&self.chat.base_url)
            .map_err(|e| anyhow::anyhow!("chat.base_url is not a valid URL: {e}"))?;
        if !(0.0..=1.0).contains(&self.brain.confirmation_threshold) {
            anyhow::bail!("brain.confirmation_threshold must be within 0.0..=1.0");
        }
        if !(0.0..=1.0).contains(&self.brain.room_match_threshold) {
            anyhow::bail!("brain.room_match_threshold must be within 0.0..=1.0");
        }
        if self.brain.state_timeout_minutes <= 0 {
            anyhow::bail!("brain.state_timeout_minutes must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().expect("defaults validate");
    }

    #[test]
    fn parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
[brain]
confirmation_threshold = 0.75

[llm]
primary_model = "claude-opus-4-6"
"#,
        )
        .expect("parse");
        assert!((config.brain.confirmation_threshold - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.llm.primary_model, "claude-opus-4-6");
        // Untouched sections fall back to defaults.
        assert_eq!(config.jobs.tick_secs, 30);
    }

    #[test]
    fn bad_base_url_rejected() {
        let config: Config = toml::from_str(
            r#"
[chat]
base_url = "not a url"
"#,
        )
        .expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let config: Config = toml::from_str(
            r#"
[brain]
room_match_threshold = 1.5
"#,
        )
        .expect("parse");
        assert!(config.validate().is_err());
    }
}
