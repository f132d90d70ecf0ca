//! Capability catalog and handler contract.
//!
//! Capabilities are declarative descriptors plus a function table: adding
//! one means adding a descriptor to [`catalog`] and a handler to the
//! registry — no Brain layer changes. The registry validates its own
//! invariants at startup: every descriptor resolves to a handler, every
//! handler is referenced, and enabled descriptors carry keywords.

pub mod catalog;
pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::brain::memory::MemoryContext;
use crate::store::conversation::Transition;
use crate::types::{RiskLevel, RoleLevel};

/// Keyword sets driving intent and decision scoring.
#[derive(Debug, Clone, Default)]
pub struct KeywordSet {
    pub primary: Vec<String>,
    pub secondary: Vec<String>,
    pub negative: Vec<String>,
}

impl KeywordSet {
    /// Build from string slices (catalog convenience).
    pub fn of(primary: &[&str], secondary: &[&str], negative: &[&str]) -> Self {
        let own = |items: &[&str]| items.iter().map(|s| (*s).to_owned()).collect();
        Self {
            primary: own(primary),
            secondary: own(secondary),
            negative: own(negative),
        }
    }

    /// True when no keyword is registered at all.
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.secondary.is_empty() && self.negative.is_empty()
    }
}

/// Parameter value kinds accepted by Execution's coercion step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Text,
    Integer,
    Number,
    Boolean,
    /// Parsed against the tenant timezone.
    Date,
    /// Normalized to a string account id.
    AccountId,
    TextList,
}

/// A named parameter in a capability's schema.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

/// A declaratively registered capability.
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    pub key: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub enabled: bool,
    pub required_role_level: RoleLevel,
    pub risk_level: RiskLevel,
    pub requires_confirmation: bool,
    /// The handler runs its own confirmation state machine (announcement
    /// flow); Decision-level gating steps aside for it.
    pub manages_own_confirmation: bool,
    /// Tie-break weight, 1 (fallback) through 10.
    pub priority: u8,
    pub intent_keywords: KeywordSet,
    pub decision_keywords: KeywordSet,
    pub parameters: Vec<ParameterSpec>,
    pub handler_key: &'static str,
    /// Follow-up suggestion templates offered after success.
    pub chain_hints: Vec<&'static str>,
}

/// The static capability registry.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    descriptors: Vec<CapabilityDescriptor>,
}

impl CapabilityRegistry {
    /// Build the registry from the default catalog.
    pub fn with_defaults() -> Self {
        Self {
            descriptors: catalog::default_catalog(),
        }
    }

    /// Build from explicit descriptors (tests).
    pub fn from_descriptors(descriptors: Vec<CapabilityDescriptor>) -> Self {
        Self { descriptors }
    }

    /// Look up a descriptor by key.
    pub fn get(&self, key: &str) -> Option<&CapabilityDescriptor> {
        self.descriptors.iter().find(|d| d.key == key)
    }

    /// All descriptors.
    pub fn all(&self) -> &[CapabilityDescriptor] {
        &self.descriptors
    }

    /// Enabled descriptors the given role level may use.
    pub fn enabled_for(&self, role: RoleLevel) -> impl Iterator<Item = &CapabilityDescriptor> {
        self.descriptors
            .iter()
            .filter(move |d| d.enabled && d.required_role_level <= role)
    }

    /// Startup invariant checks against the handler registry.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn validate(&self, handlers: &HandlerRegistry) -> Result<(), String> {
        for descriptor in &self.descriptors {
            if handlers.get(descriptor.handler_key).is_none() {
                return Err(format!(
                    "capability {} references missing handler {}",
                    descriptor.key, descriptor.handler_key
                ));
            }
            if descriptor.enabled && descriptor.intent_keywords.is_empty() {
                return Err(format!(
                    "enabled capability {} has no intent keywords",
                    descriptor.key
                ));
            }
        }
        for handler_key in handlers.keys() {
            if !self.descriptors.iter().any(|d| d.handler_key == handler_key) {
                return Err(format!("handler {handler_key} referenced by no capability"));
            }
        }
        Ok(())
    }
}

/// Request envelope passed to every handler.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub tenant_id: Uuid,
    pub room_id: String,
    pub user_id: Uuid,
    pub account_id: String,
    pub sender_name: String,
    pub now: DateTime<Utc>,
}

/// Handler error taxonomy. Each maps to a user-visible sentence with no
/// internals; the code feeds the decision log.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("parameter invalid: {0}")]
    ParameterInvalid(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("handler timed out")]
    Timeout,
    #[error("permission denied")]
    PermissionDenied,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal handler error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Stable code for the decision log.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ParameterInvalid(_) => "parameter_invalid",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Timeout => "timeout",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }

    /// The sentence shown to the user. Never includes ids, paths, or
    /// upstream error text.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ParameterInvalid(_) => "入力内容をもう一度確認させてください。",
            Self::UpstreamUnavailable(_) => {
                "外部サービスに接続できませんでした。しばらくしてからもう一度お試しください。"
            }
            Self::Timeout => "処理に時間がかかっています。少々お待ちください。",
            Self::PermissionDenied => "この操作を行う権限がありません。",
            Self::NotFound(_) => "該当するものが見つかりませんでした。",
            Self::Conflict(_) => "すでに処理済みのようです。状況を確認してください。",
            Self::Internal(_) => "申し訳ありません、処理中に問題が発生しました。",
        }
    }
}

/// State change a handler may request. Applied by the Brain, never by the
/// handler itself.
#[derive(Debug, Clone)]
pub enum StateDelta {
    /// Move the conversation into (or along) a flow.
    Transition(Transition),
    /// Return the conversation to normal.
    Clear,
}

/// Uniform handler result.
#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub success: bool,
    /// Text for the Post layer to deliver. Handlers never send chat
    /// messages themselves.
    pub user_message: String,
    /// Capability-specific payload.
    pub data: Value,
    /// Optional chained capability, re-entered by Execution (depth ≤ 3).
    pub next_action: Option<String>,
    pub next_params: Option<Value>,
    pub state_delta: Option<StateDelta>,
    /// Up to three follow-up suggestions.
    pub suggestions: Vec<String>,
}

impl HandlerResult {
    /// A plain successful text reply.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            success: true,
            user_message: text.into(),
            data: Value::Null,
            next_action: None,
            next_params: None,
            state_delta: None,
            suggestions: Vec::new(),
        }
    }

    /// Attach a data payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Attach follow-up suggestions (truncated to three).
    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self.suggestions.truncate(3);
        self
    }

    /// Attach a state delta.
    pub fn with_state(mut self, delta: StateDelta) -> Self {
        self.state_delta = Some(delta);
        self
    }

    /// Chain a follow-on capability.
    pub fn then(mut self, action: impl Into<String>, params: Value) -> Self {
        self.next_action = Some(action.into());
        self.next_params = Some(params);
        self
    }
}

/// The uniform handler contract.
///
/// Handlers are pure in contract: they receive validated parameters, the
/// envelope, and the memory snapshot; they return a [`HandlerResult`].
/// They make no policy decisions, write no conversation state, and send no
/// chat messages.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Execute the capability.
    async fn run(
        &self,
        params: &Value,
        envelope: &Envelope,
        context: &MemoryContext,
    ) -> Result<HandlerResult, HandlerError>;
}

/// Handler function table keyed by `handler_key`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn CapabilityHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its key. Last registration wins.
    pub fn register(&mut self, key: &'static str, handler: Arc<dyn CapabilityHandler>) {
        self.handlers.insert(key, handler);
    }

    /// Look up a handler.
    pub fn get(&self, key: &str) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(key).cloned()
    }

    /// Registered keys.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl CapabilityHandler for NoopHandler {
        async fn run(
            &self,
            _params: &Value,
            _envelope: &Envelope,
            _context: &MemoryContext,
        ) -> Result<HandlerResult, HandlerError> {
            Ok(HandlerResult::message("ok"))
        }
    }

    fn descriptor(key: &'static str, handler_key: &'static str) -> CapabilityDescriptor {
        CapabilityDescriptor {
            key,
            display_name: key,
            description: "test",
            category: "test",
            enabled: true,
            required_role_level: RoleLevel::GUEST,
            risk_level: RiskLevel::Low,
            requires_confirmation: false,
            manages_own_confirmation: false,
            priority: 5,
            intent_keywords: KeywordSet::of(&["go"], &[], &[]),
            decision_keywords: KeywordSet::of(&["go"], &[], &[]),
            parameters: vec![],
            handler_key,
            chain_hints: vec![],
        }
    }

    #[test]
    fn default_catalog_passes_invariants() {
        let registry = CapabilityRegistry::with_defaults();
        let mut handlers = HandlerRegistry::new();
        for descriptor in registry.all() {
            handlers.register(descriptor.handler_key, Arc::new(NoopHandler));
        }
        registry.validate(&handlers).expect("catalog invariants hold");
    }

    #[test]
    fn missing_handler_rejected() {
        let registry = CapabilityRegistry::from_descriptors(vec![descriptor("a", "missing")]);
        let handlers = HandlerRegistry::new();
        assert!(registry.validate(&handlers).is_err());
    }

    #[test]
    fn orphan_handler_rejected() {
        let registry = CapabilityRegistry::from_descriptors(vec![descriptor("a", "h_a")]);
        let mut handlers = HandlerRegistry::new();
        handlers.register("h_a", Arc::new(NoopHandler));
        handlers.register("h_orphan", Arc::new(NoopHandler));
        assert!(registry.validate(&handlers).is_err());
    }

    #[test]
    fn enabled_without_keywords_rejected() {
        let mut bad = descriptor("a", "h_a");
        bad.intent_keywords = KeywordSet::default();
        let registry = CapabilityRegistry::from_descriptors(vec![bad]);
        let mut handlers = HandlerRegistry::new();
        handlers.register("h_a", Arc::new(NoopHandler));
        assert!(registry.validate(&handlers).is_err());
    }

    #[test]
    fn role_filter_excludes_higher_levels() {
        let mut privileged = descriptor("admin_only", "h_a");
        privileged.required_role_level = RoleLevel::EXECUTIVE;
        let registry =
            CapabilityRegistry::from_descriptors(vec![privileged, descriptor("open", "h_b")]);
        let member: Vec<&str> = registry
            .enabled_for(RoleLevel::MEMBER)
            .map(|d| d.key)
            .collect();
        assert_eq!(member, vec!["open"]);
    }

    #[test]
    fn suggestions_capped_at_three() {
        let result = HandlerResult::message("done").with_suggestions(
            (0..5).map(|i| format!("s{i}")).collect(),
        );
        assert_eq!(result.suggestions.len(), 3);
    }
}
