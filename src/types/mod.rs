// Shared domain types used across the brain layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A normalized inbound chat message, produced by the webhook adapter.
///
/// The organization key is the chat service's identifier for the customer;
/// ingress resolves it to an internal tenant id and fails closed when the
/// tenant is unknown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Chat-service message id, used for duplicate detection.
    pub message_id: String,
    /// Internal tenant id, resolved by the adapter before the Brain runs.
    pub tenant_id: Uuid,
    /// Chat-service room id the message arrived in.
    pub room_id: String,
    /// Chat-service account id of the sender.
    pub account_id: String,
    /// Display name of the sender as reported by chat metadata.
    pub sender_name: String,
    /// Raw message body, including mention markup.
    pub body: String,
    /// When the chat service timestamped the message.
    pub sent_at: DateTime<Utc>,
}

/// Sender identity resolved against the tenant's identity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    /// Internal user id.
    pub user_id: Uuid,
    /// Chat-service account id.
    pub account_id: String,
    /// Display name.
    pub display_name: String,
    /// Role level, 1 (guest) through 6 (principal).
    pub role_level: RoleLevel,
}

/// Input to the Brain pipeline: a normalized message plus resolved identity.
#[derive(Debug, Clone)]
pub struct BrainInput {
    pub tenant_id: Uuid,
    pub room_id: String,
    pub message_id: String,
    /// Message text with mention markup and toall tags stripped.
    pub text: String,
    pub sender: SenderIdentity,
    pub received_at: DateTime<Utc>,
}

/// Role levels ordered lowest to highest.
///
/// Capability descriptors declare the minimum level required; Decision
/// refuses selections the sender's level does not reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleLevel(pub u8);

impl RoleLevel {
    /// External guest.
    pub const GUEST: Self = Self(1);
    /// Regular member.
    pub const MEMBER: Self = Self(2);
    /// Team lead.
    pub const LEAD: Self = Self(3);
    /// Department manager.
    pub const MANAGER: Self = Self(4);
    /// Executive.
    pub const EXECUTIVE: Self = Self(5);
    /// Principal (highest trust).
    pub const PRINCIPAL: Self = Self(6);

    /// Clamp an arbitrary integer into the valid 1..=6 range.
    pub fn clamped(raw: i64) -> Self {
        Self(u8::try_from(raw.clamp(1, 6)).unwrap_or(1))
    }
}

impl std::fmt::Display for RoleLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Risk classification for a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// String form stored in the decision log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Message urgency inferred by Understanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    High,
}

impl Default for Urgency {
    fn default() -> Self {
        Self::Normal
    }
}

/// Audit classification levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl Classification {
    /// String form stored in the audit log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
        }
    }
}

impl std::str::FromStr for Classification {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "internal" => Ok(Self::Internal),
            "confidential" => Ok(Self::Confidential),
            "restricted" => Ok(Self::Restricted),
            other => Err(anyhow::anyhow!("unknown classification: {other}")),
        }
    }
}

/// Outbound reply assembled by the Post layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub room_id: String,
    pub text: String,
}

/// The serial key under which messages are ordered: one conversation per
/// (tenant, room, user).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub tenant_id: Uuid,
    pub room_id: String,
    pub user_id: Uuid,
}

impl ConversationKey {
    pub fn new(tenant_id: Uuid, room_id: &str, user_id: Uuid) -> Self {
        Self {
            tenant_id,
            room_id: room_id.to_owned(),
            user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_level_clamps_out_of_range() {
        assert_eq!(RoleLevel::clamped(0), RoleLevel::GUEST);
        assert_eq!(RoleLevel::clamped(3), RoleLevel::LEAD);
        assert_eq!(RoleLevel::clamped(99), RoleLevel::PRINCIPAL);
        assert_eq!(RoleLevel::clamped(-5), RoleLevel::GUEST);
    }

    #[test]
    fn role_level_ordering() {
        assert!(RoleLevel::GUEST < RoleLevel::MEMBER);
        assert!(RoleLevel::MANAGER < RoleLevel::PRINCIPAL);
    }

    #[test]
    fn risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
    }

    #[test]
    fn classification_roundtrip() {
        for c in [
            Classification::Public,
            Classification::Internal,
            Classification::Confidential,
            Classification::Restricted,
        ] {
            let parsed: Classification = c.as_str().parse().expect("parse");
            assert_eq!(parsed, c);
        }
        assert!("top-secret".parse::<Classification>().is_err());
    }

    #[test]
    fn conversation_key_equality() {
        let t = Uuid::new_v4();
        let u = Uuid::new_v4();
        assert_eq!(
            ConversationKey::new(t, "room-1", u),
            ConversationKey::new(t, "room-1", u)
        );
        assert_ne!(
            ConversationKey::new(t, "room-1", u),
            ConversationKey::new(t, "room-2", u)
        );
    }
}
