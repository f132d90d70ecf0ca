//! Ingress layer: normalize the inbound message and resolve identities.
//!
//! Strips mention markup and toall tags, rejects toall messages that do
//! not mention the bot directly, resolves the sender against the identity
//! store, and fails closed on unknown tenants or senders. Failures here
//! produce the fixed "cannot understand" reply plus an audit entry; they
//! never bubble to the webhook adapter as errors.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use crate::store::{StoreError, TenantDb};
use crate::types::{BrainInput, InboundMessage};

/// Ingress failures. All map to the same user-facing sentence; the code
/// distinguishes them in the audit trail.
#[derive(Debug, Error)]
pub enum IngressError {
    /// Sender has no identity row in this tenant.
    #[error("unknown sender account {0}")]
    UnknownSender(String),
    /// Message is toall without a direct mention of the bot.
    #[error("toall without direct mention")]
    ToallWithoutMention,
    /// Nothing left after stripping markup.
    #[error("empty message")]
    EmptyMessage,
    /// Identity store failed.
    #[error("identity lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl IngressError {
    /// Stable code for the audit trail.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownSender(_) => "unknown_sender",
            Self::ToallWithoutMention => "toall_without_mention",
            Self::EmptyMessage => "empty_message",
            Self::Store(_) => "identity_store_error",
        }
    }
}

/// The fixed reply for any ingress failure.
pub const CANNOT_UNDERSTAND: &str =
    "すみません、内容をうまく読み取れませんでした。もう一度お願いします。";

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[To:(\d+)\]").expect("static pattern"))
}

fn markup_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[(?:To:\d+|rp aid=\d+[^\]]*|toall|返信 aid=\d+[^\]]*|piconname:\d+)\]")
            .expect("static pattern")
    })
}

/// Whether the body carries a toall tag.
fn has_toall(body: &str) -> bool {
    body.contains("[toall]")
}

/// Whether the body directly mentions the given account.
fn mentions_account(body: &str, account_id: &str) -> bool {
    mention_re()
        .captures_iter(body)
        .any(|captures| captures.get(1).map(|m| m.as_str()) == Some(account_id))
}

/// Strip mention markup, toall tags, and reply markers from a body.
pub fn strip_markup(body: &str) -> String {
    markup_re().replace_all(body, " ").trim().to_owned()
}

/// Normalize an inbound message into a [`BrainInput`].
///
/// The tenant is already resolved by the webhook adapter (which fails
/// closed on unknown organizations); this resolves the sender and cleans
/// the text.
///
/// # Errors
///
/// Returns an [`IngressError`] when the message cannot enter the pipeline.
pub async fn normalize(
    db: &TenantDb,
    bot_account_id: &str,
    message: &InboundMessage,
) -> Result<BrainInput, IngressError> {
    if has_toall(&message.body) && !mentions_account(&message.body, bot_account_id) {
        return Err(IngressError::ToallWithoutMention);
    }

    let text = strip_markup(&message.body);
    if text.is_empty() {
        return Err(IngressError::EmptyMessage);
    }

    let sender = db
        .user_by_account_id(&message.account_id)
        .await?
        .ok_or_else(|| IngressError::UnknownSender(message.account_id.clone()))?;

    Ok(BrainInput {
        tenant_id: message.tenant_id,
        room_id: message.room_id.clone(),
        message_id: message.message_id.clone(),
        text,
        sender,
        received_at: message.sent_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::{seed_tenant, seed_user};
    use crate::store::Db;
    use chrono::Utc;
    use uuid::Uuid;

    fn message(tenant_id: Uuid, body: &str) -> InboundMessage {
        InboundMessage {
            message_id: "m-1".to_owned(),
            tenant_id,
            room_id: "room-1".to_owned(),
            account_id: "acct-1".to_owned(),
            sender_name: "Sato".to_owned(),
            body: body.to_owned(),
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn markup_stripped() {
        assert_eq!(
            strip_markup("[To:999] ソウルくん タスク教えて"),
            "ソウルくん タスク教えて"
        );
        assert_eq!(strip_markup("[toall] 全員への周知 [To:999]"), "全員への周知");
        assert_eq!(strip_markup("[rp aid=123 to=45-6] 了解です"), "了解です");
    }

    #[tokio::test]
    async fn resolves_sender_and_cleans_text() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        let user_id = seed_user(&db, t, "acct-1", "Sato", 3).await;

        let input = normalize(&db.tenant(t), "999", &message(t, "[To:999] タスク教えて"))
            .await
            .expect("normalize");
        assert_eq!(input.text, "タスク教えて");
        assert_eq!(input.sender.user_id, user_id);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn toall_without_bot_mention_rejected() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        seed_user(&db, t, "acct-1", "Sato", 3).await;

        let err = normalize(&db.tenant(t), "999", &message(t, "[toall] みなさんへ"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, IngressError::ToallWithoutMention));

        // toall plus direct mention is accepted.
        normalize(&db.tenant(t), "999", &message(t, "[toall][To:999] みなさんへ"))
            .await
            .expect("accepted");
        db.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_sender_fails_closed() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        let err = normalize(&db.tenant(t), "999", &message(t, "[To:999] こんにちは"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, IngressError::UnknownSender(_)));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn empty_after_stripping_rejected() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        seed_user(&db, t, "acct-1", "Sato", 3).await;
        let err = normalize(&db.tenant(t), "999", &message(t, "[To:999]"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, IngressError::EmptyMessage));
        db.shutdown().await;
    }
}
