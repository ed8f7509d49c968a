//! Durable pages
//!
//! A page is an immutable record of a contiguous window of evicted
//! messages. Identity is a hash of the raw content, so the store is
//! content-addressed and duplicate creations are idempotent. Only the
//! `summary` field may be replaced after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::message::{Message, MessageRole};
use super::tokens::TokenEstimator;

/// Bytes of raw content hashed into the summary manifest.
pub const SUMMARY_HASH_PREFIX_BYTES: usize = 4096;

/// Compute the content-addressed page id: `pg_` plus the first 12 hex chars
/// of the SHA-256 of the raw content.
pub fn page_id(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("pg_{}", &hex::encode(digest)[..12])
}

/// Hash of the first 4 KiB of raw content, used by the batch rebuild to
/// skip unchanged pages.
pub fn content_prefix_hash(content: &str) -> String {
    let prefix = &content.as_bytes()[..content.len().min(SUMMARY_HASH_PREFIX_BYTES)];
    hex::encode(Sha256::digest(prefix))
}

/// Serialize messages into role-prefixed blocks, the page's raw content
/// format.
pub fn serialize_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}]: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// An immutable durable page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub label: String,
    /// The original messages as role-prefixed blocks. Write-once.
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    pub tokens: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_importance: Option<f32>,
    /// The swim lane this page was evicted from.
    pub lane: MessageRole,
    /// Populated once summarized; replaced in place by the batch worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Page {
    /// Build a page from a window of same-lane messages.
    pub fn from_messages(
        lane: MessageRole,
        messages: &[Message],
        estimator: &TokenEstimator,
    ) -> Self {
        let content = serialize_messages(messages);
        let id = page_id(&content);
        let created_at = Utc::now();
        let max_importance = messages
            .iter()
            .filter_map(|m| m.importance)
            .fold(None, |acc: Option<f32>, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            });

        Self {
            id,
            label: format!(
                "{} x{} @ {}",
                lane,
                messages.len(),
                created_at.format("%Y-%m-%d %H:%M:%S")
            ),
            tokens: estimator.count_messages(messages),
            content,
            created_at,
            message_count: messages.len(),
            max_importance,
            lane,
            summary: None,
        }
    }

    /// Hash used by the summary manifest to detect content changes.
    pub fn prefix_hash(&self) -> String {
        content_prefix_hash(&self.content)
    }
}

/// Page metadata carried in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMeta {
    pub id: String,
    pub label: String,
    pub lane: MessageRole,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    pub tokens: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_importance: Option<f32>,
}

impl From<&Page> for PageMeta {
    fn from(page: &Page) -> Self {
        Self {
            id: page.id.clone(),
            label: page.label.clone(),
            lane: page.lane,
            created_at: page.created_at,
            message_count: page.message_count,
            tokens: page.tokens,
            max_importance: page.max_importance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> Vec<Message> {
        vec![
            Message::assistant("first step done"),
            Message::assistant("second step done").with_importance(0.9),
        ]
    }

    #[test]
    fn test_page_id_deterministic() {
        assert_eq!(page_id("same content"), page_id("same content"));
        assert_ne!(page_id("same content"), page_id("other content"));
        assert!(page_id("x").starts_with("pg_"));
        assert_eq!(page_id("x").len(), 15);
    }

    #[test]
    fn test_same_messages_same_id() {
        let est = TokenEstimator::default();
        let a = Page::from_messages(MessageRole::Assistant, &window(), &est);
        let b = Page::from_messages(MessageRole::Assistant, &window(), &est);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_serialization_format() {
        let raw = serialize_messages(&window());
        assert!(raw.starts_with("[assistant]: first step done"));
        assert!(raw.contains("\n---\n"));
    }

    #[test]
    fn test_metadata() {
        let est = TokenEstimator::default();
        let page = Page::from_messages(MessageRole::Assistant, &window(), &est);
        assert_eq!(page.message_count, 2);
        assert_eq!(page.max_importance, Some(0.9));
        assert_eq!(page.lane, MessageRole::Assistant);
        assert!(page.summary.is_none());
        assert!(page.label.contains("assistant x2"));
        assert_eq!(page.tokens, est.count_messages(&window()));
    }

    #[test]
    fn test_prefix_hash_covers_first_4k_only() {
        let head = "a".repeat(SUMMARY_HASH_PREFIX_BYTES);
        let a = content_prefix_hash(&format!("{head}tail-one"));
        let b = content_prefix_hash(&format!("{head}tail-two"));
        assert_eq!(a, b);
        assert_ne!(content_prefix_hash("short"), a);
    }
}
