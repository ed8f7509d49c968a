//! Conversation messages and swim lanes
//!
//! Every message belongs to exactly one swim lane, keyed by its role. The
//! original system prompt is held outside the buffer and never enters a
//! lane.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provenance label attached to messages synthesized by the paging engine.
pub const VM_PROVENANCE: &str = "virtual-memory";

/// Message role, which doubles as the swim-lane key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Assistant,
    User,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::Assistant => "assistant",
            MessageRole::User => "user",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }

    /// All lanes, in the order eviction passes visit them.
    pub const ALL: [MessageRole; 4] = [
        MessageRole::Assistant,
        MessageRole::User,
        MessageRole::System,
        MessageRole::Tool,
    ];
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "assistant" => Ok(MessageRole::Assistant),
            "user" => Ok(MessageRole::User),
            "system" => Ok(MessageRole::System),
            "tool" => Ok(MessageRole::Tool),
            _ => Err(anyhow::anyhow!(
                "Invalid message role: {}. Must be assistant, user, system or tool",
                s
            )),
        }
    }
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sequence number assigned by the paging engine on `add` (0 until then).
    #[serde(default)]
    pub seq: u64,
    pub role: MessageRole,
    pub content: String,
    /// Who authored this message, when it was not the driver or the user
    /// (e.g. lane summaries carry [`VM_PROVENANCE`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    /// Importance in [0, 1]; values at or above the keep threshold survive
    /// eviction verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f32>,
    /// Protected messages are never paged during the current turn.
    #[serde(default)]
    pub protected: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            role,
            content: content.into(),
            provenance: None,
            importance: None,
            protected: false,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Tool, content)
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance.clamp(0.0, 1.0));
        self
    }

    pub fn with_provenance(mut self, provenance: impl Into<String>) -> Self {
        self.provenance = Some(provenance.into());
        self
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    /// Whether this message was synthesized by the paging engine.
    pub fn is_synthetic(&self) -> bool {
        self.provenance.as_deref() == Some(VM_PROVENANCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in MessageRole::ALL {
            assert_eq!(MessageRole::from_str(role.as_str()).unwrap(), role);
        }
        assert!(MessageRole::from_str("robot").is_err());
    }

    #[test]
    fn test_message_builders() {
        let msg = Message::assistant("hello").with_importance(1.5);
        assert_eq!(msg.role, MessageRole::Assistant);
        assert_eq!(msg.importance, Some(1.0)); // clamped
        assert!(!msg.protected);

        let msg = Message::tool("result").protected();
        assert!(msg.protected);
    }

    #[test]
    fn test_synthetic_detection() {
        let msg = Message::assistant("summary").with_provenance(VM_PROVENANCE);
        assert!(msg.is_synthetic());
        assert!(!Message::assistant("plain").is_synthetic());
    }
}
