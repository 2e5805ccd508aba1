//! # Messages
//!
//! The unit of communication between agents: an immutable record with a
//! dispatch kind, an optional recipient, and a correlation id linking
//! replies to the message they answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Unique identity of a message for the lifetime of a bus.
pub type MessageId = Uuid;

/// Dispatch tag classifying a message's purpose.
///
/// Known kinds get their own variant; any tag the core does not recognize
/// round-trips through [`MessageKind::Custom`], so kinds minted by external
/// collaborators are never lost on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// A question addressed to another agent, expecting a reply
    Query,
    /// A progress or status notice
    Status,
    /// An error report
    Error,
    /// A generated-artifact notice
    Artifact,
    /// Automatic reply to a message of the inner kind
    Reply(Box<MessageKind>),
    /// Any tag the core does not know about
    Custom(String),
}

impl MessageKind {
    /// Parse a wire tag. Total: unknown tags land in `Custom`.
    pub fn parse(tag: &str) -> Self {
        if let Some(inner) = tag.strip_prefix("reply_") {
            return MessageKind::Reply(Box::new(MessageKind::parse(inner)));
        }
        match tag {
            "query" => MessageKind::Query,
            "status" => MessageKind::Status,
            "error" => MessageKind::Error,
            "artifact" => MessageKind::Artifact,
            other => MessageKind::Custom(other.to_string()),
        }
    }

    /// The tag written to the wire and the journal.
    pub fn wire_tag(&self) -> String {
        match self {
            MessageKind::Query => "query".to_string(),
            MessageKind::Status => "status".to_string(),
            MessageKind::Error => "error".to_string(),
            MessageKind::Artifact => "artifact".to_string(),
            MessageKind::Reply(inner) => format!("reply_{}", inner.wire_tag()),
            MessageKind::Custom(tag) => tag.clone(),
        }
    }

    /// Kind of the automatic reply to a message of kind `original`.
    pub fn reply_to(original: &MessageKind) -> Self {
        MessageKind::Reply(Box::new(original.clone()))
    }
}

impl From<String> for MessageKind {
    fn from(tag: String) -> Self {
        MessageKind::parse(&tag)
    }
}

impl From<&str> for MessageKind {
    fn from(tag: &str) -> Self {
        MessageKind::parse(tag)
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.wire_tag()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_tag())
    }
}

/// Subscription key: a specific kind, or the wildcard matching every kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Messages of exactly this kind
    Kind(MessageKind),
    /// Every message, regardless of kind
    Any,
}

impl From<MessageKind> for Topic {
    fn from(kind: MessageKind) -> Self {
        Topic::Kind(kind)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Kind(kind) => write!(f, "{}", kind),
            Topic::Any => write!(f, "*"),
        }
    }
}

/// One unit of communication between agents.
///
/// Created once by a sender, published exactly once, never mutated after.
/// `recipient` is advisory: the bus delivers to every subscriber and the
/// receiving endpoint discards messages not addressed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,
    /// Creation time; the bus clamps this monotonic at publish
    pub timestamp: DateTime<Utc>,
    /// Name of the originating participant
    pub sender: String,
    /// Single intended participant; `None` means broadcast
    #[serde(default)]
    pub recipient: Option<String>,
    /// Dispatch tag
    pub kind: MessageKind,
    /// Free-form text body
    pub payload: String,
    /// ID of the message this one answers
    #[serde(default)]
    pub in_reply_to: Option<MessageId>,
    /// Auxiliary structured fields, carried but never dispatched on
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// Create a new message with a fresh id and the current time.
    pub fn new(sender: impl Into<String>, kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            sender: sender.into(),
            recipient: None,
            kind,
            payload: payload.into(),
            in_reply_to: None,
            metadata: Map::new(),
        }
    }

    /// Address the message to a single participant.
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Mark the message as an answer to `original`.
    pub fn replying_to(mut self, original: MessageId) -> Self {
        self.in_reply_to = Some(original);
        self
    }

    /// Attach a metadata field.
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recipient = self
            .recipient
            .as_deref()
            .map(|r| format!(" \u{2192} {}", r))
            .unwrap_or_default();
        let preview: String = self.payload.chars().take(50).collect();
        let ellipsis = if self.payload.chars().count() > 50 {
            "..."
        } else {
            ""
        };
        write!(
            f,
            "[{}] {}{} ({}): {}{}",
            self.timestamp.format("%H:%M:%S"),
            self.sender,
            recipient,
            self.kind,
            preview,
            ellipsis
        )
    }
}
