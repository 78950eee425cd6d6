use serde::{Deserialize, Serialize};

/// Stable message identifier assigned by the backend.
pub type MessageId = i64;

/// Conversation identifier.
pub type ConversationId = i64;

/// A single conversation message as delivered by the chat API or the push
/// channel. Immutable once buffered; replaced wholesale by an update event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(default)]
    pub conversation_id: ConversationId,
    /// Epoch timestamp used as the buffer sort key.
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub sender: Option<SenderRef>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    pub fn new(id: MessageId, conversation_id: ConversationId, created_at: i64) -> Self {
        Self {
            id,
            conversation_id,
            created_at,
            content: None,
            sender: None,
            status: MessageStatus::default(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// Reference to the author of a message. The backend mixes agent and contact
/// senders, so every field is optional on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderRef {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
    Failed,
    #[serde(other)]
    Unknown,
}
