//! Wire frames for the push channel.
//!
//! Outbound: the subscribe command with its JSON-encoded identifier.
//! Inbound: loosely-typed frames classified into a closed set before the
//! router touches them. Payload fields are never assumed present.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ConversationId, Message};

/// Logical room channel the console subscribes to.
pub const ROOM_CHANNEL: &str = "RoomChannel";

/// Close code used for deliberate teardown. Anything else on close is
/// treated as a transport failure.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Identifier payload of a subscribe command. Serialized to a JSON string
/// and embedded in the command frame, as the channel protocol requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionIdentifier {
    pub channel: String,
    pub pubsub_token: String,
    pub account_id: i64,
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeCommand {
    pub command: String,
    pub identifier: String,
}

impl SubscribeCommand {
    pub fn subscribe(identifier: &SubscriptionIdentifier) -> serde_json::Result<Self> {
        Ok(Self {
            command: "subscribe".to_string(),
            identifier: serde_json::to_string(identifier)?,
        })
    }

    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Server-defined event kinds the router knows how to dispatch. Anything
/// else lands in `Unknown` with the raw string preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    MessageCreated,
    MessageUpdated,
    ConversationCreated,
    ConversationUpdated,
    ConversationStatusChanged,
    AssigneeChanged,
    ContactCreated,
    ContactUpdated,
    TypingOn,
    TypingOff,
    PresenceUpdate,
    Unknown,
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "message.created" => EventKind::MessageCreated,
            "message.updated" => EventKind::MessageUpdated,
            "conversation.created" => EventKind::ConversationCreated,
            "conversation.updated" => EventKind::ConversationUpdated,
            "conversation.status_changed" => EventKind::ConversationStatusChanged,
            "assignee.changed" => EventKind::AssigneeChanged,
            "contact.created" => EventKind::ContactCreated,
            "contact.updated" => EventKind::ContactUpdated,
            "conversation_typing_on" => EventKind::TypingOn,
            "conversation_typing_off" => EventKind::TypingOff,
            "presence.update" => EventKind::PresenceUpdate,
            _ => EventKind::Unknown,
        }
    }
}

/// The nested event envelope carried by data frames.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub kind: EventKind,
    pub raw_kind: String,
    pub data: Value,
}

/// One inbound frame, classified. Priority order matches the dispatch rules:
/// keepalives first, lifecycle acks second, event envelopes third,
/// everything else is unhandled.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Ping,
    Welcome,
    ConfirmSubscription,
    Event(EventEnvelope),
    Unhandled,
}

pub fn classify(value: &Value) -> InboundFrame {
    match value.get("type").and_then(Value::as_str) {
        Some("ping") => return InboundFrame::Ping,
        Some("welcome") => return InboundFrame::Welcome,
        Some("confirm_subscription") => return InboundFrame::ConfirmSubscription,
        _ => {}
    }

    let Some(message) = value.get("message") else {
        return InboundFrame::Unhandled;
    };
    let Some(raw_kind) = message.get("event").and_then(Value::as_str) else {
        return InboundFrame::Unhandled;
    };
    let data = message.get("data").cloned().unwrap_or(Value::Null);
    InboundFrame::Event(EventEnvelope {
        kind: EventKind::parse(raw_kind),
        raw_kind: raw_kind.to_string(),
        data,
    })
}

/// Best-effort conversation id extraction. Falls back through the candidate
/// fields in order of specificity; the first present one wins.
pub fn conversation_id_of(data: &Value) -> Option<ConversationId> {
    data.get("conversation_id")
        .and_then(Value::as_i64)
        .or_else(|| {
            data.get("conversation")
                .and_then(|c| c.get("id"))
                .and_then(Value::as_i64)
        })
        .or_else(|| data.get("id").and_then(Value::as_i64))
}

/// Decode a message event payload, backfilling the conversation id from the
/// envelope when the payload leaves it implicit.
pub fn message_from_event(data: &Value) -> Option<Message> {
    let mut message: Message = serde_json::from_value(data.clone()).ok()?;
    if message.conversation_id == 0 {
        if let Some(id) = data
            .get("conversation")
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64)
        {
            message.conversation_id = id;
        }
    }
    Some(message)
}
