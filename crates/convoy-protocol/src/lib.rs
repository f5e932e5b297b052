//! Wire types exchanged between Convoy and its transports and dispatchers.
//!
//! Inbound traffic is a stream of [`InboundEvent`]s; outbound traffic is a
//! stream of [`DispatchRequest`]s. Both serialize as JSON objects so they can
//! be carried as JSON Lines (newline-delimited JSON) over stdio.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Messages
// ============================================================================

/// Whether a conversation is a 1:1 chat with the bot or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    #[default]
    Group,
}

/// Author of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An @mention carried by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A single chat message as delivered by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub conversation_kind: ConversationKind,
    pub sender: Sender,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<Mention>,
    /// Platform create time, epoch milliseconds.
    pub create_time: i64,
}

impl ChatMessage {
    /// Platform create time as a UTC timestamp, if representable.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.create_time).single()
    }

    pub fn is_direct(&self) -> bool {
        self.conversation_kind == ConversationKind::Direct
    }
}

// ============================================================================
// Inbound events
// ============================================================================

/// Events delivered by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    MessageReceived(MessageReceivedData),
    ParticipantAdded(ParticipantData),
    ParticipantRemoved(ParticipantData),
}

impl InboundEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::MessageReceived(data) => &data.message.conversation_id,
            Self::ParticipantAdded(data) | Self::ParticipantRemoved(data) => &data.conversation_id,
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            Self::MessageReceived(data) => &data.event_id,
            Self::ParticipantAdded(data) | Self::ParticipantRemoved(data) => &data.event_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReceivedData {
    /// Transport-level delivery id; redeliveries reuse it.
    pub event_id: String,
    pub message: ChatMessage,
    /// Untouched platform payload, passed through to triggers.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantData {
    pub event_id: String,
    pub conversation_id: String,
    pub participants: Vec<Sender>,
}

// ============================================================================
// Identity
// ============================================================================

/// The bot's own identity on the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ============================================================================
// Outbound dispatch
// ============================================================================

/// A completed batch handed to the agent runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub conversation_id: String,
    pub messages: Vec<ChatMessage>,
    /// Primary context anchor: the trigger message, or the last buffered
    /// message for auto-replies.
    pub anchor: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_message: Option<ChatMessage>,
    pub is_auto_reply: bool,
    pub reply_in_thread: bool,
    pub show_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_hint: Option<String>,
}
