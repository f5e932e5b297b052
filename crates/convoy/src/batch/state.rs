//! Per-conversation batch state.

use std::mem;

use convoy_protocol::ChatMessage;
use serde::Serialize;
use tokio::time::Instant;

use super::timer::{TimerKind, TimerSet};
use crate::dispatch::FlushPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Conversation first seen inside the post-connect grace window.
    Startup,
    Realtime,
}

#[derive(Debug)]
pub(crate) struct ConversationBatch {
    pub(crate) mode: BatchMode,
    pub(crate) buffer: Vec<ChatMessage>,
    /// Latest message that matched a trigger. `Some` iff the batch is triggered.
    pub(crate) trigger_message: Option<ChatMessage>,
    pub(crate) first_message_at: Instant,
    pub(crate) first_trigger_at: Option<Instant>,
    pub(crate) last_activity_at: Instant,
    pub(crate) timers: TimerSet,
}

impl ConversationBatch {
    pub(crate) fn new(mode: BatchMode, now: Instant) -> Self {
        Self {
            mode,
            buffer: Vec::new(),
            trigger_message: None,
            first_message_at: now,
            first_trigger_at: None,
            last_activity_at: now,
            timers: TimerSet::default(),
        }
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.trigger_message.is_some()
    }

    /// Cancel every timer, snapshot the buffer and reset to an empty
    /// realtime batch.
    pub(crate) fn take(&mut self, conversation_id: &str, is_auto_reply: bool) -> FlushPayload {
        self.timers.cancel_all();
        let messages = mem::take(&mut self.buffer);
        let trigger_message = self.trigger_message.take();
        self.first_trigger_at = None;
        self.first_message_at = Instant::now();
        self.mode = BatchMode::Realtime;

        FlushPayload {
            conversation_id: conversation_id.to_string(),
            messages,
            trigger_message: if is_auto_reply { None } else { trigger_message },
            is_auto_reply,
        }
    }

    /// Nothing buffered, nothing pending.
    pub(crate) fn is_quiescent(&self) -> bool {
        self.buffer.is_empty() && !self.is_triggered() && self.timers.is_empty()
    }

    pub(crate) fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            mode: self.mode,
            buffered: self.buffer.len(),
            triggered: self.is_triggered(),
            trigger_message_id: self.trigger_message.as_ref().map(|m| m.message_id.clone()),
            armed: self.timers.armed(),
        }
    }
}

/// Read-only view of a conversation's batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSnapshot {
    pub mode: BatchMode,
    pub buffered: usize,
    pub triggered: bool,
    pub trigger_message_id: Option<String>,
    pub armed: Vec<TimerKind>,
}
