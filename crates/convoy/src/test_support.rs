//! Shared fixtures for unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use convoy_protocol::{ChatMessage, ConversationKind, DispatchRequest, Mention, Sender};
use tokio::time::Instant;

use crate::dispatch::MessageDispatch;

pub fn group_message(conversation_id: &str, message_id: &str, create_time: i64) -> ChatMessage {
    ChatMessage {
        message_id: message_id.to_string(),
        conversation_id: conversation_id.to_string(),
        conversation_kind: ConversationKind::Group,
        sender: Sender {
            id: "user-1".to_string(),
            name: Some("Ada".to_string()),
        },
        text: format!("message {message_id}"),
        mentions: Vec::new(),
        create_time,
    }
}

pub fn direct_message(conversation_id: &str, message_id: &str, create_time: i64) -> ChatMessage {
    ChatMessage {
        conversation_kind: ConversationKind::Direct,
        ..group_message(conversation_id, message_id, create_time)
    }
}

pub fn mentioning(mut message: ChatMessage, id: &str) -> ChatMessage {
    message.mentions.push(Mention {
        id: id.to_string(),
        name: None,
    });
    message
}

/// Records every dispatched request with the (simulated) time it arrived.
#[derive(Default)]
pub struct RecordingDispatcher {
    requests: Mutex<Vec<(Instant, DispatchRequest)>>,
    fail_remaining: AtomicUsize,
}

impl RecordingDispatcher {
    /// Fail the first `n` dispatches without recording them.
    pub fn failing_first(n: usize) -> Self {
        Self {
            requests: Mutex::default(),
            fail_remaining: AtomicUsize::new(n),
        }
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.timed().into_iter().map(|(_, r)| r).collect()
    }

    pub fn timed(&self) -> Vec<(Instant, DispatchRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageDispatch for RecordingDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> anyhow::Result<()> {
        let should_fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("simulated dispatch failure");
        }
        self.requests.lock().unwrap().push((Instant::now(), request));
        Ok(())
    }
}
