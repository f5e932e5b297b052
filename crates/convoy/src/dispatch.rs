//! Flush emitter: turns a completed batch into a [`DispatchRequest`] and hands
//! it to the agent-runtime collaborator.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use convoy_protocol::{ChatMessage, DispatchRequest};
use futures::FutureExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// System hint attached to auto-replies.
pub const AUTO_REPLY_HINT: &str = "You were not addressed directly. Reply only if you can add \
     something useful to the conversation; otherwise stay silent and send nothing.";

/// A batch released by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushPayload {
    pub conversation_id: String,
    pub messages: Vec<ChatMessage>,
    pub trigger_message: Option<ChatMessage>,
    pub is_auto_reply: bool,
}

impl FlushPayload {
    /// Shape the outbound request. Returns `None` for an empty batch.
    pub fn into_request(self) -> Option<DispatchRequest> {
        let (anchor, reply_in_thread, show_typing, system_hint) = if self.is_auto_reply {
            (self.messages.last()?.clone(), false, false, Some(AUTO_REPLY_HINT.to_string()))
        } else {
            let anchor = self
                .trigger_message
                .clone()
                .or_else(|| self.messages.last().cloned())?;
            (anchor, true, true, None)
        };

        Some(DispatchRequest {
            conversation_id: self.conversation_id,
            messages: self.messages,
            anchor,
            trigger_message: if self.is_auto_reply {
                None
            } else {
                self.trigger_message
            },
            is_auto_reply: self.is_auto_reply,
            reply_in_thread,
            show_typing,
            system_hint,
        })
    }
}

/// Agent-runtime collaborator: turns a batch into an agent invocation and
/// sends the reply out.
#[async_trait]
pub trait MessageDispatch: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> anyhow::Result<()>;
}

// ============================================================================
// FlushEmitter
// ============================================================================

#[derive(Clone)]
pub struct FlushEmitter {
    dispatcher: Arc<dyn MessageDispatch>,
}

impl FlushEmitter {
    pub fn new(dispatcher: Arc<dyn MessageDispatch>) -> Self {
        Self { dispatcher }
    }

    /// Hand a batch to the dispatcher. Failures and panics are logged and
    /// swallowed.
    pub async fn emit(&self, payload: FlushPayload) {
        let conversation_id = payload.conversation_id.clone();
        let count = payload.messages.len();
        let is_auto_reply = payload.is_auto_reply;

        let Some(request) = payload.into_request() else {
            debug!(conversation_id = %conversation_id, "Skipping empty flush");
            return;
        };

        debug!(
            conversation_id = %conversation_id,
            messages = count,
            is_auto_reply,
            "Dispatching batch"
        );

        match AssertUnwindSafe(self.dispatcher.dispatch(request))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                conversation_id = %conversation_id,
                error = %e,
                "Dispatch failed"
            ),
            Err(_) => error!(conversation_id = %conversation_id, "Dispatch panicked"),
        }
    }
}

// ============================================================================
// JsonLinesDispatcher
// ============================================================================

/// Writes each request as one JSON line. Used by the binary on stdout.
pub struct JsonLinesDispatcher<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesDispatcher<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesDispatcher<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> MessageDispatch for JsonLinesDispatcher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn dispatch(&self, request: DispatchRequest) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingDispatcher, group_message};

    fn payload(is_auto_reply: bool) -> FlushPayload {
        let first = group_message("c", "m1", 1);
        let second = group_message("c", "m2", 2);
        FlushPayload {
            conversation_id: "c".into(),
            messages: vec![first.clone(), second],
            trigger_message: (!is_auto_reply).then_some(first),
            is_auto_reply,
        }
    }

    struct Failing;

    #[async_trait]
    impl MessageDispatch for Failing {
        async fn dispatch(&self, _request: DispatchRequest) -> anyhow::Result<()> {
            anyhow::bail!("agent runtime unavailable")
        }
    }

    #[test]
    fn triggered_request_anchors_on_trigger_message() {
        let request = payload(false).into_request().unwrap();
        assert_eq!(request.anchor.message_id, "m1");
        assert_eq!(request.trigger_message.unwrap().message_id, "m1");
        assert!(request.reply_in_thread);
        assert!(request.show_typing);
        assert!(request.system_hint.is_none());
        assert!(!request.is_auto_reply);
    }

    #[test]
    fn auto_reply_request_anchors_on_last_message() {
        let request = payload(true).into_request().unwrap();
        assert_eq!(request.anchor.message_id, "m2");
        assert!(request.trigger_message.is_none());
        assert!(!request.reply_in_thread);
        assert!(!request.show_typing);
        assert_eq!(request.system_hint.as_deref(), Some(AUTO_REPLY_HINT));
    }

    #[test]
    fn empty_batch_has_no_request() {
        let empty = FlushPayload {
            conversation_id: "c".into(),
            messages: vec![],
            trigger_message: None,
            is_auto_reply: true,
        };
        assert!(empty.into_request().is_none());
    }

    #[tokio::test]
    async fn emitter_forwards_to_dispatcher() {
        let recorder = Arc::new(RecordingDispatcher::default());
        let emitter = FlushEmitter::new(recorder.clone());
        emitter.emit(payload(false)).await;
        let requests = recorder.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn emitter_swallows_dispatch_errors() {
        let emitter = FlushEmitter::new(Arc::new(Failing));
        emitter.emit(payload(false)).await;
    }

    #[tokio::test]
    async fn json_lines_dispatcher_writes_one_line_per_request() {
        let dispatcher = JsonLinesDispatcher::new(Vec::<u8>::new());
        dispatcher
            .dispatch(payload(false).into_request().unwrap())
            .await
            .unwrap();
        dispatcher
            .dispatch(payload(true).into_request().unwrap())
            .await
            .unwrap();

        let output = String::from_utf8(dispatcher.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: DispatchRequest = serde_json::from_str(lines[1]).unwrap();
        assert!(parsed.is_auto_reply);
    }
}
