//! Inbound pipeline: transport event → dedup ledger → serial queue → engine.
//!
//! [`EventSink::deliver`] does only synchronous filtering and enqueueing, so a
//! transport handler returns well within the platform's redelivery deadline.

use std::sync::Arc;

use convoy_protocol::{InboundEvent, MessageReceivedData, ParticipantData};
use tracing::{debug, info};

use crate::batch::BatchEngine;
use crate::dedup::DedupLedger;
use crate::queue::SerialQueue;

/// What happened to a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    Duplicate,
    Stale,
}

/// Handler table given to a transport on connect. Cheap to clone.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<Ingestor>,
}

struct Ingestor {
    ledger: DedupLedger,
    queue: SerialQueue,
    engine: BatchEngine,
}

impl EventSink {
    pub fn new(ledger: DedupLedger, queue: SerialQueue, engine: BatchEngine) -> Self {
        Self {
            inner: Arc::new(Ingestor {
                ledger,
                queue,
                engine,
            }),
        }
    }

    /// Filter and enqueue an event. Never suspends.
    pub fn deliver(&self, event: InboundEvent) -> Delivery {
        let this = &self.inner;
        let event_id = event.event_id().to_string();
        if this.ledger.is_duplicate(&event_id) {
            debug!(event_id = %event_id, "Dropping duplicate event");
            return Delivery::Duplicate;
        }

        match event {
            InboundEvent::MessageReceived(data) => this.message_received(data),
            InboundEvent::ParticipantAdded(data) => {
                let key = data.conversation_id.clone();
                this.queue.enqueue(&key, participant_added(data));
                Delivery::Accepted
            }
            InboundEvent::ParticipantRemoved(data) => {
                let key = data.conversation_id.clone();
                this.queue
                    .enqueue(&key, participant_removed(this.engine.clone(), data));
                Delivery::Accepted
            }
        }
    }
}

impl Ingestor {
    fn message_received(&self, data: MessageReceivedData) -> Delivery {
        let MessageReceivedData {
            event_id,
            message,
            raw,
        } = data;
        let conversation_id = message.conversation_id.clone();

        // Staleness check and watermark advance happen together, before any
        // deferred work, so a racing redelivery cannot slip through.
        if !self.ledger.admit(&conversation_id, message.create_time) {
            debug!(
                event_id = %event_id,
                conversation_id = %conversation_id,
                created_at = ?message.created_at(),
                "Dropping stale message"
            );
            return Delivery::Stale;
        }

        let engine = self.engine.clone();
        self.queue.enqueue(&conversation_id, async move {
            engine.process_message(message, &raw);
            Ok(())
        });
        Delivery::Accepted
    }
}

async fn participant_added(data: ParticipantData) -> anyhow::Result<()> {
    info!(
        conversation_id = %data.conversation_id,
        participants = data.participants.len(),
        "Participants added"
    );
    Ok(())
}

async fn participant_removed(engine: BatchEngine, data: ParticipantData) -> anyhow::Result<()> {
    let bot_removed = engine
        .identity()
        .is_some_and(|me| data.participants.iter().any(|p| p.id == me.id));
    if bot_removed && engine.discard(&data.conversation_id) {
        info!(
            conversation_id = %data.conversation_id,
            "Bot removed from conversation, discarded pending batch"
        );
    } else {
        debug!(
            conversation_id = %data.conversation_id,
            participants = data.participants.len(),
            "Participants removed"
        );
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use convoy_protocol::{BotIdentity, Sender};

    use crate::batch::BatchSettings;
    use crate::dedup::DedupSettings;
    use crate::dispatch::FlushEmitter;
    use crate::test_support::{RecordingDispatcher, group_message, mentioning};
    use crate::trigger::{MentionTrigger, TriggerRegistry};

    struct Harness {
        sink: EventSink,
        engine: BatchEngine,
        queue: SerialQueue,
        ledger: DedupLedger,
        recorder: Arc<RecordingDispatcher>,
    }

    fn harness() -> Harness {
        let recorder = Arc::new(RecordingDispatcher::default());
        let mut triggers = TriggerRegistry::new();
        triggers.register(Arc::new(MentionTrigger));
        let engine = BatchEngine::new(
            BatchSettings {
                startup_window: Duration::ZERO,
                ..BatchSettings::default()
            },
            triggers,
            FlushEmitter::new(recorder.clone()),
        );
        engine.set_identity(Some(BotIdentity {
            id: "bot".into(),
            name: None,
        }));
        let ledger = DedupLedger::new(DedupSettings::default());
        let queue = SerialQueue::new();
        Harness {
            sink: EventSink::new(ledger.clone(), queue.clone(), engine.clone()),
            engine,
            queue,
            ledger,
            recorder,
        }
    }

    fn message_event(event_id: &str, conversation: &str, offset_ms: i64, mention: bool) -> InboundEvent {
        let now = Utc::now().timestamp_millis();
        let mut message = group_message(conversation, event_id, now + offset_ms);
        if mention {
            message = mentioning(message, "bot");
        }
        InboundEvent::MessageReceived(MessageReceivedData {
            event_id: event_id.to_string(),
            message,
            raw: serde_json::Value::Null,
        })
    }

    async fn settle(queue: &SerialQueue) {
        while !queue.is_idle() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn duplicate_event_is_dropped() {
        let h = harness();
        let event = message_event("e1", "c", 0, false);
        assert_eq!(h.sink.deliver(event.clone()), Delivery::Accepted);
        assert_eq!(h.sink.deliver(event), Delivery::Duplicate);
        settle(&h.queue).await;
        assert_eq!(h.engine.snapshot("c").unwrap().buffered, 1);
    }

    #[tokio::test]
    async fn message_at_or_below_watermark_never_reaches_engine() {
        let h = harness();
        assert_eq!(h.sink.deliver(message_event("e1", "c", 0, false)), Delivery::Accepted);
        let mark = h.ledger.watermark("c").unwrap();

        // Redelivered under a new event id with an older create time.
        assert_eq!(h.sink.deliver(message_event("e2", "c", -5_000, false)), Delivery::Stale);

        // Newer message advances the watermark and is processed.
        assert_eq!(h.sink.deliver(message_event("e3", "c", 5_000, false)), Delivery::Accepted);
        assert!(h.ledger.watermark("c").unwrap() > mark);

        settle(&h.queue).await;
        assert_eq!(h.engine.snapshot("c").unwrap().buffered, 2);
    }

    #[tokio::test]
    async fn ancient_message_is_stale_without_watermark() {
        let h = harness();
        let delivery = h.sink.deliver(message_event("e1", "c", -2 * 60 * 60 * 1000, false));
        assert_eq!(delivery, Delivery::Stale);
        assert!(h.ledger.watermark("c").is_none());
        settle(&h.queue).await;
        assert!(h.engine.snapshot("c").is_none());
    }

    #[tokio::test]
    async fn bot_removal_discards_pending_batch() {
        let h = harness();
        h.sink.deliver(message_event("e1", "c", 0, true));
        settle(&h.queue).await;
        assert!(h.engine.snapshot("c").unwrap().triggered);

        let removed = InboundEvent::ParticipantRemoved(ParticipantData {
            event_id: "e2".into(),
            conversation_id: "c".into(),
            participants: vec![Sender {
                id: "bot".into(),
                name: None,
            }],
        });
        assert_eq!(h.sink.deliver(removed), Delivery::Accepted);
        settle(&h.queue).await;
        assert!(h.engine.snapshot("c").is_none());
        assert!(h.recorder.requests().is_empty());
    }

    #[tokio::test]
    async fn other_participant_changes_keep_batch() {
        let h = harness();
        h.sink.deliver(message_event("e1", "c", 0, false));
        let added = InboundEvent::ParticipantAdded(ParticipantData {
            event_id: "e2".into(),
            conversation_id: "c".into(),
            participants: vec![Sender {
                id: "user-9".into(),
                name: None,
            }],
        });
        let removed = InboundEvent::ParticipantRemoved(ParticipantData {
            event_id: "e3".into(),
            conversation_id: "c".into(),
            participants: vec![Sender {
                id: "user-9".into(),
                name: None,
            }],
        });
        h.sink.deliver(added);
        h.sink.deliver(removed);
        settle(&h.queue).await;
        assert_eq!(h.engine.snapshot("c").unwrap().buffered, 1);
    }
}
