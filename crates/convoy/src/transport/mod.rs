//! Transport abstraction for chat platform event delivery.
//!
//! A [`Transport`] opens a connection and pushes every inbound event into the
//! [`EventSink`] it was given. The sink filters and enqueues synchronously, so
//! platform handlers return immediately and never trip redelivery.
//!
//! ```text
//!  Transport::connect(sink)
//!       │  InboundEvent
//!       ▼
//!  EventSink::deliver()            [ingest.rs]
//!       │  1. dedup by event id
//!       │  2. staleness + watermark
//!       ▼
//!  SerialQueue::enqueue()          [queue.rs]
//!       ▼
//!  BatchEngine::process_message()  [batch/engine.rs]
//! ```
//!
//! The connection stays open until [`Connection::wait`] resolves, either
//! because the link dropped (the supervisor reconnects) or because the
//! transport has no more events to deliver.

mod stdio;

use async_trait::async_trait;
use thiserror::Error;

pub use crate::ingest::{Delivery, EventSink};
pub use stdio::JsonLinesTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, sink: EventSink) -> Result<Box<dyn Connection>, TransportError>;
}

#[async_trait]
pub trait Connection: Send {
    /// Resolve once the connection ends.
    async fn wait(&mut self) -> Disconnect;
}

/// Why a connection ended.
#[derive(Debug)]
pub enum Disconnect {
    /// Link lost; reconnect.
    Dropped(TransportError),
    /// The event source is exhausted; stop cleanly.
    Finished,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,
}
