//! Batch engine: decides when to wake the agent and with what context.
//!
//! Every conversation owns one batch. Messages are buffered, triggers are
//! evaluated, and a handful of timers decide when the buffer is released:
//!
//! ```text
//!  process_message()
//!       │  buffer += message
//!       │  trigger matched?  ── first match ──▶ arm max-wait, cancel auto-reply
//!       │                    ── later match ──▶ update trigger message only
//!       │  cancel debounce + auto-reply
//!       ▼
//!  mode = startup ─────────────▶ arm startup timer (once, until grace ends)
//!  mode = realtime, triggered ──▶ arm debounce
//!  mode = realtime, untriggered ▶ arm auto-reply debounce (if enabled)
//!
//!  debounce / max-wait / startup fires
//!       ├─ triggered   → flush (trigger reply)
//!       └─ untriggered → mode = realtime, keep buffering
//!
//!  auto-reply fires
//!       ├─ count ok + time ok → flush (auto reply)
//!       ├─ count ok, time short → re-arm for the remaining time
//!       └─ otherwise → wait for the next message
//! ```
//!
//! `process_message` never suspends. Flushes run on the timer task that
//! fired, and the dispatch hand-off happens after the batch state is cleared.

mod engine;
mod state;
mod timer;

use std::time::Duration;

pub use engine::BatchEngine;
pub use state::{BatchMode, BatchSnapshot};
pub use timer::TimerKind;

/// Timing knobs for the engine.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub startup_window: Duration,
    pub debounce: Duration,
    pub max_wait: Duration,
    /// `None` disables autonomous replies.
    pub auto_reply: Option<AutoReplySettings>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            startup_window: Duration::from_secs(10),
            debounce: Duration::from_secs(2),
            max_wait: Duration::from_secs(10),
            auto_reply: None,
        }
    }
}

/// Dual-condition gate for replying without being triggered.
#[derive(Debug, Clone, Copy)]
pub struct AutoReplySettings {
    pub debounce: Duration,
    pub min_messages: usize,
    pub min_time_window: Duration,
}
