//! Dedup ledger: rejects redelivered events and stale message replays.
//!
//! Two independent filters:
//!
//! - **Event ids** seen within the retention window are duplicates.
//! - **Watermarks** track the newest message create time per conversation;
//!   anything at or below it is stale. Messages older than an absolute max
//!   age are stale too, which covers conversations without a watermark yet.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::debug;

/// Tunables for [`DedupLedger`].
#[derive(Debug, Clone, Copy)]
pub struct DedupSettings {
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub max_message_age: Duration,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            max_message_age: Duration::from_secs(30 * 60),
        }
    }
}

/// Cheaply cloneable handle; clones share state.
#[derive(Clone)]
pub struct DedupLedger {
    seen: Arc<DashMap<String, Instant>>,
    watermarks: Arc<DashMap<String, i64>>,
    settings: DedupSettings,
}

impl DedupLedger {
    pub fn new(settings: DedupSettings) -> Self {
        Self {
            seen: Arc::new(DashMap::new()),
            watermarks: Arc::new(DashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &DedupSettings {
        &self.settings
    }

    /// Returns `true` if `event_id` was already recorded; otherwise records
    /// it and returns `false`.
    pub fn is_duplicate(&self, event_id: &str) -> bool {
        match self.seen.entry(event_id.to_string()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                false
            }
        }
    }

    /// Whether a message created at `create_time` (epoch ms) should be dropped.
    pub fn is_stale(&self, conversation_id: &str, create_time: i64) -> bool {
        self.is_stale_at(conversation_id, create_time, Utc::now().timestamp_millis())
    }

    /// [`is_stale`](Self::is_stale) against an explicit wall-clock `now_ms`.
    pub fn is_stale_at(&self, conversation_id: &str, create_time: i64, now_ms: i64) -> bool {
        let max_age_ms = i64::try_from(self.settings.max_message_age.as_millis()).unwrap_or(i64::MAX);
        if now_ms.saturating_sub(create_time) > max_age_ms {
            return true;
        }
        self.watermarks
            .get(conversation_id)
            .is_some_and(|mark| create_time <= *mark)
    }

    /// Raise the conversation's watermark to `create_time` if it is newer.
    ///
    /// Call this before any asynchronous processing of the message so a racing
    /// redelivery fails the staleness check.
    pub fn advance_watermark(&self, conversation_id: &str, create_time: i64) {
        self.watermarks
            .entry(conversation_id.to_string())
            .and_modify(|mark| *mark = (*mark).max(create_time))
            .or_insert(create_time);
    }

    /// Atomically check staleness and advance the watermark. Returns `true`
    /// if the message is fresh and now owns the watermark.
    pub fn admit(&self, conversation_id: &str, create_time: i64) -> bool {
        self.admit_at(conversation_id, create_time, Utc::now().timestamp_millis())
    }

    pub fn admit_at(&self, conversation_id: &str, create_time: i64, now_ms: i64) -> bool {
        let max_age_ms = i64::try_from(self.settings.max_message_age.as_millis()).unwrap_or(i64::MAX);
        if now_ms.saturating_sub(create_time) > max_age_ms {
            return false;
        }
        match self.watermarks.entry(conversation_id.to_string()) {
            Entry::Occupied(mut mark) => {
                if create_time <= *mark.get() {
                    return false;
                }
                mark.insert(create_time);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(create_time);
                true
            }
        }
    }

    pub fn watermark(&self, conversation_id: &str) -> Option<i64> {
        self.watermarks.get(conversation_id).map(|mark| *mark)
    }

    /// Drop event ids older than the retention window, and watermarks older
    /// than the max message age. Returns how many event ids were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now().timestamp_millis())
    }

    /// [`sweep`](Self::sweep) against an explicit wall-clock `now_ms`.
    pub fn sweep_at(&self, now_ms: i64) -> usize {
        let retention = self.settings.retention;
        let before = self.seen.len();
        self.seen.retain(|_, seen_at| seen_at.elapsed() < retention);
        let removed = before.saturating_sub(self.seen.len());

        // Anything at or below an expired watermark already fails the max-age check.
        let max_age_ms = i64::try_from(self.settings.max_message_age.as_millis()).unwrap_or(i64::MAX);
        let marks_before = self.watermarks.len();
        self.watermarks
            .retain(|_, mark| now_ms.saturating_sub(*mark) <= max_age_ms);
        let marks_removed = marks_before.saturating_sub(self.watermarks.len());

        if removed > 0 || marks_removed > 0 {
            debug!(
                removed,
                watermarks_removed = marks_removed,
                remaining = self.seen.len(),
                "Swept dedup ledger"
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&self) {
        self.seen.clear();
        self.watermarks.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
