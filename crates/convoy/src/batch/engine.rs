//! [`BatchEngine`]: owns every conversation batch and its timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use convoy_protocol::{BotIdentity, ChatMessage};
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info};

use super::state::{BatchMode, BatchSnapshot, ConversationBatch};
use super::timer::{ArmedTimer, TimerKind, TimerSet};
use super::BatchSettings;
use crate::dispatch::{FlushEmitter, FlushPayload};
use crate::trigger::{Trigger, TriggerContext, TriggerRegistry};

// ============================================================================
// Public types
// ============================================================================

/// Cheaply cloneable handle; clones share state.
#[derive(Clone)]
pub struct BatchEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    settings: BatchSettings,
    state: Mutex<EngineState>,
    triggers: RwLock<TriggerRegistry>,
    identity: RwLock<Option<BotIdentity>>,
    emitter: FlushEmitter,
    next_timer_id: AtomicU64,
}

struct EngineState {
    batches: HashMap<String, ConversationBatch>,
    connection_started_at: Instant,
    disposed: bool,
}

// ============================================================================
// BatchEngine public API
// ============================================================================

impl BatchEngine {
    pub fn new(settings: BatchSettings, triggers: TriggerRegistry, emitter: FlushEmitter) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                settings,
                state: Mutex::new(EngineState {
                    batches: HashMap::new(),
                    connection_started_at: Instant::now(),
                    disposed: false,
                }),
                triggers: RwLock::new(triggers),
                identity: RwLock::new(None),
                emitter,
                next_timer_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.inner.settings
    }

    /// Buffer a message and (re)arm the conversation's timers.
    ///
    /// Never suspends. Must be called from within a tokio runtime.
    pub fn process_message(&self, message: ChatMessage, raw: &serde_json::Value) {
        let matched = {
            let identity = read(&self.inner.identity);
            let ctx = TriggerContext {
                identity: identity.as_ref(),
                raw,
            };
            read(&self.inner.triggers).evaluate(&message, &ctx)
        };

        let inner = &self.inner;
        let settings = &inner.settings;
        let mut state = inner.lock();
        if state.disposed {
            debug!(conversation_id = %message.conversation_id, "Engine disposed, dropping message");
            return;
        }

        let now = Instant::now();
        let since_connect = now.saturating_duration_since(state.connection_started_at);
        let conversation_id = message.conversation_id.clone();
        let batch = state
            .batches
            .entry(conversation_id.clone())
            .or_insert_with(|| {
                let mode = if since_connect < settings.startup_window {
                    BatchMode::Startup
                } else {
                    BatchMode::Realtime
                };
                debug!(conversation_id = %conversation_id, ?mode, "New conversation batch");
                ConversationBatch::new(mode, now)
            });

        batch.last_activity_at = now;
        batch.buffer.push(message.clone());

        if let Some(hit) = matched {
            if batch.is_triggered() {
                batch.trigger_message = Some(message);
            } else {
                debug!(
                    conversation_id = %conversation_id,
                    trigger = %hit.trigger_id,
                    "Batch triggered"
                );
                batch.trigger_message = Some(message);
                batch.first_trigger_at = Some(now);
                batch.timers.cancel(TimerKind::AutoReply);
                inner.arm(
                    &mut batch.timers,
                    &conversation_id,
                    TimerKind::MaxWait,
                    settings.max_wait,
                );
            }
        }

        batch.timers.cancel(TimerKind::Debounce);
        batch.timers.cancel(TimerKind::AutoReply);

        match batch.mode {
            BatchMode::Startup => {
                if !batch.timers.is_armed(TimerKind::Startup) {
                    let remaining = settings.startup_window.saturating_sub(since_connect);
                    inner.arm(
                        &mut batch.timers,
                        &conversation_id,
                        TimerKind::Startup,
                        remaining,
                    );
                }
            }
            BatchMode::Realtime if batch.is_triggered() => {
                inner.arm(
                    &mut batch.timers,
                    &conversation_id,
                    TimerKind::Debounce,
                    settings.debounce,
                );
            }
            BatchMode::Realtime => {
                if let Some(auto) = settings.auto_reply {
                    inner.arm(
                        &mut batch.timers,
                        &conversation_id,
                        TimerKind::AutoReply,
                        auto.debounce,
                    );
                }
            }
        }
    }

    /// Force a flush attempt, as if the debounce had fired.
    pub async fn flush(&self, conversation_id: &str) {
        let payload = {
            let mut state = self.inner.lock();
            if state.disposed {
                return;
            }
            state
                .batches
                .get_mut(conversation_id)
                .and_then(|batch| take_triggered(conversation_id, batch))
        };
        if let Some(payload) = payload {
            self.inner.emitter.emit(payload).await;
        }
    }

    /// Force a flush attempt for every conversation.
    pub async fn flush_all(&self) {
        let payloads: Vec<FlushPayload> = {
            let mut state = self.inner.lock();
            if state.disposed {
                return;
            }
            state
                .batches
                .iter_mut()
                .filter_map(|(id, batch)| take_triggered(id, batch))
                .collect()
        };
        info!(count = payloads.len(), "Draining triggered batches");
        join_all(payloads.into_iter().map(|p| self.inner.emitter.emit(p))).await;
    }

    /// Drop a conversation's batch without flushing it.
    pub fn discard(&self, conversation_id: &str) -> bool {
        self.inner.lock().batches.remove(conversation_id).is_some()
    }

    /// Cancel every timer and forget every conversation. Later calls into
    /// the engine are no-ops.
    pub fn dispose(&self) {
        let mut state = self.inner.lock();
        state.disposed = true;
        let count = state.batches.len();
        state.batches.clear();
        info!(conversations = count, "Batch engine disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Start a new grace window: conversations first seen from now on start
    /// in startup mode.
    pub fn mark_connection_start(&self) {
        self.inner.lock().connection_started_at = Instant::now();
    }

    pub fn set_identity(&self, identity: Option<BotIdentity>) {
        *write(&self.inner.identity) = identity;
    }

    pub fn identity(&self) -> Option<BotIdentity> {
        read(&self.inner.identity).clone()
    }

    pub fn register_trigger(&self, trigger: Arc<dyn Trigger>) {
        write(&self.inner.triggers).register(trigger);
    }

    pub fn unregister_trigger(&self, id: &str) -> bool {
        write(&self.inner.triggers).unregister(id)
    }

    pub fn trigger_ids(&self) -> Vec<String> {
        read(&self.inner.triggers).ids()
    }

    /// Remove batches that have been quiescent for at least `idle_after`.
    pub fn prune_idle(&self, idle_after: Duration) -> usize {
        let mut state = self.inner.lock();
        let before = state.batches.len();
        state
            .batches
            .retain(|_, batch| !(batch.is_quiescent() && batch.last_activity_at.elapsed() >= idle_after));
        let removed = before - state.batches.len();
        if removed > 0 {
            debug!(removed, "Pruned idle conversation batches");
        }
        removed
    }

    pub fn snapshot(&self, conversation_id: &str) -> Option<BatchSnapshot> {
        self.inner
            .lock()
            .batches
            .get(conversation_id)
            .map(ConversationBatch::snapshot)
    }

    pub fn conversation_count(&self) -> usize {
        self.inner.lock().batches.len()
    }
}

// ============================================================================
// Timers (private)
// ============================================================================

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm `kind` for `conversation_id`, replacing any timer in that slot.
    fn arm(self: &Arc<Self>, timers: &mut TimerSet, conversation_id: &str, kind: TimerKind, delay: Duration) {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let engine: Weak<Self> = Arc::downgrade(self);
        let conversation_id = conversation_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(engine) = engine.upgrade() {
                engine.on_timer(&conversation_id, kind, id).await;
            }
        });
        timers.set(kind, ArmedTimer::new(id, handle));
    }

    async fn on_timer(self: Arc<Self>, conversation_id: &str, kind: TimerKind, id: u64) {
        let payload = {
            let mut state = self.lock();
            let Some(batch) = state.batches.get_mut(conversation_id) else {
                return;
            };
            if !batch.timers.claim(kind, id) {
                return;
            }
            debug!(conversation_id = %conversation_id, timer = %kind, "Timer fired");

            match kind {
                TimerKind::Debounce | TimerKind::MaxWait | TimerKind::Startup => {
                    take_triggered(conversation_id, batch)
                }
                TimerKind::AutoReply => self.evaluate_auto_reply(conversation_id, batch),
            }
        };

        if let Some(payload) = payload {
            self.emitter.emit(payload).await;
        }
    }

    /// Both `min_messages` and `min_time_window` must hold. With enough
    /// messages but too little time, re-check once the window has elapsed.
    fn evaluate_auto_reply(
        self: &Arc<Self>,
        conversation_id: &str,
        batch: &mut ConversationBatch,
    ) -> Option<FlushPayload> {
        let auto = self.settings.auto_reply?;
        if batch.is_triggered() {
            return None;
        }

        let enough_messages = batch.buffer.len() >= auto.min_messages;
        let elapsed = batch.first_message_at.elapsed();

        if enough_messages && elapsed >= auto.min_time_window {
            debug!(
                conversation_id = %conversation_id,
                messages = batch.buffer.len(),
                "Auto-reply conditions met"
            );
            return Some(batch.take(conversation_id, true));
        }

        if enough_messages {
            let remaining = auto.min_time_window - elapsed;
            self.arm(&mut batch.timers, conversation_id, TimerKind::AutoReply, remaining);
        }
        None
    }
}

/// Release a triggered batch. An untriggered batch only leaves startup mode.
fn take_triggered(conversation_id: &str, batch: &mut ConversationBatch) -> Option<FlushPayload> {
    if !batch.is_triggered() {
        batch.mode = BatchMode::Realtime;
        return None;
    }
    Some(batch.take(conversation_id, false))
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Tests
// ============================================================================
