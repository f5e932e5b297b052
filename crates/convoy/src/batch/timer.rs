//! Per-conversation timers.
//!
//! Each armed timer is a sleeping tokio task plus a generation id. The slot on
//! [`TimerSet`] owns the task handle and aborts it on drop, so replacing or
//! clearing a slot cancels the timer. A task that already woke up must still
//! [`claim`](TimerSet::claim) its slot by id before acting, which is what
//! guarantees a cancelled timer never fires.

use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Settles a triggered batch after the last message.
    Debounce,
    /// Bounds total wait from the first trigger.
    MaxWait,
    /// Ends the post-connect grace window.
    Startup,
    /// Schedules the next autonomous-reply evaluation.
    AutoReply,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] = [
        TimerKind::Debounce,
        TimerKind::MaxWait,
        TimerKind::Startup,
        TimerKind::AutoReply,
    ];
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimerKind::Debounce => "debounce",
            TimerKind::MaxWait => "max_wait",
            TimerKind::Startup => "startup",
            TimerKind::AutoReply => "auto_reply",
        };
        f.write_str(name)
    }
}

/// An armed timer. Dropping it aborts the task.
#[derive(Debug)]
pub(crate) struct ArmedTimer {
    id: u64,
    handle: Option<JoinHandle<()>>,
}

impl ArmedTimer {
    pub(crate) fn new(id: u64, handle: JoinHandle<()>) -> Self {
        Self {
            id,
            handle: Some(handle),
        }
    }

    /// Release the task without aborting it. Used by the task itself once it
    /// has claimed its slot.
    fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for ArmedTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimerSet {
    debounce: Option<ArmedTimer>,
    max_wait: Option<ArmedTimer>,
    startup: Option<ArmedTimer>,
    auto_reply: Option<ArmedTimer>,
}

impl TimerSet {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<ArmedTimer> {
        match kind {
            TimerKind::Debounce => &mut self.debounce,
            TimerKind::MaxWait => &mut self.max_wait,
            TimerKind::Startup => &mut self.startup,
            TimerKind::AutoReply => &mut self.auto_reply,
        }
    }

    /// Install a timer, cancelling whatever occupied the slot.
    pub(crate) fn set(&mut self, kind: TimerKind, timer: ArmedTimer) {
        *self.slot(kind) = Some(timer);
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        self.slot(kind).take();
    }

    pub(crate) fn cancel_all(&mut self) {
        for kind in TimerKind::ALL {
            self.cancel(kind);
        }
    }

    pub(crate) fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Debounce => self.debounce.is_some(),
            TimerKind::MaxWait => self.max_wait.is_some(),
            TimerKind::Startup => self.startup.is_some(),
            TimerKind::AutoReply => self.auto_reply.is_some(),
        }
    }

    pub(crate) fn armed(&self) -> Vec<TimerKind> {
        TimerKind::ALL
            .into_iter()
            .filter(|kind| self.is_armed(*kind))
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.armed().is_empty()
    }

    /// Take the slot if it still holds timer `id`. Returns `false` when the
    /// timer was cancelled or superseded, in which case the caller must not act.
    pub(crate) fn claim(&mut self, kind: TimerKind, id: u64) -> bool {
        let slot = self.slot(kind);
        match slot.as_ref() {
            Some(timer) if timer.id == id => {
                if let Some(timer) = slot.take() {
                    timer.detach();
                }
                true
            }
            _ => false,
        }
    }
}
