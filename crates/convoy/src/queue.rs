//! Serial delivery queue: one FIFO per conversation.
//!
//! Tasks for the same key run strictly one at a time in enqueue order; tasks
//! for different keys run concurrently. A key's entry exists exactly while a
//! worker is draining it: the worker removes the entry in the same critical
//! section in which it observes the queue empty, so an enqueue can never land
//! in a queue whose worker has already exited.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, error};

/// A deferred unit of work.
pub type Task = BoxFuture<'static, anyhow::Result<()>>;

#[derive(Clone, Default)]
pub struct SerialQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<Task>>>>,
    /// Signalled when the last worker removes its entry.
    idle: Arc<Notify>,
}

impl SerialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `task` to the key's queue, starting a worker if none is running.
    ///
    /// Never suspends; must be called from within a tokio runtime.
    pub fn enqueue<F>(&self, key: &str, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task: Task = Box::pin(task);
        let start_worker = {
            let mut queues = self.lock();
            match queues.get_mut(key) {
                Some(pending) => {
                    pending.push_back(task);
                    false
                }
                None => {
                    queues.insert(key.to_string(), VecDeque::from([task]));
                    true
                }
            }
        };

        if start_worker {
            debug!(key, "Starting serial queue worker");
            tokio::spawn(self.clone().drain(key.to_string()));
        }
    }

    /// Number of tasks waiting (not counting the one running) for `key`.
    pub fn pending(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, VecDeque::len)
    }

    /// Keys with a live worker.
    pub fn active_keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolve once every worker has drained and exited.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a worker finishing in between
            // still wakes us.
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Drop every pending task. Running tasks finish on their own.
    pub fn clear(&self) {
        for pending in self.lock().values_mut() {
            pending.clear();
        }
    }

    async fn drain(self, key: String) {
        loop {
            let (next, all_idle) = {
                let mut queues = self.lock();
                let next = queues.get_mut(&key).and_then(VecDeque::pop_front);
                if next.is_none() {
                    queues.remove(&key);
                }
                (next, queues.is_empty())
            };
            let Some(task) = next else {
                if all_idle {
                    self.idle.notify_waiters();
                }
                break;
            };

            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(key = %key, error = %e, "Queued task failed"),
                Err(_) => error!(key = %key, "Queued task panicked"),
            }
        }
        debug!(key = %key, "Serial queue worker drained");
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Task>>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// Tests
// ============================================================================
