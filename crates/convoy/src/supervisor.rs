//! Connection supervisor: transport lifecycle, reconnect backoff and shutdown.
//!
//! ```text
//!  connecting ──ok──▶ connected ──drop──▶ reconnecting ──▶ connecting …
//!      │                  │                     │
//!      └─fail: backoff────┼─────────────────────┘
//!                         └─finished: drain batches ─▶ stopped
//!  cancel (any state) ──────────────────────────────────▶ stopped
//! ```
//!
//! Reaching `stopped` always disposes the batch engine.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::BatchEngine;
use crate::dedup::DedupLedger;
use crate::identity::{Credentials, IdentityProbe};
use crate::ingest::EventSink;
use crate::queue::SerialQueue;
use crate::transport::{Disconnect, Transport, TransportError};

/// Default idle age after which quiescent batches are pruned.
const DEFAULT_IDLE_PRUNE_SECS: u64 = 60 * 60;

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

/// Exponential reconnect backoff: `min(max_delay, base_delay * 2^attempt)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed connects tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("transport connection failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last_error: TransportError,
    },
}

// ============================================================================
// ConnectionSupervisor
// ============================================================================

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    probe: Arc<dyn IdentityProbe>,
    credentials: Credentials,
    engine: BatchEngine,
    ledger: DedupLedger,
    queue: SerialQueue,
    backoff: BackoffPolicy,
    idle_prune: Duration,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        probe: Arc<dyn IdentityProbe>,
        engine: BatchEngine,
        ledger: DedupLedger,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            transport,
            probe,
            credentials: Credentials::default(),
            engine,
            ledger,
            queue: SerialQueue::new(),
            backoff: BackoffPolicy::default(),
            idle_prune: Duration::from_secs(DEFAULT_IDLE_PRUNE_SECS),
            state_tx,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_idle_prune(mut self, idle_prune: Duration) -> Self {
        self.idle_prune = idle_prune;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn engine(&self) -> &BatchEngine {
        &self.engine
    }

    pub fn queue(&self) -> &SerialQueue {
        &self.queue
    }

    /// The handler table transports deliver into.
    pub fn sink(&self) -> EventSink {
        EventSink::new(self.ledger.clone(), self.queue.clone(), self.engine.clone())
    }

    /// Run until cancelled, until the transport finishes, or until reconnects
    /// are exhausted. The engine is disposed on every exit path.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        let sweeper = spawn_cleanup_task(self.ledger.clone(), self.engine.clone(), self.idle_prune);
        let result = self.run_inner(&cancel).await;
        sweeper.abort();
        self.stop();
        result
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        self.set_state(ConnectionState::Connecting);

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = self.resolve_identity() => {}
        }

        let sink = self.sink();
        let mut attempt: u32 = 0;

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.transport.connect(sink.clone()) => result,
            };

            let delay = match connected {
                Ok(mut connection) => {
                    attempt = 0;
                    self.engine.mark_connection_start();
                    self.set_state(ConnectionState::Connected);
                    info!(transport = self.transport.name(), "Transport connected");

                    let end = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        end = connection.wait() => end,
                    };
                    match end {
                        Disconnect::Finished => {
                            info!(transport = self.transport.name(), "Transport finished, draining batches");
                            // Events already delivered may still sit in the queue.
                            tokio::select! {
                                _ = cancel.cancelled() => return Ok(()),
                                _ = self.queue.wait_idle() => {}
                            }
                            self.engine.flush_all().await;
                            return Ok(());
                        }
                        Disconnect::Dropped(e) => {
                            warn!(transport = self.transport.name(), error = %e, "Connection dropped");
                            self.backoff.delay_for(attempt)
                        }
                    }
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.backoff.max_attempts {
                        error!(attempt, error = %e, "Giving up on transport connection");
                        return Err(SupervisorError::RetriesExhausted {
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                    let delay = self.backoff.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transport connect failed, retrying"
                    );
                    delay
                }
            };

            self.set_state(ConnectionState::Reconnecting);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn resolve_identity(&self) {
        match self.probe.probe(&self.credentials).await {
            Ok(identity) => {
                info!(bot_id = %identity.id, "Resolved bot identity");
                self.engine.set_identity(Some(identity));
            }
            Err(e) => {
                warn!(error = %e, "Identity probe failed, mentions will be treated as ambiguous");
            }
        }
    }

    fn stop(&self) {
        self.set_state(ConnectionState::Stopped);
        self.queue.clear();
        self.engine.dispose();
        info!("Connection supervisor stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "Connection state changed");
        }
    }
}

/// Spawn the periodic sweep of the dedup ledger and idle batches. Returns its
/// handle for shutdown.
pub fn spawn_cleanup_task(
    ledger: DedupLedger,
    engine: BatchEngine,
    idle_prune: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ledger.settings().sweep_interval);
        loop {
            interval.tick().await;
            ledger.sweep();
            engine.prune_idle(idle_prune);
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use convoy_protocol::BotIdentity;
    use tokio::sync::oneshot;

    use crate::batch::BatchSettings;
    use crate::dedup::DedupSettings;
    use crate::dispatch::FlushEmitter;
    use crate::identity::{ProbeError, StaticIdentityProbe};
    use crate::test_support::RecordingDispatcher;
    use crate::transport::Connection;
    use crate::trigger::TriggerRegistry;

    /// Fails the first `failures` connects, then hands out connections whose
    /// end is controlled by the test.
    struct FlakyTransport {
        failures: u32,
        attempts: AtomicU32,
        ends: Mutex<Vec<oneshot::Receiver<Disconnect>>>,
    }

    impl FlakyTransport {
        fn new(failures: u32, ends: Vec<oneshot::Receiver<Disconnect>>) -> Self {
            Self {
                failures,
                attempts: AtomicU32::new(0),
                ends: Mutex::new(ends),
            }
        }
    }

    struct ScriptedConnection(Option<oneshot::Receiver<Disconnect>>);

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn wait(&mut self) -> Disconnect {
            match self.0.take() {
                Some(rx) => rx.await.unwrap_or(Disconnect::Finished),
                None => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn connect(&self, _sink: EventSink) -> Result<Box<dyn Connection>, TransportError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(TransportError::Connect(format!("attempt {n} refused")));
            }
            let mut ends = self.ends.lock().unwrap();
            let end = if ends.is_empty() { None } else { Some(ends.remove(0)) };
            Ok(Box::new(ScriptedConnection(end)))
        }
    }

    struct FailingProbe;

    #[async_trait]
    impl IdentityProbe for FailingProbe {
        async fn probe(&self, _credentials: &Credentials) -> Result<BotIdentity, ProbeError> {
            Err(ProbeError::Rejected("bad secret".into()))
        }
    }

    fn engine() -> BatchEngine {
        BatchEngine::new(
            BatchSettings::default(),
            TriggerRegistry::new(),
            FlushEmitter::new(Arc::new(RecordingDispatcher::default())),
        )
    }

    fn supervisor(transport: FlakyTransport, probe: Arc<dyn IdentityProbe>) -> ConnectionSupervisor {
        ConnectionSupervisor::new(
            Arc::new(transport),
            probe,
            engine(),
            DedupLedger::new(DedupSettings::default()),
        )
        .with_backoff(BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            max_attempts: 5,
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            max_attempts: 5,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(64), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempts_is_fatal() {
        let sup = supervisor(FlakyTransport::new(u32::MAX, vec![]), Arc::new(FailingProbe));
        let start = tokio::time::Instant::now();
        let result = sup.run(CancellationToken::new()).await;

        let Err(SupervisorError::RetriesExhausted { attempts, .. }) = result else {
            panic!("expected retries to be exhausted");
        };
        assert_eq!(attempts, 5);
        // Slept after attempts 1..=4: 200 + 400 + 800 + 1000 ms.
        assert_eq!(start.elapsed(), Duration::from_millis(2_400));
        assert_eq!(sup.state(), ConnectionState::Stopped);
        assert!(sup.engine().is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let (end_tx, end_rx) = oneshot::channel();
        let sup = Arc::new(supervisor(
            FlakyTransport::new(2, vec![end_rx]),
            Arc::new(StaticIdentityProbe::new(Some(BotIdentity {
                id: "bot".into(),
                name: None,
            }))),
        ));
        let mut states = sup.subscribe();
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let sup = sup.clone();
            let cancel = cancel.clone();
            async move { sup.run(cancel).await }
        });

        states
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(sup.engine().identity().unwrap().id, "bot");

        end_tx.send(Disconnect::Finished).unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(sup.state(), ConnectionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_reconnects() {
        let (first_tx, first_rx) = oneshot::channel();
        let transport = FlakyTransport::new(0, vec![first_rx]);
        let sup = Arc::new(supervisor(transport, Arc::new(FailingProbe)));
        let mut states = sup.subscribe();
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let sup = sup.clone();
            let cancel = cancel.clone();
            async move { sup.run(cancel).await }
        });

        states
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        first_tx
            .send(Disconnect::Dropped(TransportError::Closed))
            .unwrap();
        states
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        states
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        cancel.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(sup.state(), ConnectionState::Stopped);
        assert!(sup.engine().is_disposed());
        assert!(sup.engine().identity().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_immediately() {
        let sup = Arc::new(supervisor(
            FlakyTransport::new(u32::MAX, vec![]),
            Arc::new(FailingProbe),
        ));
        let mut states = sup.subscribe();
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let sup = sup.clone();
            let cancel = cancel.clone();
            async move { sup.run(cancel).await }
        });

        states
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        cancel.cancel();
        assert!(run.await.unwrap().is_ok());
        assert_eq!(sup.state(), ConnectionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_sweeps_ledger() {
        let ledger = DedupLedger::new(DedupSettings {
            retention: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            ..DedupSettings::default()
        });
        ledger.is_duplicate("evt-1");
        let task = spawn_cleanup_task(ledger.clone(), engine(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(ledger.is_empty());
        task.abort();
    }
}
