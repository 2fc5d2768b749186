//! Round State Poller
//!
//! Reads `roundId` and `getRoundDetails(roundId)` at a fixed interval and
//! publishes the pair as one [`RoundSnapshot`] only when both reads describe
//! the same round. Every poll is fault-isolated: a failed read keeps the
//! previous snapshot, raises the error flag and the loop carries on.

use ledger_client::{LedgerClient, LedgerError};
use round_types::{RoundId, RoundSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;

/// What subscribers see: the latest snapshot plus an advisory error flag
#[derive(Debug, Clone, Default)]
pub struct PollState {
    /// Latest published snapshot (`None` until the first successful poll)
    pub snapshot: Option<Arc<RoundSnapshot>>,
    /// Set by a failed read, cleared by the next successful one
    pub fetch_error: bool,
    /// Poll attempt that produced this state
    pub attempt: u64,
}

/// Poller configuration
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Result of a single poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Snapshot published
    Published(RoundId),
    /// Round turned over between the reads; retried next tick
    Torn { requested: RoundId, current: RoundId },
    /// Replica returned an older round than already published
    Regressed { published: RoundId, read: RoundId },
    /// Read failed; previous snapshot stays current
    Failed(LedgerError),
}

enum FetchError {
    Torn { requested: RoundId, current: RoundId },
    Ledger(LedgerError),
}

impl From<LedgerError> for FetchError {
    fn from(e: LedgerError) -> Self {
        FetchError::Ledger(e)
    }
}

/// Wakes the poll loop for an extra, out-of-cadence poll
#[derive(Clone)]
pub struct RefreshHandle {
    notify: Arc<Notify>,
}

impl RefreshHandle {
    /// Poll as soon as the loop is free
    pub fn request_refresh(&self) {
        self.notify.notify_one();
    }

    /// Poll once `delay` has elapsed. Best effort: the regular cadence does
    /// not depend on it.
    pub fn request_refresh_after(&self, delay: Duration) {
        let notify = self.notify.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            notify.notify_one();
        });
    }
}

/// Periodic reader of the current round
pub struct RoundPoller {
    ledger: Arc<dyn LedgerClient>,
    state_tx: Arc<watch::Sender<PollState>>,
    refresh: RefreshHandle,
    config: PollerConfig,
    attempts: u64,
}

impl RoundPoller {
    /// Create a new poller
    pub fn new(ledger: Arc<dyn LedgerClient>, config: PollerConfig) -> Self {
        let (state_tx, _) = watch::channel(PollState::default());
        Self {
            ledger,
            state_tx: Arc::new(state_tx),
            refresh: RefreshHandle {
                notify: Arc::new(Notify::new()),
            },
            config,
            attempts: 0,
        }
    }

    /// Subscribe to live poll state
    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state_tx.subscribe()
    }

    /// Handle for out-of-cadence refresh requests
    pub fn refresher(&self) -> RefreshHandle {
        self.refresh.clone()
    }

    /// Latest published state
    pub fn current(&self) -> PollState {
        self.state_tx.borrow().clone()
    }

    /// Run one poll and publish its result
    pub async fn poll_once(&mut self) -> PollOutcome {
        self.attempts += 1;
        let attempt = self.attempts;

        let outcome = match self.fetch_consistent().await {
            Ok(snapshot) => {
                let published = self
                    .state_tx
                    .borrow()
                    .snapshot
                    .as_ref()
                    .map(|s| s.round_id());

                match published {
                    Some(published) if snapshot.round_id() < published => PollOutcome::Regressed {
                        published,
                        read: snapshot.round_id(),
                    },
                    _ => {
                        let round_id = snapshot.round_id();
                        self.state_tx.send_modify(|state| {
                            state.snapshot = Some(Arc::new(snapshot));
                            state.fetch_error = false;
                            state.attempt = attempt;
                        });
                        PollOutcome::Published(round_id)
                    }
                }
            }
            Err(FetchError::Torn { requested, current }) => {
                PollOutcome::Torn { requested, current }
            }
            Err(FetchError::Ledger(e)) => {
                self.state_tx.send_if_modified(|state| {
                    let changed = !state.fetch_error;
                    state.fetch_error = true;
                    state.attempt = attempt;
                    changed
                });
                PollOutcome::Failed(e)
            }
        };

        match &outcome {
            PollOutcome::Published(round_id) => {
                tracing::trace!("Poll {}: published round {}", attempt, round_id)
            }
            PollOutcome::Torn { requested, current } => tracing::debug!(
                "Poll {}: round moved from {} to {} mid-read, discarding",
                attempt,
                requested,
                current
            ),
            PollOutcome::Regressed { published, read } => tracing::debug!(
                "Poll {}: read round {} behind published round {}, discarding",
                attempt,
                read,
                published
            ),
            PollOutcome::Failed(e) => tracing::warn!("Poll {} failed: {}", attempt, e),
        }

        outcome
    }

    /// Read id, details for that id, then the id again
    async fn fetch_consistent(&self) -> Result<RoundSnapshot, FetchError> {
        let round_id = self.ledger.read_current_round_id().await?;
        let details = self.ledger.read_round_details(round_id).await?;
        let current = self.ledger.read_current_round_id().await?;

        if current != round_id {
            return Err(FetchError::Torn {
                requested: round_id,
                current,
            });
        }

        RoundSnapshot::from_details(round_id, details)
            .map_err(|e| FetchError::Ledger(LedgerError::from(e)))
    }

    /// Spawn the poll loop; the returned handle owns the task
    pub fn start(self) -> PollerHandle {
        let state_tx = self.state_tx.clone();
        let refresh = self.refresh.clone();
        let task = tokio::spawn(self.run());

        PollerHandle {
            task,
            state_tx,
            refresh,
        }
    }

    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let notify = self.refresh.notify.clone();

        tracing::info!(
            "Round poller started ({}ms interval)",
            self.config.interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = notify.notified() => {
                    tracing::debug!("Refresh requested");
                }
            }
            self.poll_once().await;
        }
    }
}

/// Owns a running poll loop; dropping it stops the loop
pub struct PollerHandle {
    task: JoinHandle<()>,
    state_tx: Arc<watch::Sender<PollState>>,
    refresh: RefreshHandle,
}

impl PollerHandle {
    /// Subscribe to live poll state
    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state_tx.subscribe()
    }

    /// Latest published state
    pub fn current(&self) -> PollState {
        self.state_tx.borrow().clone()
    }

    /// Handle for out-of-cadence refresh requests
    pub fn refresher(&self) -> RefreshHandle {
        self.refresh.clone()
    }

    /// Request an extra poll
    pub fn request_refresh(&self) {
        self.refresh.request_refresh();
    }

    /// Stop the loop
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.task.abort();
        tracing::debug!("Round poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ledger_client::{InMemoryLedger, TxHandle, TxStatus};
    use round_types::{default_entry_fee, Amount, RoundDetails, Square};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const T0: i64 = 1_700_000_000;

    fn memory_ledger() -> Arc<InMemoryLedger> {
        Arc::new(InMemoryLedger::with_manual_clock(T0, 300, default_entry_fee()))
    }

    fn poller(ledger: Arc<InMemoryLedger>) -> RoundPoller {
        RoundPoller::new(ledger, PollerConfig::default())
    }

    /// Ledger replaying scripted round ids and details
    struct ScriptedLedger {
        ids: Mutex<VecDeque<RoundId>>,
        details: RoundDetails,
    }

    impl ScriptedLedger {
        fn new(ids: &[RoundId], details: RoundDetails) -> Self {
            Self {
                ids: Mutex::new(ids.iter().copied().collect()),
                details,
            }
        }
    }

    #[async_trait]
    impl LedgerClient for ScriptedLedger {
        async fn read_current_round_id(&self) -> Result<RoundId, LedgerError> {
            self.ids
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LedgerError::Transport("script exhausted".to_string()))
        }

        async fn read_round_details(&self, _round_id: RoundId) -> Result<RoundDetails, LedgerError> {
            Ok(self.details.clone())
        }

        async fn submit_stake(&self, _square: Square, _fee: Amount) -> Result<TxHandle, LedgerError> {
            Err(LedgerError::Rejected("read-only".to_string()))
        }

        async fn submit_advance_round(&self) -> Result<TxHandle, LedgerError> {
            Err(LedgerError::Rejected("read-only".to_string()))
        }

        async fn read_transaction_status(&self, _tx: TxHandle) -> Result<TxStatus, LedgerError> {
            Ok(TxStatus::Pending)
        }
    }

    fn open_details() -> RoundDetails {
        RoundDetails {
            end_time_unix: T0 + 300,
            total_staked: Amount::ZERO,
            square_stakes: [Amount::ZERO; 25],
            finalized: false,
            winner: Amount::ZERO,
        }
    }

    #[tokio::test]
    async fn test_poll_publishes_snapshot() {
        let mut poller = poller(memory_ledger());
        let rx = poller.subscribe();
        assert!(rx.borrow().snapshot.is_none());

        assert_eq!(poller.poll_once().await, PollOutcome::Published(1));

        let state = rx.borrow().clone();
        let snapshot = state.snapshot.unwrap();
        assert_eq!(snapshot.round_id(), 1);
        assert_eq!(snapshot.end_time_unix(), T0 + 300);
        assert!(!state.fetch_error);
        assert_eq!(state.attempt, 1);
    }

    #[tokio::test]
    async fn test_read_failure_keeps_previous_snapshot() {
        let ledger = memory_ledger();
        let mut poller = poller(ledger.clone());
        poller.poll_once().await;

        ledger.fail_next_reads(1);
        assert!(matches!(poller.poll_once().await, PollOutcome::Failed(_)));
        let state = poller.current();
        assert!(state.fetch_error);
        assert_eq!(state.snapshot.unwrap().round_id(), 1);

        // Flag clears on the next success
        assert_eq!(poller.poll_once().await, PollOutcome::Published(1));
        assert!(!poller.current().fetch_error);
    }

    #[tokio::test]
    async fn test_repeated_failures_never_publish() {
        let ledger = memory_ledger();
        let mut poller = poller(ledger.clone());

        ledger.fail_next_reads(10);
        for _ in 0..10 {
            assert!(matches!(poller.poll_once().await, PollOutcome::Failed(_)));
        }
        let state = poller.current();
        assert!(state.snapshot.is_none());
        assert!(state.fetch_error);
    }

    #[tokio::test]
    async fn test_torn_read_is_discarded() {
        let ledger = memory_ledger();
        let mut poller = poller(ledger.clone());
        poller.poll_once().await;

        ledger.advance_after_next_details_read();
        assert_eq!(
            poller.poll_once().await,
            PollOutcome::Torn {
                requested: 1,
                current: 2
            }
        );
        let state = poller.current();
        assert_eq!(state.snapshot.unwrap().round_id(), 1);
        assert!(!state.fetch_error);

        assert_eq!(poller.poll_once().await, PollOutcome::Published(2));
    }

    #[tokio::test]
    async fn test_lagging_replica_cannot_roll_back() {
        let ledger = Arc::new(ScriptedLedger::new(&[5, 5, 4, 4], open_details()));
        let mut poller = RoundPoller::new(ledger, PollerConfig::default());

        assert_eq!(poller.poll_once().await, PollOutcome::Published(5));
        assert_eq!(
            poller.poll_once().await,
            PollOutcome::Regressed {
                published: 5,
                read: 4
            }
        );
        assert_eq!(poller.current().snapshot.unwrap().round_id(), 5);
    }

    #[tokio::test]
    async fn test_invalid_winner_is_never_published() {
        let mut details = open_details();
        details.finalized = true;
        details.winner = Amount::from(30u64);
        let ledger = Arc::new(ScriptedLedger::new(&[1, 1], details));
        let mut poller = RoundPoller::new(ledger, PollerConfig::default());

        assert!(matches!(
            poller.poll_once().await,
            PollOutcome::Failed(LedgerError::InvalidData(_))
        ));
        assert!(poller.current().snapshot.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_publishes_in_attempt_order() {
        let handle = poller(memory_ledger()).start();
        let mut rx = handle.subscribe();

        let mut seen = Vec::new();
        while seen.len() < 3 {
            rx.changed().await.unwrap();
            seen.push(rx.borrow_and_update().attempt);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_request_polls_early() {
        let handle = poller(memory_ledger()).start();
        let mut rx = handle.subscribe();
        rx.changed().await.unwrap();
        rx.borrow_and_update();

        let started = tokio::time::Instant::now();
        handle.request_refresh();
        rx.changed().await.unwrap();

        assert_eq!(rx.borrow().attempt, 2);
        assert!(started.elapsed() < PollerConfig::default().interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_loop() {
        let handle = poller(memory_ledger()).start();
        let mut rx = handle.subscribe();
        rx.changed().await.unwrap();

        drop(handle);
        // Sender goes away with the aborted task
        while rx.changed().await.is_ok() {}
    }
}
