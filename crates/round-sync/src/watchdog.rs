//! Watchdog Resetter
//!
//! Unattended loop that advances an expired round:
//! `Idle -> Checking -> Resetting -> Idle`, once per tick.
//!
//! Any number of watchdogs may race on the same ledger. The contract's
//! `reset()` guard refuses a second advance, so losing the race shows up as
//! a guard rejection and is logged as a benign no-op.

use crate::Clock;
use ledger_client::{LedgerClient, LedgerError, TxHandle};
use round_types::RoundId;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Default watchdog interval in seconds
pub const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Idle,
    Checking,
    Resetting,
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Deadline not reached
    NotExpired {
        round_id: RoundId,
        seconds_remaining: i64,
    },
    /// Winner already committed; nothing to advance
    AlreadyFinalized { round_id: RoundId },
    /// Advance accepted into the pending set
    Advanced { round_id: RoundId, tx: TxHandle },
    /// Ledger guard refused the advance: a peer got there first, or the
    /// ledger's clock has not reached the deadline yet
    GuardRejected { round_id: RoundId, reason: String },
    /// Could not read the round; retried next tick
    ReadFailed(LedgerError),
    /// Broadcast failed; retried next tick
    SubmitFailed { round_id: RoundId, error: LedgerError },
    /// Already attempted this round within the current interval
    Deduplicated { round_id: RoundId },
}

/// States visited during one tick, and its outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub path: Vec<WatchdogState>,
    pub outcome: TickOutcome,
}

/// Process-local memory between ticks. Not a source of truth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogCycle {
    /// `(round_id, end_time_unix, finalized)` seen at the last check
    pub last_checked: Option<(RoundId, i64, bool)>,
    /// `(round_id, at)` of the last advance attempt
    pub last_attempt: Option<(RoundId, i64)>,
}

/// Round-advance watchdog
pub struct Watchdog {
    ledger: Arc<dyn LedgerClient>,
    interval: Duration,
    clock: Clock,
    state: WatchdogState,
    cycle: WatchdogCycle,
}

impl Watchdog {
    /// Create a new watchdog on the wall clock
    pub fn new(ledger: Arc<dyn LedgerClient>, interval: Duration) -> Self {
        Self::with_clock(ledger, interval, crate::system_clock())
    }

    pub fn with_clock(ledger: Arc<dyn LedgerClient>, interval: Duration, clock: Clock) -> Self {
        Self {
            ledger,
            interval,
            clock,
            state: WatchdogState::Idle,
            cycle: WatchdogCycle::default(),
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn cycle(&self) -> &WatchdogCycle {
        &self.cycle
    }

    fn enter(&mut self, state: WatchdogState, path: &mut Vec<WatchdogState>) {
        tracing::trace!("Watchdog {:?} -> {:?}", self.state, state);
        self.state = state;
        path.push(state);
    }

    /// Check the current round and advance it if it has expired
    pub async fn tick(&mut self, now_unix: i64) -> TickReport {
        let mut path = vec![self.state];
        let outcome = self.check_and_reset(now_unix, &mut path).await;
        self.enter(WatchdogState::Idle, &mut path);
        TickReport { path, outcome }
    }

    async fn check_and_reset(
        &mut self,
        now_unix: i64,
        path: &mut Vec<WatchdogState>,
    ) -> TickOutcome {
        self.enter(WatchdogState::Checking, path);

        let round_id = match self.ledger.read_current_round_id().await {
            Ok(round_id) => round_id,
            Err(e) => return TickOutcome::ReadFailed(e),
        };
        let details = match self.ledger.read_round_details(round_id).await {
            Ok(details) => details,
            Err(e) => return TickOutcome::ReadFailed(e),
        };
        self.cycle.last_checked = Some((round_id, details.end_time_unix, details.finalized));

        if details.finalized {
            return TickOutcome::AlreadyFinalized { round_id };
        }
        let seconds_remaining = details.end_time_unix - now_unix;
        if seconds_remaining > 0 {
            return TickOutcome::NotExpired {
                round_id,
                seconds_remaining,
            };
        }

        // Window ends a second before the next regular tick
        if let Some((attempted, at)) = self.cycle.last_attempt {
            let window = self.interval.as_secs().saturating_sub(1) as i64;
            if attempted == round_id && now_unix - at < window {
                return TickOutcome::Deduplicated { round_id };
            }
        }

        self.enter(WatchdogState::Resetting, path);
        self.cycle.last_attempt = Some((round_id, now_unix));

        match self.ledger.submit_advance_round().await {
            Ok(tx) => TickOutcome::Advanced { round_id, tx },
            Err(e) if e.is_guard_rejection() => TickOutcome::GuardRejected {
                round_id,
                reason: e.to_string(),
            },
            Err(error) => TickOutcome::SubmitFailed { round_id, error },
        }
    }

    fn log_report(report: &TickReport) {
        match &report.outcome {
            TickOutcome::NotExpired {
                round_id,
                seconds_remaining,
            } => tracing::info!("Round {}: {}s remaining", round_id, seconds_remaining),
            TickOutcome::AlreadyFinalized { round_id } => {
                tracing::info!("Round {} already finalized", round_id)
            }
            TickOutcome::Advanced { round_id, tx } => {
                tracing::info!("Round {} expired, advance sent: {}", round_id, tx)
            }
            TickOutcome::GuardRejected { round_id, reason } => {
                tracing::info!("Advance of round {} refused: {}", round_id, reason)
            }
            TickOutcome::ReadFailed(e) => tracing::warn!("Round check failed: {}", e),
            TickOutcome::SubmitFailed { round_id, error } => {
                tracing::warn!("Advance of round {} failed, retrying next tick: {}", round_id, error)
            }
            TickOutcome::Deduplicated { round_id } => {
                tracing::debug!("Advance of round {} already attempted this interval", round_id)
            }
        }
    }

    /// Tick on the fixed interval until `shutdown` resolves
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!("Watchdog started ({}s interval)", self.interval.as_secs());

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let now = (self.clock)();
                    let report = self.tick(now).await;
                    Self::log_report(&report);
                }
            }
        }

        tracing::info!("Watchdog stopped");
    }
}
