//! Countdown Derivation
//!
//! [`derive`] is a pure projection of `(snapshot, now)`. The ticker re-runs
//! it every second from whatever snapshot is latest, never decrementing a
//! local counter, so it stays correct across snapshot replacements.

use crate::poller::PollState;
use crate::Clock;
use round_types::{RoundSnapshot, Square};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};

/// Local display tick
pub const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Display phase of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Deadline not reached yet
    Active { seconds_remaining: i64 },
    /// Deadline passed, waiting for a reset
    Expired,
    /// Winner committed on-ledger
    Finalized { winner: Square },
}

impl Phase {
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Active { .. })
    }

    /// Human-readable label
    pub fn label(&self) -> String {
        match self {
            Phase::Active { seconds_remaining } => {
                format!("{}m {}s", seconds_remaining / 60, seconds_remaining % 60)
            }
            Phase::Expired => "expired, awaiting reset".to_string(),
            Phase::Finalized { winner } => format!("round over, winner {}", winner),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Phase of `snapshot` at `now_unix`. Finalization wins over the clock.
pub fn derive(snapshot: &RoundSnapshot, now_unix: i64) -> Phase {
    if let Some(winner) = snapshot.winner() {
        return Phase::Finalized { winner };
    }

    let seconds_remaining = snapshot.seconds_remaining(now_unix);
    if seconds_remaining <= 0 {
        Phase::Expired
    } else {
        Phase::Active { seconds_remaining }
    }
}

/// Re-derives the phase from the latest snapshot once per tick
pub struct CountdownTicker {
    state: watch::Receiver<PollState>,
    interval: Interval,
    clock: Clock,
}

impl CountdownTicker {
    pub fn new(state: watch::Receiver<PollState>, clock: Clock) -> Self {
        let mut interval = tokio::time::interval(COUNTDOWN_TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            state,
            interval,
            clock,
        }
    }

    /// Wait for the next tick; `None` until a snapshot has been published
    pub async fn tick(&mut self) -> Option<(Arc<RoundSnapshot>, Phase)> {
        self.interval.tick().await;
        let snapshot = self.state.borrow().snapshot.clone()?;
        let phase = derive(&snapshot, (self.clock)());
        Some((snapshot, phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use round_types::{Amount, RoundDetails};
    use std::sync::atomic::{AtomicI64, Ordering};

    const T: i64 = 1_700_000_000;

    fn snapshot(round_id: u64, finalized: bool, winner: u64) -> RoundSnapshot {
        RoundSnapshot::from_details(
            round_id,
            RoundDetails {
                end_time_unix: T,
                total_staked: Amount::ZERO,
                square_stakes: [Amount::ZERO; 25],
                finalized,
                winner: Amount::from(winner),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_expired_after_deadline() {
        assert_eq!(derive(&snapshot(1, false, 0), T + 5), Phase::Expired);
        assert_eq!(derive(&snapshot(1, false, 0), T), Phase::Expired);
    }

    #[test]
    fn test_active_before_deadline() {
        let phase = derive(&snapshot(1, false, 0), T - 125);
        assert_eq!(phase, Phase::Active { seconds_remaining: 125 });
        assert!(phase.is_active());
        assert_eq!(phase.label(), "2m 5s");
    }

    #[test]
    fn test_finalized_takes_precedence() {
        let winner = Square::new(12).unwrap();
        // Before and after the deadline alike
        assert_eq!(derive(&snapshot(1, true, 12), T - 100), Phase::Finalized { winner });
        assert_eq!(derive(&snapshot(1, true, 12), T + 100), Phase::Finalized { winner });
        assert_eq!(Phase::Finalized { winner }.label(), "round over, winner #13");
    }

    #[test]
    fn test_derive_is_pure() {
        let s = snapshot(4, false, 0);
        for now in [T - 1_000, T - 1, T, T + 1, T + 1_000] {
            assert_eq!(derive(&s, now), derive(&s, now));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_follows_snapshot_replacement() {
        let (tx, rx) = watch::channel(PollState::default());
        let now = Arc::new(AtomicI64::new(T - 10));
        let clock_now = now.clone();
        let mut ticker = CountdownTicker::new(rx, Arc::new(move || clock_now.load(Ordering::SeqCst)));

        assert!(ticker.tick().await.is_none());

        tx.send_modify(|state| state.snapshot = Some(Arc::new(snapshot(1, false, 0))));
        let (_, phase) = ticker.tick().await.unwrap();
        assert_eq!(phase, Phase::Active { seconds_remaining: 10 });

        now.store(T + 1, Ordering::SeqCst);
        let (_, phase) = ticker.tick().await.unwrap();
        assert_eq!(phase, Phase::Expired);

        // New round arrives: recomputed from scratch, not decremented
        tx.send_modify(|state| state.snapshot = Some(Arc::new(snapshot(2, true, 3))));
        let (snapshot, phase) = ticker.tick().await.unwrap();
        assert_eq!(snapshot.round_id(), 2);
        assert!(matches!(phase, Phase::Finalized { .. }));
    }
}
