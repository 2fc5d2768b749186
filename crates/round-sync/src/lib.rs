//! Round Sync - keeps local views consistent with the round ledger
//!
//! Architecture:
//! - The poller reads the current round every few seconds and publishes
//!   whole snapshots over a watch channel
//! - Countdown phases are derived from the latest snapshot on a faster tick
//! - The stake controller owns at most one in-flight stake and reconciles it
//!   against every new snapshot, keyed on round id
//! - The watchdog advances expired rounds; the ledger's guard makes
//!   concurrent watchdogs safe without coordination

pub mod countdown;
pub mod poller;
pub mod stake;
pub mod watchdog;

pub use countdown::{derive, CountdownTicker, Phase};
pub use poller::{PollOutcome, PollState, PollerConfig, PollerHandle, RefreshHandle, RoundPoller};
pub use stake::{
    PendingSubmission, SelectError, StakeController, SubmissionOutcome, SubmissionStatus,
    SubmitError,
};
pub use watchdog::{TickOutcome, TickReport, Watchdog, WatchdogCycle, WatchdogState};

use std::sync::Arc;

/// Unix-seconds time source
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Current wall-clock time in unix seconds
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Wall-clock [`Clock`]
pub fn system_clock() -> Clock {
    Arc::new(now_unix)
}
