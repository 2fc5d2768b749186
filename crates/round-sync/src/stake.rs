//! Stake Submission Controller
//!
//! Owns the selection and at most one in-flight stake. Every new snapshot
//! goes through [`StakeController::reconcile`]:
//! 1. a round change clears the selection
//! 2. a pending stake aimed at another round is discarded as stale
//! 3. a broadcast stake is checked for inclusion

use crate::countdown::{derive, Phase};
use crate::poller::{PollState, RefreshHandle};
use ledger_client::{LedgerClient, LedgerError, TxHandle, TxStatus};
use round_types::{Amount, RoundId, RoundSnapshot, Square};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Delay before the courtesy re-poll after a broadcast
pub const REFRESH_DELAY: Duration = Duration::from_secs(2);

/// Lifecycle of a pending stake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// Wallet is signing / broadcasting
    Signing,
    /// Accepted into the pending set
    Submitted,
    Confirmed,
    Failed,
}

/// The single stake a client may have in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubmission {
    pub target_round_id: RoundId,
    pub square: Square,
    pub submitted_at: i64,
    pub tx: Option<TxHandle>,
    pub status: SubmissionStatus,
}

/// How a pending stake ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Included in the round it targeted
    Confirmed {
        round_id: RoundId,
        square: Square,
        tx: TxHandle,
    },
    /// Included but reverted by a ledger guard
    Failed {
        round_id: RoundId,
        square: Square,
        tx: TxHandle,
    },
    /// The round turned over before the stake was reconciled
    Stale {
        target_round_id: RoundId,
        observed_round_id: RoundId,
        square: Square,
    },
}

/// Reasons `submit` refuses to act; none of them leave state behind
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Square {0} is off the board")]
    InvalidSquare(u8),

    #[error("No square selected")]
    NoSelection,

    #[error("No round snapshot yet")]
    NoSnapshot,

    #[error("Round is not active: {0}")]
    RoundNotActive(Phase),

    #[error("A stake is already in flight")]
    AlreadyPending,

    #[error("Stake submission failed: {0}")]
    Rejected(LedgerError),
}

/// Selection errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("Square {0} is off the board")]
    InvalidSquare(u8),

    #[error("No round snapshot yet")]
    NoSnapshot,

    #[error("Round {0} is finalized")]
    RoundFinalized(RoundId),
}

/// Client-side stake state for one player
pub struct StakeController {
    ledger: Arc<dyn LedgerClient>,
    fee: Amount,
    state: watch::Receiver<PollState>,
    refresh: Option<RefreshHandle>,
    /// Selected square and the round it was made in
    selection: Option<(Square, RoundId)>,
    pending: Option<PendingSubmission>,
}

impl StakeController {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        fee: Amount,
        state: watch::Receiver<PollState>,
        refresh: Option<RefreshHandle>,
    ) -> Self {
        Self {
            ledger,
            fee,
            state,
            refresh,
            selection: None,
            pending: None,
        }
    }

    /// Stake currently in flight
    pub fn pending(&self) -> Option<&PendingSubmission> {
        self.pending.as_ref()
    }

    /// Currently selected square; a selection made in an earlier round
    /// than the latest snapshot does not count
    pub fn selection(&self) -> Option<Square> {
        let (square, selected_in) = self.selection?;
        let current = self.latest()?.round_id();
        (selected_in == current).then_some(square)
    }

    fn latest(&self) -> Option<Arc<RoundSnapshot>> {
        self.state.borrow().snapshot.clone()
    }

    /// Select a square in the current round
    pub fn select(&mut self, index: u8) -> Result<Square, SelectError> {
        let square = Square::new(index).ok_or(SelectError::InvalidSquare(index))?;
        let snapshot = self.latest().ok_or(SelectError::NoSnapshot)?;
        if snapshot.finalized() {
            return Err(SelectError::RoundFinalized(snapshot.round_id()));
        }

        self.selection = Some((square, snapshot.round_id()));
        Ok(square)
    }

    /// Stake on the selected square
    pub async fn submit_selected(&mut self, now_unix: i64) -> Result<TxHandle, SubmitError> {
        let square = match self.selection() {
            Some(square) => square,
            None => {
                self.selection = None;
                return Err(SubmitError::NoSelection);
            }
        };
        self.submit(u8::from(square), now_unix).await
    }

    /// Stake the entry fee on `index` in the current round
    pub async fn submit(&mut self, index: u8, now_unix: i64) -> Result<TxHandle, SubmitError> {
        let square = Square::new(index).ok_or(SubmitError::InvalidSquare(index))?;
        if self.pending.is_some() {
            return Err(SubmitError::AlreadyPending);
        }
        let snapshot = self.latest().ok_or(SubmitError::NoSnapshot)?;
        let phase = derive(&snapshot, now_unix);
        if !phase.is_active() {
            return Err(SubmitError::RoundNotActive(phase));
        }

        let round_id = snapshot.round_id();
        self.pending = Some(PendingSubmission {
            target_round_id: round_id,
            square,
            submitted_at: now_unix,
            tx: None,
            status: SubmissionStatus::Signing,
        });

        match self.ledger.submit_stake(square, self.fee).await {
            Ok(tx) => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.tx = Some(tx);
                    pending.status = SubmissionStatus::Submitted;
                }
                tracing::info!("Stake on square {} in round {} broadcast: {}", square, round_id, tx);

                if let Some(refresh) = &self.refresh {
                    refresh.request_refresh_after(REFRESH_DELAY);
                }
                Ok(tx)
            }
            Err(e) => {
                self.pending = None;
                if e.is_guard_rejection() {
                    tracing::info!("Stake on square {} refused by ledger: {}", square, e);
                } else {
                    tracing::warn!("Stake on square {} rejected: {}", square, e);
                }
                Err(SubmitError::Rejected(e))
            }
        }
    }

    /// Fold a freshly published snapshot into local state
    pub async fn reconcile(&mut self, snapshot: &RoundSnapshot) -> Option<SubmissionOutcome> {
        let round_id = snapshot.round_id();

        if let Some((square, selected_in)) = self.selection {
            if selected_in != round_id {
                tracing::debug!(
                    "Round {} -> {}, clearing selection {}",
                    selected_in,
                    round_id,
                    square
                );
                self.selection = None;
            }
        }

        let pending = self.pending.as_ref()?;
        if pending.target_round_id != round_id {
            let pending = self.pending.take()?;
            tracing::info!(
                "Stake on square {} for round {} is stale (round is now {}), discarding",
                pending.square,
                pending.target_round_id,
                round_id
            );
            return Some(SubmissionOutcome::Stale {
                target_round_id: pending.target_round_id,
                observed_round_id: round_id,
                square: pending.square,
            });
        }

        let tx = match (pending.status, pending.tx) {
            (SubmissionStatus::Submitted, Some(tx)) => tx,
            _ => return None,
        };

        match self.ledger.read_transaction_status(tx).await {
            Ok(TxStatus::Pending) => None,
            Ok(TxStatus::Included) => {
                let mut pending = self.pending.take()?;
                pending.status = SubmissionStatus::Confirmed;
                tracing::info!(
                    "Stake on square {} confirmed in round {}",
                    pending.square,
                    pending.target_round_id
                );
                Some(SubmissionOutcome::Confirmed {
                    round_id: pending.target_round_id,
                    square: pending.square,
                    tx,
                })
            }
            Ok(TxStatus::Reverted) => {
                let mut pending = self.pending.take()?;
                pending.status = SubmissionStatus::Failed;
                tracing::info!("Stake {} reverted by ledger guard", tx);
                Some(SubmissionOutcome::Failed {
                    round_id: pending.target_round_id,
                    square: pending.square,
                    tx,
                })
            }
            Err(e) => {
                tracing::debug!("Receipt lookup for {} failed: {}", tx, e);
                None
            }
        }
    }

    /// Reconcile every new snapshot until the pending stake resolves.
    ///
    /// Returns `None` when nothing is pending or the poller went away.
    pub async fn wait_for_outcome(&mut self) -> Option<SubmissionOutcome> {
        while self.pending.is_some() {
            self.state.changed().await.ok()?;
            let snapshot = self.state.borrow_and_update().snapshot.clone();
            if let Some(snapshot) = snapshot {
                if let Some(outcome) = self.reconcile(&snapshot).await {
                    return Some(outcome);
                }
            }
        }
        None
    }
}
