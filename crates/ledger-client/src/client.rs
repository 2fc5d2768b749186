//! Ledger Client - the read/write surface of the round contract
//!
//! Every actor (viewer, staker, watchdog) talks to the ledger through
//! [`LedgerClient`]. The trait is stateless from the caller's point of view:
//! reads have no side effects and writes return as soon as the transaction
//! is accepted into the pending set.

use alloy::primitives::B256;
use async_trait::async_trait;
use round_types::{Amount, RoundDetails, RoundId, SnapshotError, Square};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of a broadcast transaction (its hash)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHandle(pub B256);

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<B256> for TxHandle {
    fn from(hash: B256) -> Self {
        Self(hash)
    }
}

/// Inclusion status of a broadcast transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    /// Not yet in a block
    Pending,
    /// Included and executed successfully
    Included,
    /// Included but reverted by a ledger guard
    Reverted,
}

/// Ledger access errors, classified by how callers must react to them
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// RPC or network failure; retry on the next tick
    #[error("Ledger transport error: {0}")]
    Transport(String),

    /// The wallet declined or could not produce the transaction
    #[error("Submission rejected: {0}")]
    Rejected(String),

    /// An on-ledger precondition refused the call
    #[error("Ledger guard rejected call: {0}")]
    GuardRejected(String),

    /// The ledger returned data that cannot describe a valid round
    #[error("Invalid ledger data: {0}")]
    InvalidData(String),
}

impl LedgerError {
    /// Expected under concurrency (duplicate advance, stake on a closed round)
    pub fn is_guard_rejection(&self) -> bool {
        matches!(self, LedgerError::GuardRejected(_))
    }

    /// Recovered by retrying on the next tick
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transport(_))
    }
}

impl From<SnapshotError> for LedgerError {
    fn from(e: SnapshotError) -> Self {
        LedgerError::InvalidData(e.to_string())
    }
}

/// Typed access to the shared round contract
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current round id (`roundId()`)
    async fn read_current_round_id(&self) -> Result<RoundId, LedgerError>;

    /// Details of `round_id` (`getRoundDetails(roundId)`)
    async fn read_round_details(&self, round_id: RoundId) -> Result<RoundDetails, LedgerError>;

    /// Payable stake on `square` (`deploy(square)` with `fee` attached)
    async fn submit_stake(&self, square: Square, fee: Amount) -> Result<TxHandle, LedgerError>;

    /// Advance an expired round (`reset()`)
    async fn submit_advance_round(&self) -> Result<TxHandle, LedgerError>;

    /// Receipt lookup for a previously returned handle
    async fn read_transaction_status(&self, tx: TxHandle) -> Result<TxStatus, LedgerError>;
}
