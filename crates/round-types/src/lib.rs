//! Shared round types for the BaseMiner ledger
//!
//! These types mirror the BaseMiner contract's view functions
//! (`roundId`, `getRoundDetails`) and are shared by the ledger client,
//! the sync layer and the binary.

use alloy_primitives::{
    utils::{format_ether, parse_ether},
    U256,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of squares on the board (5x5 grid)
pub const SQUARE_COUNT: usize = 25;

/// Entry fee charged by `deploy`, in ether
pub const DEFAULT_ENTRY_FEE: &str = "0.0001";

/// Ledger amount in wei
pub type Amount = U256;

/// Monotonic round identifier
pub type RoundId = u64;

/// Index of a square on the board, always in `[0, 24]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Square(u8);

impl Square {
    /// Create a square from a 0-based index, `None` when off the board
    pub fn new(index: u8) -> Option<Self> {
        ((index as usize) < SQUARE_COUNT).then_some(Self(index))
    }

    /// 0-based index, as the contract addresses it
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// 1-based label shown to players
    pub fn label(self) -> usize {
        self.index() + 1
    }

    /// Iterate over every square on the board
    pub fn all() -> impl Iterator<Item = Square> {
        (0..SQUARE_COUNT as u8).map(Square)
    }
}

impl TryFrom<u8> for Square {
    type Error = SnapshotError;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        Square::new(index).ok_or(SnapshotError::SquareOutOfRange(U256::from(index)))
    }
}

impl TryFrom<U256> for Square {
    type Error = SnapshotError;

    fn try_from(raw: U256) -> Result<Self, Self::Error> {
        if raw < U256::from(SQUARE_COUNT) {
            Ok(Square(raw.to::<u8>()))
        } else {
            Err(SnapshotError::SquareOutOfRange(raw))
        }
    }
}

impl From<Square> for u8 {
    fn from(square: Square) -> Self {
        square.0
    }
}

impl From<Square> for U256 {
    fn from(square: Square) -> Self {
        U256::from(square.0)
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.label())
    }
}

/// Raw output of `getRoundDetails(roundId)`
///
/// `winner` is only meaningful once `finalized` is set; the contract leaves
/// it at zero for open rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundDetails {
    pub end_time_unix: i64,
    pub total_staked: Amount,
    pub square_stakes: [Amount; SQUARE_COUNT],
    pub finalized: bool,
    pub winner: U256,
}

/// Immutable view of one round, replaced wholesale on every poll
///
/// Only constructible through [`RoundSnapshot::from_details`], so every
/// snapshot in circulation satisfies `finalized => winner.is_some()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundSnapshot {
    round_id: RoundId,
    end_time_unix: i64,
    total_staked: Amount,
    square_stakes: [Amount; SQUARE_COUNT],
    finalized: bool,
    winner: Option<Square>,
}

impl RoundSnapshot {
    /// Validate ledger data for `round_id` and build a snapshot from it
    pub fn from_details(round_id: RoundId, details: RoundDetails) -> Result<Self, SnapshotError> {
        let winner = if details.finalized {
            Some(Square::try_from(details.winner).map_err(|_| {
                SnapshotError::WinnerOutOfRange {
                    round_id,
                    winner: details.winner,
                }
            })?)
        } else {
            None
        };

        Ok(Self {
            round_id,
            end_time_unix: details.end_time_unix,
            total_staked: details.total_staked,
            square_stakes: details.square_stakes,
            finalized: details.finalized,
            winner,
        })
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    pub fn end_time_unix(&self) -> i64 {
        self.end_time_unix
    }

    pub fn total_staked(&self) -> Amount {
        self.total_staked
    }

    pub fn square_stakes(&self) -> &[Amount; SQUARE_COUNT] {
        &self.square_stakes
    }

    /// Stake total on a single square
    pub fn stake_on(&self, square: Square) -> Amount {
        self.square_stakes[square.index()]
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    /// Winning square, `None` until the round is finalized
    pub fn winner(&self) -> Option<Square> {
        self.winner
    }

    /// Seconds until the deadline according to the caller's clock.
    ///
    /// Advisory only: client and chain clocks drift, round transitions are
    /// detected by `round_id`.
    pub fn seconds_remaining(&self, now_unix: i64) -> i64 {
        self.end_time_unix - now_unix
    }
}

/// Snapshot validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("Square out of range: {0}")]
    SquareOutOfRange(U256),

    #[error("Round {round_id} is finalized with out-of-range winner {winner}")]
    WinnerOutOfRange { round_id: RoundId, winner: U256 },
}

/// Invalid fee configuration
#[derive(Debug, thiserror::Error)]
#[error("Invalid entry fee {value:?}: {reason}")]
pub struct FeeError {
    pub value: String,
    pub reason: String,
}

/// Parse a decimal ether amount such as `"0.0001"` into wei
pub fn parse_fee(value: &str) -> Result<Amount, FeeError> {
    parse_ether(value.trim()).map_err(|e| FeeError {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Default entry fee in wei
pub fn default_entry_fee() -> Amount {
    // 0.0001 ether
    U256::from(100_000_000_000_000u64)
}

/// Format a wei amount as a decimal ether string
pub fn format_amount(amount: Amount) -> String {
    format_ether(amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(finalized: bool, winner: u64) -> RoundDetails {
        RoundDetails {
            end_time_unix: 1_700_000_000,
            total_staked: U256::from(300u64),
            square_stakes: std::array::from_fn(|i| U256::from(if i == 7 { 300u64 } else { 0 })),
            finalized,
            winner: U256::from(winner),
        }
    }

    #[test]
    fn test_square_bounds() {
        assert!(Square::new(0).is_some());
        assert!(Square::new(24).is_some());
        assert!(Square::new(25).is_none());
        assert_eq!(Square::new(6).unwrap().label(), 7);
        assert_eq!(Square::all().count(), SQUARE_COUNT);
        assert!(Square::try_from(U256::from(1_000u64)).is_err());
    }

    #[test]
    fn test_open_round_ignores_raw_winner() {
        // Open rounds carry the contract's zero/garbage winner field
        let snapshot = RoundSnapshot::from_details(3, details(false, 99)).unwrap();
        assert_eq!(snapshot.round_id(), 3);
        assert!(!snapshot.finalized());
        assert_eq!(snapshot.winner(), None);
    }

    #[test]
    fn test_finalized_round_requires_valid_winner() {
        let snapshot = RoundSnapshot::from_details(1, details(true, 7)).unwrap();
        assert_eq!(snapshot.winner(), Square::new(7));
        assert_eq!(snapshot.stake_on(Square::new(7).unwrap()), U256::from(300u64));

        let err = RoundSnapshot::from_details(1, details(true, 25)).unwrap_err();
        assert!(matches!(err, SnapshotError::WinnerOutOfRange { round_id: 1, .. }));
    }

    #[test]
    fn test_fee_parsing() {
        assert_eq!(parse_fee(DEFAULT_ENTRY_FEE).unwrap(), default_entry_fee());
        assert!(format_amount(default_entry_fee()).starts_with("0.0001"));
        assert!(parse_fee("not-a-number").is_err());
    }

    #[test]
    fn test_square_serde_rejects_off_board_index() {
        let square: Square = serde_json::from_str("24").unwrap();
        assert_eq!(square.index(), 24);
        assert!(serde_json::from_str::<Square>("25").is_err());
    }
}
