//! In-memory ledger - the round contract's guards without a chain
//!
//! Enforces the same preconditions the deployed contract does:
//! - `deploy` needs the exact entry fee on an open, unexpired round
//! - `reset` needs an expired round that is not yet finalized
//!
//! A reset finalizes the expired round (most-staked square wins, lowest
//! index on ties) and opens the next one. Used by the test suites and by
//! offline `--ledger memory` runs.

use crate::client::{LedgerClient, LedgerError, TxHandle, TxStatus};
use alloy::primitives::{B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use round_types::{Amount, RoundDetails, RoundId, Square, SQUARE_COUNT};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Time source for the in-memory ledger
pub enum LedgerClock {
    /// Wall clock
    System,
    /// Manually driven clock (tests)
    Manual(AtomicI64),
}

impl LedgerClock {
    fn now(&self) -> i64 {
        match self {
            LedgerClock::System => chrono::Utc::now().timestamp(),
            LedgerClock::Manual(now) => now.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone)]
struct RoundRecord {
    end_time_unix: i64,
    total_staked: Amount,
    square_stakes: [Amount; SQUARE_COUNT],
    finalized: bool,
    winner: Option<Square>,
}

impl RoundRecord {
    fn open(end_time_unix: i64) -> Self {
        Self {
            end_time_unix,
            total_staked: U256::ZERO,
            square_stakes: [U256::ZERO; SQUARE_COUNT],
            finalized: false,
            winner: None,
        }
    }

    /// Most-staked square, lowest index on ties
    fn leading_square(&self) -> Option<Square> {
        Square::all().reduce(|best, square| {
            if self.square_stakes[square.index()] > self.square_stakes[best.index()] {
                square
            } else {
                best
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct QueuedStake {
    tx: TxHandle,
    square: Square,
    fee: Amount,
}

/// Mutable ledger state behind the mutex
struct LedgerState {
    round_id: RoundId,
    rounds: HashMap<RoundId, RoundRecord>,
    round_duration_secs: i64,
    entry_fee: Amount,
    next_tx: u64,
    receipts: HashMap<TxHandle, TxStatus>,
    /// Stakes broadcast but not yet mined (only used while holding)
    mempool: Vec<QueuedStake>,
    hold_stakes: bool,
    // Fault injection
    fail_reads: u32,
    advance_after_details_read: bool,
    reject_next_stake: Option<String>,
    fail_submissions: u32,
    // Counters
    advances: u64,
    guard_rejections: u64,
}

impl LedgerState {
    fn current(&self) -> &RoundRecord {
        &self.rounds[&self.round_id]
    }

    fn next_handle(&mut self) -> TxHandle {
        self.next_tx += 1;
        TxHandle(B256::left_padding_from(&self.next_tx.to_be_bytes()))
    }

    fn take_read_failure(&mut self) -> Result<(), LedgerError> {
        if self.fail_reads > 0 {
            self.fail_reads -= 1;
            return Err(LedgerError::Transport("injected read failure".to_string()));
        }
        Ok(())
    }

    fn take_submit_failure(&mut self) -> Result<(), LedgerError> {
        if self.fail_submissions > 0 {
            self.fail_submissions -= 1;
            return Err(LedgerError::Transport("injected broadcast failure".to_string()));
        }
        Ok(())
    }

    /// `reset()` guard and effect
    fn advance(&mut self, now: i64) -> Result<(), LedgerError> {
        let round = self.current();
        if round.finalized {
            return Err(LedgerError::GuardRejected("round already finalized".to_string()));
        }
        if now < round.end_time_unix {
            return Err(LedgerError::GuardRejected("round not yet expired".to_string()));
        }
        self.force_advance(now);
        Ok(())
    }

    fn force_advance(&mut self, now: i64) {
        let duration = self.round_duration_secs;
        let round_id = self.round_id;
        if let Some(round) = self.rounds.get_mut(&round_id) {
            round.winner = round.leading_square();
            round.finalized = true;
        }
        self.round_id += 1;
        self.rounds.insert(self.round_id, RoundRecord::open(now + duration));
        self.advances += 1;
    }

    /// `deploy(square)` guard and effect
    fn apply_stake(&mut self, square: Square, fee: Amount, now: i64) -> Result<(), LedgerError> {
        if fee != self.entry_fee {
            return Err(LedgerError::GuardRejected(format!(
                "fee mismatch: expected {}, got {}",
                self.entry_fee, fee
            )));
        }
        let round_id = self.round_id;
        let round = self
            .rounds
            .get_mut(&round_id)
            .ok_or_else(|| LedgerError::InvalidData(format!("unknown round {}", round_id)))?;
        if round.finalized {
            return Err(LedgerError::GuardRejected("round already finalized".to_string()));
        }
        if now >= round.end_time_unix {
            return Err(LedgerError::GuardRejected("round expired".to_string()));
        }
        round.square_stakes[square.index()] += fee;
        round.total_staked += fee;
        Ok(())
    }
}

/// Guarded round contract held in process memory
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    clock: LedgerClock,
}

impl InMemoryLedger {
    /// Ledger driven by the wall clock; round 1 opens immediately
    pub fn new(round_duration_secs: i64, entry_fee: Amount) -> Self {
        Self::with_clock(LedgerClock::System, round_duration_secs, entry_fee)
    }

    /// Ledger driven by a manual clock starting at `now`
    pub fn with_manual_clock(now: i64, round_duration_secs: i64, entry_fee: Amount) -> Self {
        Self::with_clock(
            LedgerClock::Manual(AtomicI64::new(now)),
            round_duration_secs,
            entry_fee,
        )
    }

    fn with_clock(clock: LedgerClock, round_duration_secs: i64, entry_fee: Amount) -> Self {
        let now = clock.now();
        let mut rounds = HashMap::new();
        rounds.insert(1, RoundRecord::open(now + round_duration_secs));

        Self {
            state: Mutex::new(LedgerState {
                round_id: 1,
                rounds,
                round_duration_secs,
                entry_fee,
                next_tx: 0,
                receipts: HashMap::new(),
                mempool: Vec::new(),
                hold_stakes: false,
                fail_reads: 0,
                advance_after_details_read: false,
                reject_next_stake: None,
                fail_submissions: 0,
                advances: 0,
                guard_rejections: 0,
            }),
            clock,
        }
    }

    /// Current ledger time
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Set the manual clock (no-op on the system clock)
    pub fn set_time(&self, now: i64) {
        if let LedgerClock::Manual(clock) = &self.clock {
            clock.store(now, Ordering::SeqCst);
        }
    }

    /// Move the manual clock forward
    pub fn advance_time(&self, secs: i64) {
        if let LedgerClock::Manual(clock) = &self.clock {
            clock.fetch_add(secs, Ordering::SeqCst);
        }
    }

    /// Current round id, bypassing fault injection
    pub fn round_id(&self) -> RoundId {
        self.state.lock().round_id
    }

    /// Deadline of the current round
    pub fn round_end_time(&self) -> i64 {
        self.state.lock().current().end_time_unix
    }

    /// Successful round advances so far
    pub fn advance_count(&self) -> u64 {
        self.state.lock().advances
    }

    /// Calls refused by a ledger guard so far
    pub fn guard_rejection_count(&self) -> u64 {
        self.state.lock().guard_rejections
    }

    /// Stake total on `square` in `round_id`
    pub fn stake_on(&self, round_id: RoundId, square: Square) -> Amount {
        self.state
            .lock()
            .rounds
            .get(&round_id)
            .map(|round| round.square_stakes[square.index()])
            .unwrap_or(U256::ZERO)
    }

    /// Fail the next `count` reads with a transport error
    pub fn fail_next_reads(&self, count: u32) {
        self.state.lock().fail_reads = count;
    }

    /// Turn the round over right after the next details read
    pub fn advance_after_next_details_read(&self) {
        self.state.lock().advance_after_details_read = true;
    }

    /// Fail the next `count` broadcasts with a transport error
    pub fn fail_next_submissions(&self, count: u32) {
        self.state.lock().fail_submissions = count;
    }

    /// Make the wallet decline the next stake
    pub fn reject_next_stake(&self, reason: &str) {
        self.state.lock().reject_next_stake = Some(reason.to_string());
    }

    /// Keep stakes in the mempool until [`InMemoryLedger::mine`] is called
    pub fn hold_stakes(&self, hold: bool) {
        self.state.lock().hold_stakes = hold;
    }

    /// Execute every held stake against the current round
    pub fn mine(&self) -> usize {
        let now = self.now();
        let mut state = self.state.lock();
        let queued = std::mem::take(&mut state.mempool);
        for stake in &queued {
            let status = match state.apply_stake(stake.square, stake.fee, now) {
                Ok(()) => TxStatus::Included,
                Err(e) => {
                    tracing::debug!("Held stake {} reverted: {}", stake.tx, e);
                    state.guard_rejections += 1;
                    TxStatus::Reverted
                }
            };
            state.receipts.insert(stake.tx, status);
        }
        queued.len()
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn read_current_round_id(&self) -> Result<RoundId, LedgerError> {
        let mut state = self.state.lock();
        state.take_read_failure()?;
        Ok(state.round_id)
    }

    async fn read_round_details(&self, round_id: RoundId) -> Result<RoundDetails, LedgerError> {
        let now = self.now();
        let mut state = self.state.lock();
        state.take_read_failure()?;

        let round = state
            .rounds
            .get(&round_id)
            .cloned()
            .ok_or_else(|| LedgerError::InvalidData(format!("unknown round {}", round_id)))?;

        if state.advance_after_details_read {
            state.advance_after_details_read = false;
            state.force_advance(now);
        }

        Ok(RoundDetails {
            end_time_unix: round.end_time_unix,
            total_staked: round.total_staked,
            square_stakes: round.square_stakes,
            finalized: round.finalized,
            winner: round.winner.map(<U256 as From<Square>>::from).unwrap_or(U256::ZERO),
        })
    }

    async fn submit_stake(&self, square: Square, fee: Amount) -> Result<TxHandle, LedgerError> {
        let now = self.now();
        let mut state = self.state.lock();

        if let Some(reason) = state.reject_next_stake.take() {
            return Err(LedgerError::Rejected(reason));
        }
        state.take_submit_failure()?;

        if state.hold_stakes {
            let tx = state.next_handle();
            state.mempool.push(QueuedStake { tx, square, fee });
            state.receipts.insert(tx, TxStatus::Pending);
            return Ok(tx);
        }

        // Gas estimation runs the guards before anything is broadcast
        if let Err(e) = state.apply_stake(square, fee, now) {
            state.guard_rejections += 1;
            return Err(e);
        }
        let tx = state.next_handle();
        state.receipts.insert(tx, TxStatus::Included);
        Ok(tx)
    }

    async fn submit_advance_round(&self) -> Result<TxHandle, LedgerError> {
        let now = self.now();
        let mut state = self.state.lock();
        state.take_submit_failure()?;

        if let Err(e) = state.advance(now) {
            state.guard_rejections += 1;
            return Err(e);
        }
        let tx = state.next_handle();
        state.receipts.insert(tx, TxStatus::Included);
        tracing::debug!("Round advanced to {} by {}", state.round_id, tx);
        Ok(tx)
    }

    async fn read_transaction_status(&self, tx: TxHandle) -> Result<TxStatus, LedgerError> {
        let mut state = self.state.lock();
        state.take_read_failure()?;
        state
            .receipts
            .get(&tx)
            .copied()
            .ok_or_else(|| LedgerError::InvalidData(format!("unknown transaction {}", tx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const T0: i64 = 1_700_000_000;
    const DURATION: i64 = 300;

    fn fee() -> Amount {
        round_types::default_entry_fee()
    }

    fn ledger() -> InMemoryLedger {
        InMemoryLedger::with_manual_clock(T0, DURATION, fee())
    }

    fn square(index: u8) -> Square {
        Square::new(index).unwrap()
    }

    #[tokio::test]
    async fn test_initial_round() {
        let ledger = ledger();
        assert_eq!(ledger.read_current_round_id().await.unwrap(), 1);

        let details = ledger.read_round_details(1).await.unwrap();
        assert_eq!(details.end_time_unix, T0 + DURATION);
        assert!(!details.finalized);
        assert_eq!(details.total_staked, U256::ZERO);
    }

    #[tokio::test]
    async fn test_stake_guards() {
        let ledger = ledger();

        ledger.submit_stake(square(7), fee()).await.unwrap();
        assert_eq!(ledger.stake_on(1, square(7)), fee());

        let err = ledger.submit_stake(square(7), fee() + U256::from(1u64)).await.unwrap_err();
        assert!(err.is_guard_rejection());

        ledger.set_time(T0 + DURATION);
        let err = ledger.submit_stake(square(3), fee()).await.unwrap_err();
        assert!(err.is_guard_rejection());
        assert_eq!(ledger.guard_rejection_count(), 2);
    }

    #[tokio::test]
    async fn test_advance_requires_expiry() {
        let ledger = ledger();

        // Two immediate attempts on an open round change nothing
        assert!(ledger.submit_advance_round().await.unwrap_err().is_guard_rejection());
        assert!(ledger.submit_advance_round().await.unwrap_err().is_guard_rejection());
        assert_eq!(ledger.advance_count(), 0);
        assert_eq!(ledger.round_id(), 1);

        ledger.set_time(T0 + DURATION);
        ledger.submit_advance_round().await.unwrap();
        assert_eq!(ledger.round_id(), 2);
        assert_eq!(ledger.round_end_time(), T0 + 2 * DURATION);

        // Same tick, second watchdog: the new round is not expired
        assert!(ledger.submit_advance_round().await.unwrap_err().is_guard_rejection());
        assert_eq!(ledger.advance_count(), 1);
    }

    #[tokio::test]
    async fn test_advance_finalizes_with_leading_square() {
        let ledger = ledger();
        ledger.submit_stake(square(4), fee()).await.unwrap();
        ledger.submit_stake(square(9), fee()).await.unwrap();
        ledger.submit_stake(square(9), fee()).await.unwrap();

        ledger.set_time(T0 + DURATION + 5);
        ledger.submit_advance_round().await.unwrap();

        let old = ledger.read_round_details(1).await.unwrap();
        assert!(old.finalized);
        assert_eq!(old.winner, U256::from(9u64));
        assert_eq!(old.total_staked, fee() * U256::from(3u64));
    }

    #[tokio::test]
    async fn test_concurrent_advances_single_transition() {
        let ledger = Arc::new(ledger());
        ledger.set_time(T0 + DURATION + 5);

        let attempts = (0..4).map(|_| {
            let ledger = ledger.clone();
            async move { ledger.submit_advance_round().await }
        });
        let results = futures::future::join_all(attempts).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(LedgerError::is_guard_rejection));
        assert_eq!(ledger.round_id(), 2);
    }

    #[tokio::test]
    async fn test_held_stake_lands_in_round_current_at_mining() {
        let ledger = ledger();
        ledger.hold_stakes(true);

        let tx = ledger.submit_stake(square(2), fee()).await.unwrap();
        assert_eq!(ledger.read_transaction_status(tx).await.unwrap(), TxStatus::Pending);

        ledger.set_time(T0 + DURATION);
        ledger.submit_advance_round().await.unwrap();
        assert_eq!(ledger.mine(), 1);

        assert_eq!(ledger.read_transaction_status(tx).await.unwrap(), TxStatus::Included);
        assert_eq!(ledger.stake_on(1, square(2)), U256::ZERO);
        assert_eq!(ledger.stake_on(2, square(2)), fee());
    }

    #[tokio::test]
    async fn test_held_stake_reverts_on_expired_round() {
        let ledger = ledger();
        ledger.hold_stakes(true);

        let tx = ledger.submit_stake(square(2), fee()).await.unwrap();
        ledger.set_time(T0 + DURATION + 1);
        ledger.mine();

        assert_eq!(ledger.read_transaction_status(tx).await.unwrap(), TxStatus::Reverted);
        assert_eq!(ledger.guard_rejection_count(), 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let ledger = ledger();

        ledger.fail_next_reads(1);
        assert!(ledger.read_current_round_id().await.unwrap_err().is_transient());
        assert_eq!(ledger.read_current_round_id().await.unwrap(), 1);

        ledger.advance_after_next_details_read();
        let details = ledger.read_round_details(1).await.unwrap();
        assert!(!details.finalized);
        assert_eq!(ledger.read_current_round_id().await.unwrap(), 2);

        ledger.fail_next_submissions(1);
        ledger.set_time(T0 + DURATION);
        assert!(ledger.submit_advance_round().await.unwrap_err().is_transient());
        assert_eq!(ledger.round_id(), 2);
        ledger.set_time(T0);

        ledger.reject_next_stake("user declined");
        let err = ledger.submit_stake(square(0), fee()).await.unwrap_err();
        assert_eq!(err, LedgerError::Rejected("user declined".to_string()));
    }
}
