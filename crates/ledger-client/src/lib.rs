//! Ledger Client - typed access to the BaseMiner round contract
//!
//! - [`LedgerClient`]: the read/write surface every actor goes through
//! - [`EvmLedger`]: the deployed contract over JSON-RPC
//! - [`InMemoryLedger`]: the same guards in process memory

pub mod client;
pub mod evm;
pub mod memory;

pub use client::{LedgerClient, LedgerError, TxHandle, TxStatus};
pub use evm::{EvmLedger, DEFAULT_RPC_URL};
pub use memory::{InMemoryLedger, LedgerClock};
