//! Miner Configuration

use alloy::primitives::Address;
use anyhow::{ensure, Context, Result};
use clap::Args;
use ledger_client::DEFAULT_RPC_URL;
use round_sync::poller::DEFAULT_POLL_INTERVAL_MS;
use round_sync::watchdog::DEFAULT_WATCHDOG_INTERVAL_SECS;
use round_types::{parse_fee, Amount, DEFAULT_ENTRY_FEE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings shared by every mode. Keys missing from a config file keep
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// JSON-RPC endpoint of the EVM node
    pub rpc_url: String,
    /// BaseMiner contract address (hex)
    pub contract: Option<String>,
    pub poll_interval_ms: u64,
    pub watchdog_interval_secs: u64,
    /// Stake per deploy, in ether
    pub entry_fee: String,
    /// Round length of the in-memory ledger
    pub memory_round_secs: i64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            contract: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            watchdog_interval_secs: DEFAULT_WATCHDOG_INTERVAL_SECS,
            entry_fee: DEFAULT_ENTRY_FEE.to_string(),
            memory_round_secs: 120,
        }
    }
}

/// Command-line values that take precedence over the config file
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigOverrides {
    /// JSON-RPC endpoint [default: https://sepolia.base.org]
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: Option<String>,

    /// BaseMiner contract address
    #[arg(long, env = "CONTRACT_ADDRESS")]
    pub contract: Option<String>,

    /// Round poll interval in milliseconds [default: 3000]
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Watchdog check interval in seconds [default: 60]
    #[arg(long)]
    pub watchdog_interval_secs: Option<u64>,

    /// Entry fee in ether [default: 0.0001]
    #[arg(long)]
    pub entry_fee: Option<String>,

    /// Round length for `--ledger memory` [default: 120]
    #[arg(long)]
    pub memory_round_secs: Option<i64>,
}

impl MinerConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid config file {:?}", path))
    }

    /// Apply command-line overrides
    pub fn merge(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(rpc_url) = overrides.rpc_url {
            self.rpc_url = rpc_url;
        }
        if overrides.contract.is_some() {
            self.contract = overrides.contract;
        }
        if let Some(ms) = overrides.poll_interval_ms {
            self.poll_interval_ms = ms;
        }
        if let Some(secs) = overrides.watchdog_interval_secs {
            self.watchdog_interval_secs = secs;
        }
        if let Some(fee) = overrides.entry_fee {
            self.entry_fee = fee;
        }
        if let Some(secs) = overrides.memory_round_secs {
            self.memory_round_secs = secs;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.poll_interval_ms > 0, "poll_interval_ms must be positive");
        ensure!(self.watchdog_interval_secs > 0, "watchdog_interval_secs must be positive");
        ensure!(self.memory_round_secs > 0, "memory_round_secs must be positive");
        self.entry_fee()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    /// Entry fee in wei
    pub fn entry_fee(&self) -> Result<Amount> {
        Ok(parse_fee(&self.entry_fee)?)
    }

    pub fn contract_address(&self) -> Result<Address> {
        let raw = self
            .contract
            .as_deref()
            .context("No contract address (use --contract or CONTRACT_ADDRESS)")?;
        raw.trim()
            .parse()
            .with_context(|| format!("Invalid contract address {:?}", raw))
    }
}
