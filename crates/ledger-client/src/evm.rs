//! EVM Ledger - BaseMiner contract over JSON-RPC
//!
//! Reads go through `eth_call`, writes are signed locally and broadcast.
//! Writes only wait for the node to accept the transaction; receipts are
//! looked up separately through [`LedgerClient::read_transaction_status`].

use crate::client::{LedgerClient, LedgerError, TxHandle, TxStatus};
use alloy::{
    primitives::{Address, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol,
    transports::http::reqwest::Url,
};
use async_trait::async_trait;
use round_types::{Amount, RoundDetails, RoundId, Square};

sol! {
    #[sol(rpc)]
    contract BaseMiner {
        function roundId() external view returns (uint256);
        function getRoundDetails(uint256 _roundId) external view returns (
            uint256 endTime,
            uint256 totalEth,
            uint256[25] squareStakes,
            bool finalized,
            uint256 winner
        );
        function deploy(uint256 square) external payable;
        function reset() external;
    }
}

/// Base Sepolia public RPC endpoint
pub const DEFAULT_RPC_URL: &str = "https://sepolia.base.org";

/// Ledger client backed by an EVM node
pub struct EvmLedger {
    provider: DynProvider,
    contract: BaseMiner::BaseMinerInstance<DynProvider>,
    /// Whether a signer is attached (writes need one)
    can_sign: bool,
}

impl EvmLedger {
    /// Read-only client; writes fail with [`LedgerError::Rejected`]
    pub fn read_only(rpc_url: &str, contract: Address) -> Result<Self, LedgerError> {
        let url = parse_url(rpc_url)?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self::with_provider(provider, contract, false))
    }

    /// Client that signs writes with a hex-encoded private key
    pub fn with_private_key(
        rpc_url: &str,
        contract: Address,
        private_key: &str,
    ) -> Result<Self, LedgerError> {
        let url = parse_url(rpc_url)?;
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|e| LedgerError::Rejected(format!("Invalid private key: {}", e)))?;
        tracing::info!("Signing ledger writes as {}", signer.address());

        let provider = ProviderBuilder::new()
            .wallet(signer)
            .connect_http(url)
            .erased();
        Ok(Self::with_provider(provider, contract, true))
    }

    fn with_provider(provider: DynProvider, contract: Address, can_sign: bool) -> Self {
        let contract = BaseMiner::new(contract, provider.clone());
        Self {
            provider,
            contract,
            can_sign,
        }
    }

    fn ensure_signer(&self) -> Result<(), LedgerError> {
        if self.can_sign {
            Ok(())
        } else {
            Err(LedgerError::Rejected("no signer configured".to_string()))
        }
    }
}

#[async_trait]
impl LedgerClient for EvmLedger {
    async fn read_current_round_id(&self) -> Result<RoundId, LedgerError> {
        let round_id = self.contract.roundId().call().await.map_err(classify_read)?;
        u64::try_from(round_id)
            .map_err(|_| LedgerError::InvalidData(format!("Round id {} exceeds u64", round_id)))
    }

    async fn read_round_details(&self, round_id: RoundId) -> Result<RoundDetails, LedgerError> {
        let details = self
            .contract
            .getRoundDetails(U256::from(round_id))
            .call()
            .await
            .map_err(classify_read)?;

        Ok(RoundDetails {
            end_time_unix: to_unix(details.endTime)?,
            total_staked: details.totalEth,
            square_stakes: details.squareStakes,
            finalized: details.finalized,
            winner: details.winner,
        })
    }

    async fn submit_stake(&self, square: Square, fee: Amount) -> Result<TxHandle, LedgerError> {
        self.ensure_signer()?;
        let pending = self
            .contract
            .deploy_call(<U256 as From<Square>>::from(square))
            .value(fee)
            .send()
            .await
            .map_err(classify_write)?;

        let tx = TxHandle(*pending.tx_hash());
        tracing::debug!("Stake on square {} broadcast: {}", square, tx);
        Ok(tx)
    }

    async fn submit_advance_round(&self) -> Result<TxHandle, LedgerError> {
        self.ensure_signer()?;
        let pending = self
            .contract
            .reset()
            .send()
            .await
            .map_err(classify_write)?;

        let tx = TxHandle(*pending.tx_hash());
        tracing::debug!("Round advance broadcast: {}", tx);
        Ok(tx)
    }

    async fn read_transaction_status(&self, tx: TxHandle) -> Result<TxStatus, LedgerError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx.0)
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        Ok(match receipt {
            None => TxStatus::Pending,
            Some(receipt) if receipt.status() => TxStatus::Included,
            Some(_) => TxStatus::Reverted,
        })
    }
}

fn parse_url(rpc_url: &str) -> Result<Url, LedgerError> {
    rpc_url
        .parse()
        .map_err(|e| LedgerError::Transport(format!("Invalid RPC URL {}: {}", rpc_url, e)))
}

fn to_unix(value: U256) -> Result<i64, LedgerError> {
    i64::try_from(value)
        .map_err(|_| LedgerError::InvalidData(format!("Timestamp {} exceeds i64", value)))
}

fn is_revert(err: &alloy::contract::Error) -> bool {
    err.as_revert_data().is_some() || err.to_string().contains("execution reverted")
}

/// Reads only fail on the wire, or with a revert for a bad argument
fn classify_read(err: alloy::contract::Error) -> LedgerError {
    if is_revert(&err) {
        LedgerError::GuardRejected(err.to_string())
    } else {
        LedgerError::Transport(err.to_string())
    }
}

/// Writes revert during gas estimation when a guard refuses them
fn classify_write(err: alloy::contract::Error) -> LedgerError {
    if is_revert(&err) {
        return LedgerError::GuardRejected(err.to_string());
    }

    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("insufficient funds")
        || lowered.contains("nonce")
        || lowered.contains("denied")
        || lowered.contains("rejected")
    {
        LedgerError::Rejected(message)
    } else {
        LedgerError::Transport(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_transport_error() {
        let err = EvmLedger::read_only("not a url", Address::ZERO)
            .err()
            .expect("url must be rejected");
        assert!(err.is_transient());
    }

    #[test]
    fn test_invalid_private_key_is_rejected() {
        let err = EvmLedger::with_private_key(DEFAULT_RPC_URL, Address::ZERO, "0xnothex")
            .err()
            .expect("key must be rejected");
        assert!(matches!(err, LedgerError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_read_only_client_refuses_writes() {
        let ledger = EvmLedger::read_only(DEFAULT_RPC_URL, Address::ZERO).unwrap();
        let err = ledger.submit_advance_round().await.unwrap_err();
        assert_eq!(err, LedgerError::Rejected("no signer configured".to_string()));

        let square = Square::new(7).unwrap();
        let err = ledger.submit_stake(square, U256::from(1u64)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
    }

    #[test]
    fn test_timestamp_conversion() {
        assert_eq!(to_unix(U256::from(1_700_000_000u64)).unwrap(), 1_700_000_000);
        assert!(to_unix(U256::MAX).is_err());
    }
}
