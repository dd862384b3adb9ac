//! EVM chain client (alloy, HTTP JSON-RPC)
//!
//! Transfers are legacy transactions signed locally, so the transaction
//! hash is known before `eth_sendRawTransaction` and an ambiguous send can
//! always be reconciled against it.

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, B256, Bytes, TxKind};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::transports::RpcError;
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::units::{ether_to_wei, gwei_to_wei, wei_to_ether, wei_to_gwei};
use super::{
    ChainClient, Confirmation, FeeQuote, GatewayError, PreparedTransfer, TransferRequest,
};
use crate::core_types::ExternalRef;

/// Plain value transfer
pub const NATIVE_TRANSFER_GAS: u64 = 21_000;

#[derive(Debug, Clone)]
pub struct EvmChainConfig {
    pub rpc_url: String,
    pub gas_limit: u64,
    /// Used when `eth_gasPrice` fails
    pub fallback_gas_price_gwei: Decimal,
}

pub struct EvmChainClient {
    provider: DynProvider,
    chain_id: OnceCell<u64>,
    /// Next nonce per sender after our own accepted sends. Guards against
    /// an RPC backend whose pending count lags behind a send it accepted.
    next_nonce: DashMap<String, u64>,
    gas_limit: u64,
    fallback_gas_price_gwei: Decimal,
}

impl EvmChainClient {
    pub fn new(config: &EvmChainConfig) -> Result<Self, GatewayError> {
        let url: reqwest::Url = config
            .rpc_url
            .parse()
            .map_err(|e| GatewayError::InvalidInput(format!("Invalid RPC URL: {e}")))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();

        Ok(Self {
            provider,
            chain_id: OnceCell::new(),
            next_nonce: DashMap::new(),
            gas_limit: config.gas_limit,
            fallback_gas_price_gwei: config.fallback_gas_price_gwei,
        })
    }

    async fn chain_id(&self) -> Result<u64, GatewayError> {
        self.chain_id
            .get_or_try_init(|| async {
                self.provider
                    .get_chain_id()
                    .await
                    .map_err(|e| GatewayError::Network(format!("eth_chainId failed: {e}")))
            })
            .await
            .copied()
    }

    fn nonce_floor(&self, sender: &str) -> u64 {
        self.next_nonce.get(sender).map(|n| *n).unwrap_or(0)
    }

    fn record_sent(&self, sender: &str, nonce: u64) {
        let mut next = self.next_nonce.entry(sender.to_string()).or_insert(0);
        *next = (*next).max(nonce + 1);
    }
}

fn parse_address(address: &str) -> Result<Address, GatewayError> {
    address
        .parse()
        .map_err(|e| GatewayError::InvalidInput(format!("Invalid address {address}: {e}")))
}

/// JSON-RPC error responses are definite rejections, except when the node
/// reports it already holds the transaction.
fn classify_rpc_rejection(message: &str, hash: &str) -> GatewayError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("insufficient funds") {
        GatewayError::InsufficientGasFunds(message.to_string())
    } else if lower.contains("already known") || lower.contains("known transaction") {
        GatewayError::Ambiguous {
            reference: Some(hash.to_string()),
            reason: message.to_string(),
        }
    } else {
        GatewayError::Rejected(message.to_string())
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    async fn balance(&self, address: &str) -> Result<Decimal, GatewayError> {
        let address = parse_address(address)?;
        let wei = self
            .provider
            .get_balance(address)
            .await
            .map_err(|e| GatewayError::Network(format!("eth_getBalance failed: {e}")))?;
        wei_to_ether(wei)
    }

    async fn fee_quote(&self) -> FeeQuote {
        let gas_price_gwei = match self.provider.get_gas_price().await {
            Ok(wei) => wei_to_gwei(wei),
            Err(e) => {
                warn!(
                    error = %e,
                    fallback_gwei = %self.fallback_gas_price_gwei,
                    "Gas price oracle failed, using fallback"
                );
                self.fallback_gas_price_gwei
            }
        };
        FeeQuote {
            gas_price_gwei,
            gas_limit: self.gas_limit,
        }
    }

    async fn prepare_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<PreparedTransfer, GatewayError> {
        let from = parse_address(&request.from)?;
        let to = parse_address(&request.to)?;
        let signer = request
            .signing_key
            .signer()
            .map_err(|e| GatewayError::InvalidInput(e.to_string()))?;
        if signer.address() != from {
            return Err(GatewayError::InvalidInput(
                "signing key does not control the sender address".to_string(),
            ));
        }
        let value = ether_to_wei(request.amount)?;
        let gas_price = gwei_to_wei(request.gas_price_gwei)?;

        let sender = request.from.to_ascii_lowercase();
        let chain_id = self.chain_id().await?;
        let pending = self
            .provider
            .get_transaction_count(from)
            .pending()
            .await
            .map_err(|e| GatewayError::Network(format!("eth_getTransactionCount failed: {e}")))?;
        let nonce = pending.max(self.nonce_floor(&sender));

        let mut tx = TxLegacy {
            chain_id: Some(chain_id),
            nonce,
            gas_price,
            gas_limit: self.gas_limit,
            to: TxKind::Call(to),
            value,
            input: Bytes::new(),
        };
        let signature = signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| GatewayError::InvalidInput(format!("signing failed: {e}")))?;
        let signed = tx.into_signed(signature);
        let hash = format!("{:?}", signed.hash());
        let raw = TxEnvelope::Legacy(signed).encoded_2718();

        debug!(tx_hash = %hash, nonce, pending, chain_id, "Transfer signed");
        Ok(PreparedTransfer {
            hash,
            raw,
            sender,
            nonce,
        })
    }

    async fn send_prepared(
        &self,
        prepared: &PreparedTransfer,
    ) -> Result<ExternalRef, GatewayError> {
        match self.provider.send_raw_transaction(&prepared.raw).await {
            Ok(pending) => {
                self.record_sent(&prepared.sender, prepared.nonce);
                Ok(format!("{:?}", pending.tx_hash()))
            }
            Err(RpcError::ErrorResp(payload)) => {
                Err(classify_rpc_rejection(&payload.message, &prepared.hash))
            }
            // Bytes may have reached the node
            Err(e) => Err(GatewayError::Ambiguous {
                reference: Some(prepared.hash.clone()),
                reason: format!("eth_sendRawTransaction transport failure: {e}"),
            }),
        }
    }

    async fn confirmation(&self, tx_hash: &str) -> Result<Confirmation, GatewayError> {
        let hash: B256 = tx_hash
            .parse()
            .map_err(|e| GatewayError::InvalidInput(format!("Invalid tx hash {tx_hash}: {e}")))?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| GatewayError::Network(format!("eth_getTransactionReceipt failed: {e}")))?;

        Ok(match receipt {
            Some(receipt) if receipt.status() => Confirmation::Confirmed,
            Some(_) => Confirmation::Reverted,
            None => Confirmation::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet;

    fn unreachable_client() -> EvmChainClient {
        EvmChainClient::new(&EvmChainConfig {
            rpc_url: "http://127.0.0.1:1".to_string(),
            gas_limit: NATIVE_TRANSFER_GAS,
            fallback_gas_price_gwei: Decimal::new(30, 0),
        })
        .unwrap()
    }

    #[test]
    fn test_rpc_rejection_classes() {
        assert!(matches!(
            classify_rpc_rejection("insufficient funds for gas * price + value", "0x1"),
            GatewayError::InsufficientGasFunds(_)
        ));
        assert!(matches!(
            classify_rpc_rejection("nonce too low", "0x1"),
            GatewayError::Rejected(_)
        ));
        let known = classify_rpc_rejection("already known", "0x1");
        assert!(known.possibly_accepted());
        assert_eq!(known.reference(), Some("0x1"));
    }

    #[test]
    fn test_invalid_rpc_url() {
        let result = EvmChainClient::new(&EvmChainConfig {
            rpc_url: "not a url".to_string(),
            gas_limit: NATIVE_TRANSFER_GAS,
            fallback_gas_price_gwei: Decimal::new(30, 0),
        });
        assert!(matches!(result, Err(GatewayError::InvalidInput(_))));
    }

    #[test]
    fn test_nonce_floor_only_moves_forward() {
        let client = unreachable_client();
        assert_eq!(client.nonce_floor("0xaa"), 0);
        client.record_sent("0xaa", 4);
        client.record_sent("0xaa", 2);
        assert_eq!(client.nonce_floor("0xaa"), 5);
        assert_eq!(client.nonce_floor("0xbb"), 0);
    }

    #[tokio::test]
    async fn test_fee_quote_falls_back_when_oracle_unreachable() {
        let quote = unreachable_client().fee_quote().await;
        assert_eq!(quote.gas_price_gwei, Decimal::new(30, 0));
        assert_eq!(quote.gas_limit, NATIVE_TRANSFER_GAS);
    }

    #[tokio::test]
    async fn test_balance_unreachable_is_network_error() {
        let err = unreachable_client()
            .balance(&wallet::generate().address)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_prepare_rejects_foreign_key_before_any_rpc() {
        let sender = wallet::generate();
        let other = wallet::generate();
        let err = unreachable_client()
            .prepare_transfer(&TransferRequest {
                from: sender.address,
                to: wallet::generate().address,
                amount: Decimal::ONE,
                gas_price_gwei: Decimal::new(30, 0),
                signing_key: other.signing_key,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    #[ignore = "requires an EVM JSON-RPC endpoint in ETH_RPC_URL"]
    async fn test_live_fee_quote() {
        let client = EvmChainClient::new(&EvmChainConfig {
            rpc_url: std::env::var("ETH_RPC_URL").expect("ETH_RPC_URL"),
            gas_limit: NATIVE_TRANSFER_GAS,
            fallback_gas_price_gwei: Decimal::ZERO,
        })
        .unwrap();
        assert!(client.fee_quote().await.gas_price_gwei > Decimal::ZERO);
    }
}
