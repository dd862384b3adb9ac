//! External Settlement Gateway
//!
//! Irreversible effects outside our own stores: an EVM transfer broadcast
//! or a third-party payout. Every call is a single all-or-nothing request;
//! gateways never retry on their own. Whether a failure may be retried is
//! decided by the saga coordinator from the error class:
//!
//! - [`GatewayError::Network`]: nothing was accepted, safe to retry
//! - [`GatewayError::Ambiguous`]: the effect may have happened, never retry
//! - everything else: definitely rejected, nothing happened

pub mod evm;
#[cfg(any(test, feature = "mock-api"))]
pub mod mock;
pub mod paypal;
pub mod units;

pub use evm::{EvmChainClient, EvmChainConfig};
#[cfg(any(test, feature = "mock-api"))]
pub use mock::{MockChain, MockPayout};
pub use paypal::{PaypalConfig, PaypalPayoutClient};

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt;
use thiserror::Error;

use crate::core_types::ExternalRef;
use crate::wallet::SigningKey;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Failed before any byte reached the remote side
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rejected by network: {0}")]
    Rejected(String),

    #[error("Insufficient gas funds: {0}")]
    InsufficientGasFunds(String),

    #[error("Payout authorization failed: {0}")]
    AuthFailure(String),

    #[error("Payout recipient invalid: {0}")]
    RecipientInvalid(String),

    /// Bad address, key or amount, detected locally
    #[error("Invalid gateway input: {0}")]
    InvalidInput(String),

    /// Request may have been accepted. `reference` is the tx hash or batch
    /// id to reconcile against, when known.
    #[error("External effect outcome unknown: {reason}")]
    Ambiguous {
        reference: Option<ExternalRef>,
        reason: String,
    },
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Network(_) => "NETWORK_ERROR",
            GatewayError::Rejected(_) => "REJECTED_BY_NETWORK",
            GatewayError::InsufficientGasFunds(_) => "INSUFFICIENT_GAS_FUNDS",
            GatewayError::AuthFailure(_) => "AUTH_FAILURE",
            GatewayError::RecipientInvalid(_) => "RECIPIENT_INVALID",
            GatewayError::InvalidInput(_) => "INVALID_GATEWAY_INPUT",
            GatewayError::Ambiguous { .. } => "EXTERNAL_EFFECT_AMBIGUOUS",
        }
    }

    /// Only pre-acceptance network failures may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Network(_))
    }

    pub fn possibly_accepted(&self) -> bool {
        matches!(self, GatewayError::Ambiguous { .. })
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            GatewayError::Ambiguous { reference, .. } => reference.as_deref(),
            _ => None,
        }
    }
}

/// Gas price and limit for one native transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeQuote {
    pub gas_price_gwei: Decimal,
    pub gas_limit: u64,
}

impl FeeQuote {
    /// Total fee in ether, exact
    pub fn fee(&self) -> Decimal {
        units::fee_ether(self.gas_limit, self.gas_price_gwei)
    }
}

/// Native-asset transfer to sign and broadcast
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    /// Ether
    pub amount: Decimal,
    pub gas_price_gwei: Decimal,
    pub signing_key: SigningKey,
}

/// Signed transfer whose hash is known before it is sent
#[derive(Clone)]
pub struct PreparedTransfer {
    pub hash: ExternalRef,
    pub raw: Vec<u8>,
    /// Lower-case sender address
    pub sender: String,
    pub nonce: u64,
}

impl fmt::Debug for PreparedTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedTransfer")
            .field("hash", &self.hash)
            .field("sender", &self.sender)
            .field("nonce", &self.nonce)
            .field("raw_len", &self.raw.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Reverted,
    /// No receipt yet: pending, dropped, or never received
    Unknown,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// On-chain native balance in ether
    async fn balance(&self, address: &str) -> Result<Decimal, GatewayError>;

    /// Gas-price oracle. Falls back to a configured price instead of failing.
    async fn fee_quote(&self) -> FeeQuote;

    /// Sign locally. Reads chain state (nonce) but sends nothing.
    ///
    /// Two prepared transfers from one sender share a nonce until the first
    /// is sent, so callers must not interleave prepare and send for the
    /// same sender.
    async fn prepare_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<PreparedTransfer, GatewayError>;

    /// The irreversible step
    async fn send_prepared(&self, prepared: &PreparedTransfer)
    -> Result<ExternalRef, GatewayError>;

    async fn broadcast(&self, request: &TransferRequest) -> Result<ExternalRef, GatewayError> {
        let prepared = self.prepare_transfer(request).await?;
        self.send_prepared(&prepared).await
    }

    async fn confirmation(&self, tx_hash: &str) -> Result<Confirmation, GatewayError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutRequest {
    /// Our idempotency key, sent as `sender_batch_id`
    pub batch_id: String,
    pub amount: Decimal,
    /// E-mail address of the receiver
    pub recipient: String,
}

#[async_trait]
pub trait PayoutClient: Send + Sync {
    /// Returns the provider's payout batch id
    async fn payout(&self, request: &PayoutRequest) -> Result<ExternalRef, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classes() {
        assert!(GatewayError::Network("refused".into()).is_retryable());
        assert!(!GatewayError::Rejected("nonce too low".into()).is_retryable());

        let ambiguous = GatewayError::Ambiguous {
            reference: Some("0xabc".into()),
            reason: "timeout".into(),
        };
        assert!(!ambiguous.is_retryable());
        assert!(ambiguous.possibly_accepted());
        assert_eq!(ambiguous.reference(), Some("0xabc"));
        assert_eq!(ambiguous.code(), "EXTERNAL_EFFECT_AMBIGUOUS");
    }

    #[test]
    fn test_fee_quote_exact() {
        let quote = FeeQuote {
            gas_price_gwei: Decimal::new(30, 0),
            gas_limit: 21_000,
        };
        assert_eq!(quote.fee(), Decimal::new(63, 5));
    }
}
