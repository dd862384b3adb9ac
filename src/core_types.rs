//! Core types used throughout the settlement core
//!
//! Identifiers that cross module boundaries (ledger, audit log, gateways,
//! reconciliation) live here so every layer speaks the same vocabulary.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// User identity - opaque string supplied by the identity provider.
///
/// # Constraints:
/// - **Trusted as given**: the core never authenticates it
/// - **Non-empty**: enforced by saga validation, not by construction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Asset code - upper-case ticker such as `USD` or `ETH`.
///
/// Balance rows are keyed by `(UserId, AssetCode)`. Codes are normalised
/// to upper case on construction so `eth` and `ETH` address the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AssetCode(String);

impl<'de> Deserialize<'de> for AssetCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(AssetCode::new)
    }
}

impl AssetCode {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AssetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetCode {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Trade side, from the account holder's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Saga type. Each balance-changing operation runs exactly one saga kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaKind {
    FiatDeposit,
    CryptoDeposit,
    FiatWithdrawal,
    CryptoWithdrawal,
    Trade,
}

impl SagaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaKind::FiatDeposit => "fiat_deposit",
            SagaKind::CryptoDeposit => "crypto_deposit",
            SagaKind::FiatWithdrawal => "fiat_withdrawal",
            SagaKind::CryptoWithdrawal => "crypto_withdrawal",
            SagaKind::Trade => "trade",
        }
    }

    /// Whether this saga crosses an irreversible external effect
    pub fn has_external_effect(&self) -> bool {
        !matches!(self, SagaKind::FiatDeposit | SagaKind::Trade)
    }
}

impl fmt::Display for SagaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locally generated saga transaction identifier.
///
/// Doubles as the payout `sender_batch_id`, so it must be unique per saga.
pub type TxId = uuid::Uuid;

/// Identifier assigned by an external system: blockchain transaction hash,
/// payout batch id or an off-system deposit reference.
pub type ExternalRef = String;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_code_normalised() {
        assert_eq!(AssetCode::new(" eth "), AssetCode::new("ETH"));
        assert_eq!(AssetCode::new("usd").as_str(), "USD");
        assert!(AssetCode::new("  ").is_blank());
    }

    #[test]
    fn test_user_id_blank() {
        assert!(UserId::new("   ").is_blank());
        assert!(!UserId::new("alice").is_blank());
    }

    #[test]
    fn test_saga_kind_external_effect() {
        assert!(!SagaKind::FiatDeposit.has_external_effect());
        assert!(!SagaKind::Trade.has_external_effect());
        assert!(SagaKind::CryptoDeposit.has_external_effect());
        assert!(SagaKind::CryptoWithdrawal.has_external_effect());
        assert!(SagaKind::FiatWithdrawal.has_external_effect());
    }

    #[test]
    fn test_serde_shapes() {
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"sell\"");
        assert_eq!(
            serde_json::to_string(&SagaKind::CryptoWithdrawal).unwrap(),
            "\"crypto_withdrawal\""
        );
        assert_eq!(
            serde_json::to_string(&UserId::new("bob")).unwrap(),
            "\"bob\""
        );
    }
}
