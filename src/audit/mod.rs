//! Audit Log
//!
//! Append-only store of one [`SettlementRecord`] per completed saga step.
//! There is no update or delete. `append` is a single best-effort durable
//! write and is never part of a ledger transaction.

pub mod memory;
pub mod postgres;

pub use memory::MemoryAuditLog;
pub use postgres::PgAuditLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core_types::{AssetCode, ExternalRef, Side, TxId, UserId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuditError {
    #[error("Audit store unavailable: {0}")]
    Unavailable(String),

    #[error("Audit record encoding error: {0}")]
    Encoding(String),
}

impl From<sqlx::Error> for AuditError {
    fn from(e: sqlx::Error) -> Self {
        AuditError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        AuditError::Encoding(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Deposit,
    Withdrawal,
    Trade,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Deposit => "deposit",
            RecordKind::Withdrawal => "withdrawal",
            RecordKind::Trade => "trade",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction-specific counterparty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Counterparty {
    /// Where deposited funds came from (bank reference, deposit address)
    Payer { source: String },
    /// Where withdrawn funds went (chain address, payout recipient)
    Payee { destination: String },
    Pair { base: AssetCode, quote: AssetCode },
}

/// Operation-specific detail, tagged by `detail`. A trade stores its side
/// as `type` (`buy` / `sell`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "detail", rename_all = "snake_case")]
pub enum RecordDetail {
    Fiat,
    Crypto {
        /// Swept on-chain balance, deposits only
        gross: Option<Decimal>,
        fee: Decimal,
        gas_price_gwei: Decimal,
    },
    Trade {
        #[serde(rename = "type")]
        side: Side,
        quantity: Decimal,
        total: Decimal,
        base_after: Decimal,
        quote_after: Decimal,
    },
}

/// Immutable audit entry.
///
/// `external_ref` is unique across the log when present; `tx_id` is always
/// unique. Both make a repeated append a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub kind: RecordKind,
    pub user: UserId,
    pub counterparty: Counterparty,
    pub asset: AssetCode,
    pub amount: Decimal,
    pub external_ref: Option<ExternalRef>,
    pub tx_id: TxId,
    pub balance_after: Option<Decimal>,
    pub time: DateTime<Utc>,
    pub detail: RecordDetail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Same `tx_id` or `external_ref` already logged
    Duplicate,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &SettlementRecord) -> Result<AppendOutcome, AuditError>;

    /// Lazy, finite, single-pass sequence of the user's records of `kind`,
    /// newest first.
    fn query_by_user(
        &self,
        kind: RecordKind,
        user: &UserId,
    ) -> BoxStream<'static, Result<SettlementRecord, AuditError>>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_document_shape() {
        let record = fixtures::deposit("alice", 0, Some("bank-77"));
        let doc = serde_json::to_value(&record).unwrap();

        assert_eq!(doc["kind"], "deposit");
        assert_eq!(doc["user"], "alice");
        assert_eq!(doc["counterparty"]["type"], "payer");
        assert_eq!(doc["external_ref"], "bank-77");
        assert_eq!(doc["detail"]["detail"], "fiat");

        let back: SettlementRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_trade_detail_carries_side() {
        let detail = RecordDetail::Trade {
            side: Side::Sell,
            quantity: Decimal::ONE,
            total: Decimal::new(250, 0),
            base_after: Decimal::ONE,
            quote_after: Decimal::new(750, 0),
        };
        let doc = serde_json::to_value(&detail).unwrap();
        assert_eq!(doc["detail"], "trade");
        assert_eq!(doc["type"], "sell");
        assert!(doc.get("side").is_none());

        let back: RecordDetail = serde_json::from_value(doc).unwrap();
        assert_eq!(back, detail);
    }
}
