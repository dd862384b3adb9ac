//! Reconciliation Queue
//!
//! Durable list of sagas that ended after an irreversible effect without a
//! clean finish. Each item carries everything the [`worker`] needs to
//! finish the job: the reference to confirm, the ledger change still owed
//! and the audit record still unwritten.

pub mod memory;
pub mod postgres;
pub mod worker;

pub use memory::MemoryReconciliationQueue;
pub use postgres::PgReconciliationQueue;
pub use worker::{ReconciliationWorker, ScanReport, WorkerConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use ulid::Ulid;

use crate::audit::SettlementRecord;
use crate::core_types::{AssetCode, ExternalRef, SagaKind, TxId, UserId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReconciliationError {
    #[error("Reconciliation queue unavailable: {0}")]
    Unavailable(String),

    #[error("Reconciliation item encoding error: {0}")]
    Encoding(String),
}

impl From<sqlx::Error> for ReconciliationError {
    fn from(e: sqlx::Error) -> Self {
        ReconciliationError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for ReconciliationError {
    fn from(e: serde_json::Error) -> Self {
        ReconciliationError::Encoding(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationReason {
    /// Timeout or transport failure after the request was sent
    AmbiguousExternalEffect,
    /// External effect done, ledger commit failed
    LedgerCommitFailed,
    /// External effect done and committed, audit append failed
    AuditWriteFailed,
    /// Deposit committed, audit append failed
    AuditLag,
    /// Trade audit record written, ledger commit failed
    OrphanedAuditRecord,
}

impl ReconciliationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationReason::AmbiguousExternalEffect => "ambiguous_external_effect",
            ReconciliationReason::LedgerCommitFailed => "ledger_commit_failed",
            ReconciliationReason::AuditWriteFailed => "audit_write_failed",
            ReconciliationReason::AuditLag => "audit_lag",
            ReconciliationReason::OrphanedAuditRecord => "orphaned_audit_record",
        }
    }
}

impl fmt::Display for ReconciliationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Pending,
    Resolved,
    /// Needs an operator
    ManualReview,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Pending => "pending",
            ReconciliationStatus::Resolved => "resolved",
            ReconciliationStatus::ManualReview => "manual_review",
        }
    }
}

impl fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A balance change still owed to the ledger.
///
/// `claim_ref` is claimed in the same scope as the change, so applying a
/// repair twice is impossible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRepair {
    pub asset: AssetCode,
    pub delta: Decimal,
    pub claim_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationItem {
    pub id: Ulid,
    pub kind: SagaKind,
    pub tx_id: TxId,
    pub user: UserId,
    pub asset: AssetCode,
    pub amount: Decimal,
    pub external_ref: Option<ExternalRef>,
    pub reason: ReconciliationReason,
    pub status: ReconciliationStatus,
    /// Chain transaction whose receipt decides the outcome
    pub awaiting_confirmation: bool,
    /// Applied once the effect is known to have happened
    pub ledger_repair: Option<LedgerRepair>,
    /// Applied instead if the effect turns out to have failed
    pub refund_on_revert: Option<LedgerRepair>,
    pub pending_record: Option<SettlementRecord>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReconciliationItem {
    pub fn new(
        kind: SagaKind,
        tx_id: TxId,
        user: UserId,
        asset: AssetCode,
        amount: Decimal,
        reason: ReconciliationReason,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new(),
            kind,
            tx_id,
            user,
            asset,
            amount,
            external_ref: None,
            reason,
            status: ReconciliationStatus::Pending,
            awaiting_confirmation: false,
            ledger_repair: None,
            refund_on_revert: None,
            pending_record: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_external_ref(mut self, external_ref: Option<ExternalRef>) -> Self {
        self.external_ref = external_ref;
        self
    }

    pub fn awaiting_confirmation(mut self, awaiting: bool) -> Self {
        self.awaiting_confirmation = awaiting;
        self
    }

    pub fn with_ledger_repair(mut self, repair: LedgerRepair) -> Self {
        self.ledger_repair = Some(repair);
        self
    }

    pub fn with_refund_on_revert(mut self, refund: LedgerRepair) -> Self {
        self.refund_on_revert = Some(refund);
        self
    }

    pub fn with_pending_record(mut self, record: SettlementRecord) -> Self {
        self.pending_record = Some(record);
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.last_error = Some(error.to_string());
        self
    }

    pub fn manual_review(mut self) -> Self {
        self.status = ReconciliationStatus::ManualReview;
        self
    }

    /// Nothing left to do
    pub fn is_settled(&self) -> bool {
        !self.awaiting_confirmation && self.ledger_repair.is_none() && self.pending_record.is_none()
    }
}

#[async_trait]
pub trait ReconciliationQueue: Send + Sync {
    async fn enqueue(&self, item: &ReconciliationItem) -> Result<(), ReconciliationError>;

    /// Oldest `Pending` items first
    async fn pending(&self, limit: usize) -> Result<Vec<ReconciliationItem>, ReconciliationError>;

    /// Overwrite an existing item, matched by id
    async fn update(&self, item: &ReconciliationItem) -> Result<(), ReconciliationError>;

    async fn get(&self, id: Ulid) -> Result<Option<ReconciliationItem>, ReconciliationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> ReconciliationItem {
        ReconciliationItem::new(
            SagaKind::CryptoWithdrawal,
            uuid::Uuid::new_v4(),
            UserId::new("alice"),
            AssetCode::new("ETH"),
            Decimal::ONE,
            ReconciliationReason::AmbiguousExternalEffect,
        )
    }

    #[test]
    fn test_builder() {
        let item = item()
            .with_external_ref(Some("0xabc".into()))
            .awaiting_confirmation(true)
            .with_refund_on_revert(LedgerRepair {
                asset: AssetCode::new("ETH"),
                delta: Decimal::ONE,
                claim_ref: "refund:1".into(),
            });
        assert_eq!(item.status, ReconciliationStatus::Pending);
        assert_eq!(item.external_ref.as_deref(), Some("0xabc"));
        assert!(!item.is_settled());
        assert_eq!(item.clone().manual_review().status, ReconciliationStatus::ManualReview);
    }

    #[test]
    fn test_json_roundtrip_keeps_ulid() {
        let item = item().with_error("timed out");
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"reason\":\"ambiguous_external_effect\""));
        let back: ReconciliationItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(ReconciliationReason::AuditLag.to_string(), "audit_lag");
        assert_eq!(ReconciliationStatus::ManualReview.to_string(), "manual_review");
    }
}
