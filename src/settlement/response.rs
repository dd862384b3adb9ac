//! Versioned caller-facing result envelope
//!
//! Callers only ever see this shape. It separates "nothing happened"
//! (`rejected`, `failed`) from "something may have happened"
//! (`pending_reconciliation`).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::SettlementError;
use super::types::SettlementOutcome;
use crate::core_types::SagaKind;

pub const RESPONSE_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    /// Funds moved; the audit record is written later
    AuditPending,
    /// The external effect may have happened; do not retry
    PendingReconciliation,
    /// Typed rejection, nothing happened
    Rejected,
    /// Nothing happened; see `error.retryable`
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementResponseV1 {
    pub version: u8,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<SagaKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_after: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid settlement response: {0}")]
pub struct EnvelopeError(pub String);

impl SettlementResponseV1 {
    fn empty(status: ResponseStatus) -> Self {
        Self {
            version: RESPONSE_VERSION,
            status,
            tx_id: None,
            kind: None,
            external_ref: None,
            asset: None,
            amount: None,
            balance_after: None,
            reconciliation_id: None,
            error: None,
        }
    }

    pub fn from_outcome(outcome: &SettlementOutcome) -> Self {
        let status = match outcome {
            SettlementOutcome::Settled(_) => ResponseStatus::Completed,
            SettlementOutcome::AuditLagging { .. } => ResponseStatus::AuditPending,
            SettlementOutcome::ReconciliationNeeded { .. } => {
                ResponseStatus::PendingReconciliation
            }
        };
        let receipt = outcome.receipt();
        Self {
            tx_id: Some(receipt.tx_id.to_string()),
            kind: Some(receipt.kind),
            external_ref: receipt.external_ref.clone(),
            asset: Some(receipt.asset.to_string()),
            amount: Some(receipt.amount),
            balance_after: receipt.balance_after,
            reconciliation_id: outcome.reconciliation_id().map(|id| id.to_string()),
            ..Self::empty(status)
        }
    }

    pub fn from_error(error: &SettlementError) -> Self {
        let status = if !error.nothing_happened() {
            ResponseStatus::PendingReconciliation
        } else if error.is_rejection() {
            ResponseStatus::Rejected
        } else {
            ResponseStatus::Failed
        };
        Self {
            error: Some(ResponseError {
                code: error.code().to_string(),
                message: error.to_string(),
                retryable: error.is_retryable(),
            }),
            ..Self::empty(status)
        }
    }

    pub fn from_result(result: &Result<SettlementOutcome, SettlementError>) -> Self {
        match result {
            Ok(outcome) => Self::from_outcome(outcome),
            Err(error) => Self::from_error(error),
        }
    }

    /// Shape check applied before the envelope leaves the process
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.version != RESPONSE_VERSION {
            return Err(EnvelopeError(format!("unsupported version {}", self.version)));
        }
        match self.status {
            ResponseStatus::Completed | ResponseStatus::AuditPending => {
                if self.tx_id.is_none() || self.error.is_some() {
                    return Err(EnvelopeError(format!(
                        "{:?} needs a tx_id and no error",
                        self.status
                    )));
                }
            }
            ResponseStatus::Rejected | ResponseStatus::Failed => {
                if self.error.is_none() {
                    return Err(EnvelopeError(format!("{:?} needs an error", self.status)));
                }
            }
            ResponseStatus::PendingReconciliation => {
                if self.reconciliation_id.is_none() && self.error.is_none() {
                    return Err(EnvelopeError(
                        "pending_reconciliation needs a reconciliation_id or an error".into(),
                    ));
                }
            }
        }
        if self.status == ResponseStatus::AuditPending && self.reconciliation_id.is_none() {
            return Err(EnvelopeError("audit_pending needs a reconciliation_id".into()));
        }
        Ok(())
    }

    /// Suggested HTTP status for transports that need one
    pub fn http_status(&self) -> u16 {
        match self.status {
            ResponseStatus::Completed => 200,
            ResponseStatus::AuditPending | ResponseStatus::PendingReconciliation => 202,
            ResponseStatus::Rejected | ResponseStatus::Failed => match &self.error {
                Some(e) if e.code == "VALIDATION_ERROR" => 400,
                Some(e) if e.code == "ACCOUNT_NOT_FOUND" => 404,
                Some(e) if e.code == "ACCOUNT_EXISTS" || e.code == "DUPLICATE_EXTERNAL_REF" => 409,
                Some(e) if e.code == "INSUFFICIENT_FUNDS" => 422,
                Some(e) if e.code == "EXTERNAL_EFFECT_FAILED" => 502,
                Some(e) if e.retryable => 503,
                _ => 500,
            },
        }
    }
}
