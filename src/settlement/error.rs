//! Settlement Error Types
//!
//! Every saga failure says whether anything happened. Possibly-succeeded
//! external effects are not errors at all: they come back as
//! `SettlementOutcome::ReconciliationNeeded`.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::audit::AuditError;
use crate::core_types::{AssetCode, UserId};
use crate::gateway::GatewayError;
use crate::ledger::LedgerError;

/// Malformed input, rejected before any store access
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("User identity is blank")]
    BlankUser,

    #[error("Asset code is blank")]
    BlankAsset,

    #[error("Amount must be greater than zero, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("Amount {amount} exceeds {max_scale} decimal places")]
    PrecisionExceeded { amount: Decimal, max_scale: u32 },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid payout recipient: {0}")]
    InvalidRecipient(String),

    #[error("External reference is required")]
    MissingExternalRef,

    #[error("Base and quote asset must differ: {0}")]
    SameAsset(AssetCode),

    #[error("On-chain balance {gross} does not cover the fee {fee}")]
    NothingToSweep { gross: Decimal, fee: Decimal },

    #[error("Favourite tag is blank")]
    BlankTag,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettlementError {
    // === Rejections: nothing happened ===
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Insufficient funds: requested {requested} {asset}, available {available}")]
    InsufficientFunds {
        asset: AssetCode,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Account not found: {0}")]
    AccountNotFound(UserId),

    #[error("Account already exists: {0}")]
    AccountExists(UserId),

    #[error("External reference already settled: {0}")]
    DuplicateExternalRef(String),

    // === Failures: nothing happened, caller may retry ===
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Ledger store error: {0}")]
    LedgerUnavailable(String),

    #[error("External effect failed: {0}")]
    ExternalEffectFailed(GatewayError),

    #[error("Audit log unavailable: {0}")]
    AuditUnavailable(String),

    // === Internal ===
    #[error("Invalid scope state: {0}")]
    InvalidScopeState(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// The saga task died; its progress is unknown
    #[error("Saga interrupted: {0}")]
    SagaInterrupted(String),
}

impl SettlementError {
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::Validation(_) => "VALIDATION_ERROR",
            SettlementError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            SettlementError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            SettlementError::AccountExists(_) => "ACCOUNT_EXISTS",
            SettlementError::DuplicateExternalRef(_) => "DUPLICATE_EXTERNAL_REF",
            SettlementError::ResourceUnavailable(_) => "RESOURCE_UNAVAILABLE",
            SettlementError::LedgerUnavailable(_) => "LEDGER_UNAVAILABLE",
            SettlementError::ExternalEffectFailed(_) => "EXTERNAL_EFFECT_FAILED",
            SettlementError::AuditUnavailable(_) => "AUDIT_UNAVAILABLE",
            SettlementError::InvalidScopeState(_) => "INVALID_SCOPE_STATE",
            SettlementError::Internal(_) => "INTERNAL_ERROR",
            SettlementError::SagaInterrupted(_) => "SAGA_INTERRUPTED",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            SettlementError::Validation(_) => 400,
            SettlementError::AccountNotFound(_) => 404,
            SettlementError::AccountExists(_) | SettlementError::DuplicateExternalRef(_) => 409,
            SettlementError::InsufficientFunds { .. } => 422,
            SettlementError::ExternalEffectFailed(_) => 502,
            SettlementError::ResourceUnavailable(_)
            | SettlementError::LedgerUnavailable(_)
            | SettlementError::AuditUnavailable(_) => 503,
            SettlementError::InvalidScopeState(_)
            | SettlementError::Internal(_)
            | SettlementError::SagaInterrupted(_) => 500,
        }
    }

    /// Whether resubmitting the same request can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SettlementError::ResourceUnavailable(_)
            | SettlementError::LedgerUnavailable(_)
            | SettlementError::AuditUnavailable(_) => true,
            SettlementError::ExternalEffectFailed(e) => !matches!(
                e,
                GatewayError::RecipientInvalid(_) | GatewayError::InvalidInput(_)
            ),
            _ => false,
        }
    }

    /// `false` only when the saga may have left an effect behind
    pub fn nothing_happened(&self) -> bool {
        !matches!(self, SettlementError::SagaInterrupted(_))
    }

    /// Typed rejection, as opposed to a failure
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SettlementError::Validation(_)
                | SettlementError::InsufficientFunds { .. }
                | SettlementError::AccountNotFound(_)
                | SettlementError::AccountExists(_)
                | SettlementError::DuplicateExternalRef(_)
        )
    }
}

impl From<LedgerError> for SettlementError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::ResourceUnavailable(msg) => SettlementError::ResourceUnavailable(msg),
            LedgerError::InvalidScopeState(msg) => SettlementError::InvalidScopeState(msg.to_string()),
            LedgerError::AccountNotFound(user) => SettlementError::AccountNotFound(user),
            LedgerError::AccountExists(user) => SettlementError::AccountExists(user),
            LedgerError::RefAlreadyClaimed(reference) => {
                SettlementError::DuplicateExternalRef(reference)
            }
            LedgerError::NegativeBalance { .. } => SettlementError::Internal(e.to_string()),
            LedgerError::Backend(msg) => SettlementError::LedgerUnavailable(msg),
        }
    }
}

impl From<AuditError> for SettlementError {
    fn from(e: AuditError) -> Self {
        SettlementError::AuditUnavailable(e.to_string())
    }
}
