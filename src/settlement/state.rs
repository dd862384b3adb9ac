//! Saga FSM State Definitions
//!
//! ```text
//! Started → Validated → LedgerPending → {ExternalPending → ExternalDone | ExternalFailed}
//!         → AuditWritten → Committed
//! ```
//! Terminal failure states: `RejectedInsufficientFunds`, `RolledBack`,
//! `ReconciliationNeeded` (only after an irreversible effect may have
//! happened).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum SagaState {
    /// Request received
    Started = 0,

    /// Input checked, no store touched yet
    Validated = 10,

    /// Ledger scope open, mutation staged but not committed
    LedgerPending = 20,

    /// External call in flight. No longer cancellable.
    ExternalPending = 30,

    /// External effect happened - it can never be undone from here
    ExternalDone = 40,

    /// External call definitely failed, nothing accepted
    ExternalFailed = -40,

    AuditWritten = 50,

    /// Terminal: ledger committed
    Committed = 60,

    /// Terminal: rejected after a consistent balance read
    RejectedInsufficientFunds = -10,

    /// Terminal: ledger scope rolled back, nothing happened
    RolledBack = -20,

    /// Terminal: external effect may have happened but a later step failed
    ReconciliationNeeded = -30,
}

impl SagaState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Committed
                | SagaState::RejectedInsufficientFunds
                | SagaState::RolledBack
                | SagaState::ReconciliationNeeded
        )
    }

    /// Legal successor states
    pub fn can_transition_to(&self, next: SagaState) -> bool {
        use SagaState::*;
        match self {
            Started => matches!(next, Validated),
            Validated => matches!(next, LedgerPending | ExternalPending),
            LedgerPending => matches!(
                next,
                ExternalPending
                    | AuditWritten
                    | Committed
                    | RejectedInsufficientFunds
                    | RolledBack
                    | ReconciliationNeeded
            ),
            ExternalPending => matches!(next, ExternalDone | ExternalFailed | ReconciliationNeeded),
            ExternalDone => matches!(next, LedgerPending | AuditWritten | ReconciliationNeeded),
            ExternalFailed => matches!(next, RolledBack),
            AuditWritten => matches!(next, Committed | RolledBack | ReconciliationNeeded),
            Committed | RejectedInsufficientFunds | RolledBack | ReconciliationNeeded => false,
        }
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Started => "STARTED",
            SagaState::Validated => "VALIDATED",
            SagaState::LedgerPending => "LEDGER_PENDING",
            SagaState::ExternalPending => "EXTERNAL_PENDING",
            SagaState::ExternalDone => "EXTERNAL_DONE",
            SagaState::ExternalFailed => "EXTERNAL_FAILED",
            SagaState::AuditWritten => "AUDIT_WRITTEN",
            SagaState::Committed => "COMMITTED",
            SagaState::RejectedInsufficientFunds => "REJECTED_INSUFFICIENT_FUNDS",
            SagaState::RolledBack => "ROLLED_BACK",
            SagaState::ReconciliationNeeded => "RECONCILIATION_NEEDED",
        }
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
