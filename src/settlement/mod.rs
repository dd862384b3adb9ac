//! Settlement
//!
//! Saga coordinator for every balance-changing operation: fiat and crypto
//! deposits, fiat and crypto withdrawals, and trades.
//!
//! # Rollback rule
//!
//! A saga may roll back only while nothing irreversible has happened. Once
//! an external request has been sent, the ledger change is kept and any
//! step that fails afterwards is handed to [`crate::reconciliation`].

pub mod account;
pub mod coordinator;
pub mod deposit;
pub mod error;
pub mod response;
pub mod state;
pub mod trade;
pub mod types;
pub mod validate;
pub mod withdraw;

#[cfg(test)]
pub(crate) mod testkit;

pub use coordinator::SettlementCoordinator;
pub use error::{SettlementError, ValidationError};
pub use response::{ResponseStatus, SettlementResponseV1};
pub use state::SagaState;
pub use types::{
    AccountHistory, CryptoDepositRequest, CryptoWithdrawalRequest, FavouriteView,
    FiatDepositRequest, FiatWithdrawalRequest, HotWallet, SagaPolicy, SettlementOutcome,
    SettlementReceipt, TradeRequest,
};
