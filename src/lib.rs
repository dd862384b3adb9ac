//! Custody Settlement - custodial exchange settlement core
//!
//! Every balance change runs as a saga over three stores and two external
//! gateways, and either completes, rolls back with no net effect, or is
//! handed to reconciliation with enough context to finish it later.
//!
//! # Modules
//!
//! - [`core_types`] - User ids, asset codes, saga kinds
//! - [`wallet`] - Per-account Ethereum wallet material
//! - [`ledger`] - Account balances with scoped, all-or-nothing writes
//! - [`audit`] - Append-only settlement records
//! - [`gateway`] - EVM chain and payout clients
//! - [`settlement`] - Saga coordinator and response envelope
//! - [`reconciliation`] - Queue and background worker for leftover work
//! - [`db`] - PostgreSQL pool and schema bootstrap

// Core types - must be first!
pub mod core_types;

pub mod audit;
pub mod gateway;
pub mod ledger;
pub mod reconciliation;
pub mod settlement;
pub mod wallet;

// Infrastructure
pub mod config;
pub mod db;
pub mod logging;

// Convenient re-exports at crate root
pub use audit::{AuditStore, SettlementRecord};
pub use core_types::{AssetCode, ExternalRef, SagaKind, Side, UserId};
pub use gateway::{ChainClient, GatewayError, PayoutClient};
pub use ledger::{LedgerError, LedgerScope, LedgerStore};
pub use reconciliation::{ReconciliationItem, ReconciliationQueue, ReconciliationWorker};
pub use settlement::{
    SagaState, SettlementCoordinator, SettlementError, SettlementOutcome, SettlementResponseV1,
};
