//! Settlement request, outcome and policy types

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use ulid::Ulid;

use crate::audit::SettlementRecord;
use crate::core_types::{AssetCode, ExternalRef, SagaKind, Side, TxId, UserId};
use crate::gateway::evm::NATIVE_TRANSFER_GAS;
use crate::ledger::FavouriteEntry;
use crate::reconciliation::ReconciliationReason;
use crate::wallet::SigningKey;

// ============================================================================
// Requests
// ============================================================================

/// Off-system fiat credit, e.g. a confirmed card or bank payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiatDepositRequest {
    pub user: UserId,
    pub amount: Decimal,
    /// Payment provider reference. Settles at most once.
    pub external_id: String,
    /// Where the money came from, for the audit record
    pub payer: String,
}

/// Sweep whatever sits on the user's deposit address into the hot wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoDepositRequest {
    pub user: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoWithdrawalRequest {
    pub user: UserId,
    pub to_address: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiatWithdrawalRequest {
    pub user: UserId,
    /// Payout recipient e-mail
    pub recipient: String,
    pub amount: Decimal,
}

/// Exchange `quantity` of `base` against `total` of `quote` at a price
/// agreed upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub user: UserId,
    pub side: Side,
    pub base: AssetCode,
    pub quote: AssetCode,
    pub quantity: Decimal,
    pub total: Decimal,
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub tx_id: TxId,
    pub kind: SagaKind,
    pub user: UserId,
    pub asset: AssetCode,
    pub amount: Decimal,
    pub external_ref: Option<ExternalRef>,
    /// `None` when the ledger change is still owed
    pub balance_after: Option<Decimal>,
    /// Trades only
    pub quote_balance_after: Option<Decimal>,
}

/// Result of a saga that got past validation and reached its irreversible
/// point, or completed without one.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Settled(SettlementReceipt),

    /// Ledger committed, audit record queued for a later write
    AuditLagging {
        receipt: SettlementReceipt,
        reconciliation_id: Ulid,
    },

    /// The external effect may have happened. Never retry this request.
    ReconciliationNeeded {
        receipt: SettlementReceipt,
        reconciliation_id: Ulid,
        reason: ReconciliationReason,
    },
}

impl SettlementOutcome {
    pub fn receipt(&self) -> &SettlementReceipt {
        match self {
            SettlementOutcome::Settled(receipt)
            | SettlementOutcome::AuditLagging { receipt, .. }
            | SettlementOutcome::ReconciliationNeeded { receipt, .. } => receipt,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, SettlementOutcome::Settled(_))
    }

    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, SettlementOutcome::ReconciliationNeeded { .. })
    }

    pub fn reconciliation_id(&self) -> Option<Ulid> {
        match self {
            SettlementOutcome::Settled(_) => None,
            SettlementOutcome::AuditLagging {
                reconciliation_id, ..
            }
            | SettlementOutcome::ReconciliationNeeded {
                reconciliation_id, ..
            } => Some(*reconciliation_id),
        }
    }
}

// ============================================================================
// Read models
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountHistory {
    pub deposits: Vec<SettlementRecord>,
    pub withdrawals: Vec<SettlementRecord>,
    pub trades: Vec<SettlementRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FavouriteView {
    #[serde(flatten)]
    pub entry: FavouriteEntry,
    /// On-chain balance; `None` when the lookup failed
    pub balance: Option<Decimal>,
}

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct SagaPolicy {
    /// Upper bound on every gateway call
    pub external_timeout: Duration,
    /// Attempts for calls failing before the gateway accepted anything
    pub max_pre_accept_attempts: u32,
    pub retry_backoff: Duration,
    pub fiat_asset: AssetCode,
    /// Decimal places accepted for fiat amounts
    pub fiat_scale: u32,
    pub native_asset: AssetCode,
    pub withdrawal_gas_price_gwei: Decimal,
    pub gas_limit: u64,
}

impl Default for SagaPolicy {
    fn default() -> Self {
        Self {
            external_timeout: Duration::from_secs(30),
            max_pre_accept_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            fiat_asset: AssetCode::new("USD"),
            fiat_scale: 2,
            native_asset: AssetCode::new("ETH"),
            withdrawal_gas_price_gwei: Decimal::new(30, 0),
            gas_limit: NATIVE_TRANSFER_GAS,
        }
    }
}

/// Custodial wallet receiving sweeps and funding withdrawals
#[derive(Debug, Clone)]
pub struct HotWallet {
    pub address: String,
    pub signing_key: SigningKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt() -> SettlementReceipt {
        SettlementReceipt {
            tx_id: uuid::Uuid::new_v4(),
            kind: SagaKind::FiatWithdrawal,
            user: UserId::new("alice"),
            asset: AssetCode::new("USD"),
            amount: Decimal::TEN,
            external_ref: None,
            balance_after: Some(Decimal::ZERO),
            quote_balance_after: None,
        }
    }

    #[test]
    fn test_outcome_accessors() {
        let id = Ulid::new();
        let settled = SettlementOutcome::Settled(receipt());
        assert!(settled.is_settled());
        assert_eq!(settled.reconciliation_id(), None);

        let flagged = SettlementOutcome::ReconciliationNeeded {
            receipt: receipt(),
            reconciliation_id: id,
            reason: ReconciliationReason::AmbiguousExternalEffect,
        };
        assert!(flagged.needs_reconciliation());
        assert_eq!(flagged.reconciliation_id(), Some(id));
        assert_eq!(flagged.receipt().amount, Decimal::TEN);
    }

    #[test]
    fn test_trade_request_from_json() {
        let request: TradeRequest = serde_json::from_str(
            r#"{"user":"alice","side":"buy","base":"eth","quote":"USD","quantity":"0.5","total":"1000.25"}"#,
        )
        .unwrap();
        assert_eq!(request.base, AssetCode::new("ETH"));
        assert_eq!(request.side, Side::Buy);
        assert_eq!(request.total, Decimal::new(100025, 2));
    }
}
