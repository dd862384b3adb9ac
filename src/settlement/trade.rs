//! Trade saga
//!
//! Both legs are written in one scope. The audit record goes in before the
//! commit so a trade is never settled without its record; if the commit
//! then fails the record is orphaned and flagged.

use chrono::Utc;
use tracing::{error, info};

use super::coordinator::{SagaTracker, SettlementCoordinator};
use super::error::SettlementError;
use super::state::SagaState;
use super::types::{SettlementOutcome, TradeRequest};
use super::validate;
use crate::audit::{Counterparty, RecordDetail, RecordKind, SettlementRecord};
use crate::core_types::{AssetCode, SagaKind, Side};
use crate::reconciliation::ReconciliationReason;

impl SettlementCoordinator {
    pub async fn trade(&self, request: TradeRequest) -> Result<SettlementOutcome, SettlementError> {
        let this = self.clone();
        self.detached(async move { this.run_trade(request).await })
            .await
    }

    /// Fiat legs keep the fiat precision so every balance stays withdrawable
    fn leg_scale(&self, asset: &AssetCode) -> u32 {
        let policy = self.policy();
        if *asset == policy.fiat_asset {
            policy.fiat_scale
        } else {
            validate::CRYPTO_SCALE
        }
    }

    async fn run_trade(&self, request: TradeRequest) -> Result<SettlementOutcome, SettlementError> {
        let mut saga = SagaTracker::new(SagaKind::Trade, request.user.clone());
        validate::user(&request.user)?;
        validate::pair(&request.base, &request.quote)?;
        validate::amount(request.quantity, self.leg_scale(&request.base))?;
        validate::amount(request.total, self.leg_scale(&request.quote))?;
        saga.advance(SagaState::Validated);

        let mut scope = self.ledger().begin().await?;
        saga.advance(SagaState::LedgerPending);

        let snapshot = scope.lock_account(&request.user).await;
        let snapshot = self
            .or_roll_back(&mut saga, &mut scope, "balance read failed", snapshot)
            .await?;
        let base_balance = snapshot.balance(&request.base);
        let quote_balance = snapshot.balance(&request.quote);

        let (spent, requested, available) = match request.side {
            Side::Buy => (&request.quote, request.total, quote_balance),
            Side::Sell => (&request.base, request.quantity, base_balance),
        };
        if requested > available {
            self.reject_insufficient(&mut saga, &mut scope, spent, requested, available)
                .await;
            return Err(SettlementError::InsufficientFunds {
                asset: spent.clone(),
                requested,
                available,
            });
        }

        let (base_after, quote_after) = match request.side {
            Side::Buy => (base_balance + request.quantity, quote_balance - request.total),
            Side::Sell => (base_balance - request.quantity, quote_balance + request.total),
        };
        let written = scope
            .write_balances(
                &request.user,
                &[
                    (request.base.clone(), base_after),
                    (request.quote.clone(), quote_after),
                ],
            )
            .await;
        self.or_roll_back(&mut saga, &mut scope, "balance write failed", written)
            .await?;

        let record = SettlementRecord {
            kind: RecordKind::Trade,
            user: request.user.clone(),
            counterparty: Counterparty::Pair {
                base: request.base.clone(),
                quote: request.quote.clone(),
            },
            asset: request.base.clone(),
            amount: request.quantity,
            external_ref: None,
            tx_id: saga.tx_id,
            balance_after: Some(base_after),
            time: Utc::now(),
            detail: RecordDetail::Trade {
                side: request.side,
                quantity: request.quantity,
                total: request.total,
                base_after,
                quote_after,
            },
        };
        if let Err(e) = self.audit().append(&record).await {
            self.roll_back(&mut saga, &mut scope, "audit write failed")
                .await;
            return Err(e.into());
        }
        saga.advance(SagaState::AuditWritten);

        let mut receipt = saga.receipt(&request.base, request.quantity);
        receipt.balance_after = Some(base_after);
        receipt.quote_balance_after = Some(quote_after);

        match scope.commit().await {
            Ok(()) => {
                saga.advance(SagaState::Committed);
                info!(
                    tx_id = %saga.tx_id,
                    user = %saga.user,
                    side = %request.side,
                    base = %request.base,
                    quote = %request.quote,
                    quantity = %request.quantity,
                    total = %request.total,
                    "Trade settled"
                );
                Ok(SettlementOutcome::Settled(receipt))
            }
            Err(e) => {
                saga.advance(SagaState::RolledBack);
                let item = saga
                    .item(&request.base, request.quantity, ReconciliationReason::OrphanedAuditRecord)
                    .with_pending_record(record)
                    .with_error(&e)
                    .manual_review();
                let reconciliation_id = self.flag(&saga, item).await;
                error!(
                    tx_id = %saga.tx_id,
                    reconciliation_id = %reconciliation_id,
                    error = %e,
                    "Trade commit failed after audit write, record orphaned"
                );
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::Harness;
    use super::*;
    use crate::audit::AuditStore;
    use crate::settlement::error::ValidationError;
    use crate::reconciliation::{ReconciliationQueue, ReconciliationStatus};
    use futures::TryStreamExt;
    use rust_decimal::Decimal;

    fn trade(h: &Harness, side: Side, quantity: Decimal, total: Decimal) -> TradeRequest {
        TradeRequest {
            user: h.user.clone(),
            side,
            base: AssetCode::new("ETH"),
            quote: AssetCode::new("USD"),
            quantity,
            total,
        }
    }

    #[tokio::test]
    async fn test_buy_moves_both_legs() {
        let h = Harness::new().await;
        h.fund("USD", Decimal::new(3000, 0)).await;

        let outcome = h
            .coordinator
            .trade(trade(&h, Side::Buy, Decimal::new(5, 1), Decimal::new(125050, 2)))
            .await
            .unwrap();

        assert!(outcome.is_settled());
        assert_eq!(h.balance("ETH").await, Decimal::new(5, 1));
        assert_eq!(h.balance("USD").await, Decimal::new(174950, 2));
        assert_eq!(outcome.receipt().quote_balance_after, Some(Decimal::new(174950, 2)));

        let trades: Vec<_> = h
            .audit
            .query_by_user(RecordKind::Trade, &h.user)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(trades.len(), 1);
    }

    #[tokio::test]
    async fn test_sell_checks_base_balance() {
        let h = Harness::new().await;
        h.fund("ETH", Decimal::ONE).await;

        let err = h
            .coordinator
            .trade(trade(&h, Side::Sell, Decimal::new(2, 0), Decimal::new(5000, 0)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SettlementError::InsufficientFunds { ref asset, .. } if asset.as_str() == "ETH"
        ));
        assert_eq!(h.balance("ETH").await, Decimal::ONE);
        assert_eq!(h.balance("USD").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_audit_failure_rolls_back_trade() {
        let h = Harness::new().await;
        h.fund("USD", Decimal::new(100, 0)).await;
        h.audit.fail_next_appends(1);

        let err = h
            .coordinator
            .trade(trade(&h, Side::Buy, Decimal::ONE, Decimal::new(100, 0)))
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::AuditUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(h.balance("USD").await, Decimal::new(100, 0));
        assert_eq!(h.balance("ETH").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_commit_failure_flags_orphaned_record() {
        let h = Harness::new().await;
        h.fund("USD", Decimal::new(100, 0)).await;
        h.ledger.fail_next_commits(1);

        let err = h
            .coordinator
            .trade(trade(&h, Side::Buy, Decimal::ONE, Decimal::new(100, 0)))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(h.balance("USD").await, Decimal::new(100, 0));
        let items = h.queue.all().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].reason, ReconciliationReason::OrphanedAuditRecord);
        assert_eq!(items[0].status, ReconciliationStatus::ManualReview);
        assert!(h.queue.pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fiat_leg_limited_to_fiat_scale() {
        let h = Harness::new().await;
        h.fund("USD", Decimal::new(100, 0)).await;

        let err = h
            .coordinator
            .trade(trade(&h, Side::Buy, Decimal::new(1, 6), Decimal::new(5, 3)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SettlementError::Validation(ValidationError::PrecisionExceeded { max_scale: 2, .. })
        ));
        assert_eq!(h.balance("USD").await, Decimal::new(100, 0));
        assert_eq!(h.balance("ETH").await, Decimal::ZERO);

        // Sub-cent crypto quantity is fine, the fiat total is what is bounded
        let outcome = h
            .coordinator
            .trade(trade(&h, Side::Buy, Decimal::new(1, 6), Decimal::new(1, 2)))
            .await
            .unwrap();
        assert!(outcome.is_settled());
        assert_eq!(h.balance("USD").await, Decimal::new(9999, 2));
    }

    #[tokio::test]
    async fn test_same_asset_rejected() {
        let h = Harness::new().await;
        let mut request = trade(&h, Side::Buy, Decimal::ONE, Decimal::ONE);
        request.quote = AssetCode::new("eth");
        let err = h.coordinator.trade(request).await.unwrap_err();
        assert!(err.is_rejection());
    }
}
