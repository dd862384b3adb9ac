//! Withdrawal sagas
//!
//! ```text
//! lock + debit (scope open) → external send → claim ref → audit → commit
//! ```
//! Before the send, any failure rolls the scope back. After it, the debit
//! is committed no matter what and anything left undone goes to the
//! reconciliation queue.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info};

use super::coordinator::{SagaTracker, SettlementCoordinator};
use super::error::SettlementError;
use super::state::SagaState;
use super::types::{
    CryptoWithdrawalRequest, FiatWithdrawalRequest, SettlementOutcome, SettlementReceipt,
};
use super::validate;
use crate::audit::{Counterparty, RecordDetail, RecordKind, SettlementRecord};
use crate::core_types::{AssetCode, ExternalRef, SagaKind};
use crate::gateway::units::fee_ether;
use crate::gateway::{GatewayError, PayoutRequest, TransferRequest};
use crate::ledger::LedgerScope;
use crate::reconciliation::{LedgerRepair, ReconciliationReason};

/// What the shared tail of both withdrawal sagas needs to know
struct Withdrawal {
    asset: AssetCode,
    amount: Decimal,
    balance_after: Decimal,
    destination: String,
    detail: RecordDetail,
    /// Chain transfers can be confirmed later by receipt; payouts cannot
    confirmable: bool,
}

impl SettlementCoordinator {
    /// Pay `amount` of the native asset from the hot wallet to `to_address`
    pub async fn withdraw_crypto(
        &self,
        request: CryptoWithdrawalRequest,
    ) -> Result<SettlementOutcome, SettlementError> {
        let this = self.clone();
        self.detached(async move { this.run_crypto_withdrawal(request).await })
            .await
    }

    /// Pay `amount` of the fiat asset to a payout recipient
    pub async fn withdraw_fiat(
        &self,
        request: FiatWithdrawalRequest,
    ) -> Result<SettlementOutcome, SettlementError> {
        let this = self.clone();
        self.detached(async move { this.run_fiat_withdrawal(request).await })
            .await
    }

    async fn run_crypto_withdrawal(
        &self,
        request: CryptoWithdrawalRequest,
    ) -> Result<SettlementOutcome, SettlementError> {
        let mut saga = SagaTracker::new(SagaKind::CryptoWithdrawal, request.user.clone());
        let policy = self.policy().clone();
        validate::user(&request.user)?;
        validate::amount(request.amount, validate::CRYPTO_SCALE)?;
        validate::address(&request.to_address)?;
        saga.advance(SagaState::Validated);

        let mut scope = self.ledger().begin().await?;
        saga.advance(SagaState::LedgerPending);
        let balance_after = self
            .debit(&mut saga, &mut scope, &policy.native_asset, request.amount)
            .await?;

        saga.advance(SagaState::ExternalPending);
        let hot = self.hot_wallet();
        let transfer = TransferRequest {
            from: hot.address.clone(),
            to: request.to_address.clone(),
            amount: request.amount,
            gas_price_gwei: policy.withdrawal_gas_price_gwei,
            signing_key: hot.signing_key.clone(),
        };
        let sent = self.transfer_onchain(&saga, &transfer).await;

        let withdrawal = Withdrawal {
            asset: policy.native_asset.clone(),
            amount: request.amount,
            balance_after,
            destination: request.to_address,
            detail: RecordDetail::Crypto {
                gross: None,
                fee: fee_ether(policy.gas_limit, policy.withdrawal_gas_price_gwei),
                gas_price_gwei: policy.withdrawal_gas_price_gwei,
            },
            confirmable: true,
        };
        self.finish_withdrawal(saga, scope, withdrawal, sent).await
    }

    async fn run_fiat_withdrawal(
        &self,
        request: FiatWithdrawalRequest,
    ) -> Result<SettlementOutcome, SettlementError> {
        let mut saga = SagaTracker::new(SagaKind::FiatWithdrawal, request.user.clone());
        let policy = self.policy().clone();
        validate::user(&request.user)?;
        validate::amount(request.amount, policy.fiat_scale)?;
        validate::recipient(&request.recipient)?;
        saga.advance(SagaState::Validated);

        let mut scope = self.ledger().begin().await?;
        saga.advance(SagaState::LedgerPending);
        let balance_after = self
            .debit(&mut saga, &mut scope, &policy.fiat_asset, request.amount)
            .await?;

        saga.advance(SagaState::ExternalPending);
        // The tx id doubles as the payout batch id, so the provider itself
        // refuses a second execution of this saga
        let payout = PayoutRequest {
            batch_id: saga.tx_id.to_string(),
            amount: request.amount,
            recipient: request.recipient.clone(),
        };
        let sent = self.pay_out(&saga, &payout).await;

        let withdrawal = Withdrawal {
            asset: policy.fiat_asset.clone(),
            amount: request.amount,
            balance_after,
            destination: request.recipient,
            detail: RecordDetail::Fiat,
            confirmable: false,
        };
        self.finish_withdrawal(saga, scope, withdrawal, sent).await
    }

    fn withdrawal_record(
        saga: &SagaTracker,
        withdrawal: &Withdrawal,
        external_ref: Option<ExternalRef>,
        balance_after: Option<Decimal>,
    ) -> SettlementRecord {
        SettlementRecord {
            kind: RecordKind::Withdrawal,
            user: saga.user.clone(),
            counterparty: Counterparty::Payee {
                destination: withdrawal.destination.clone(),
            },
            asset: withdrawal.asset.clone(),
            amount: withdrawal.amount,
            external_ref,
            tx_id: saga.tx_id,
            balance_after,
            time: Utc::now(),
            detail: withdrawal.detail.clone(),
        }
    }

    /// Everything after the external call returned
    async fn finish_withdrawal(
        &self,
        mut saga: SagaTracker,
        mut scope: LedgerScope,
        withdrawal: Withdrawal,
        sent: Result<ExternalRef, GatewayError>,
    ) -> Result<SettlementOutcome, SettlementError> {
        let mut receipt = saga.receipt(&withdrawal.asset, withdrawal.amount);
        receipt.balance_after = Some(withdrawal.balance_after);
        let refund = LedgerRepair {
            asset: withdrawal.asset.clone(),
            delta: withdrawal.amount,
            claim_ref: format!("refund:{}", saga.tx_id),
        };

        let external_ref = match sent {
            Ok(external_ref) => {
                saga.advance(SagaState::ExternalDone);
                external_ref
            }
            Err(e) if !e.possibly_accepted() => {
                saga.advance(SagaState::ExternalFailed);
                self.roll_back(&mut saga, &mut scope, "external effect failed")
                    .await;
                return Err(SettlementError::ExternalEffectFailed(e));
            }
            Err(e) => {
                return Ok(self
                    .hold_ambiguous(saga, scope, withdrawal, receipt, refund, e)
                    .await);
            }
        };
        receipt.external_ref = Some(external_ref.clone());
        let debit_repair = LedgerRepair {
            asset: withdrawal.asset.clone(),
            delta: -withdrawal.amount,
            claim_ref: external_ref.clone(),
        };

        // A claim failure surfaces again at commit time
        match scope
            .claim_external_ref(&external_ref, &saga.user, saga.kind.as_str())
            .await
        {
            Ok(true) => {}
            Ok(false) => error!(
                tx_id = %saga.tx_id,
                external_ref = %external_ref,
                "External reference already claimed by another saga"
            ),
            Err(e) => error!(tx_id = %saga.tx_id, error = %e, "External reference claim failed"),
        }

        let record = Self::withdrawal_record(
            &saga,
            &withdrawal,
            Some(external_ref.clone()),
            Some(withdrawal.balance_after),
        );
        let audit = self.audit().append(&record).await;
        if audit.is_ok() {
            saga.advance(SagaState::AuditWritten);
        }

        match (audit, scope.commit().await) {
            (Ok(_), Ok(())) => {
                saga.advance(SagaState::Committed);
                info!(
                    tx_id = %saga.tx_id,
                    user = %saga.user,
                    kind = %saga.kind,
                    asset = %withdrawal.asset,
                    amount = %withdrawal.amount,
                    external_ref = %external_ref,
                    "Withdrawal settled"
                );
                Ok(SettlementOutcome::Settled(receipt))
            }
            (Err(audit_err), Ok(())) => {
                let mut item = saga
                    .item(&withdrawal.asset, withdrawal.amount, ReconciliationReason::AuditWriteFailed)
                    .with_external_ref(Some(external_ref))
                    .awaiting_confirmation(withdrawal.confirmable)
                    .with_pending_record(record)
                    .with_error(&audit_err);
                if withdrawal.confirmable {
                    item = item.with_refund_on_revert(refund);
                }
                Ok(self.escalate(&mut saga, item, receipt).await)
            }
            (audit, Err(commit_err)) => {
                receipt.balance_after = None;
                let mut item = saga
                    .item(&withdrawal.asset, withdrawal.amount, ReconciliationReason::LedgerCommitFailed)
                    .with_external_ref(Some(external_ref))
                    .awaiting_confirmation(withdrawal.confirmable)
                    .with_ledger_repair(debit_repair)
                    .with_error(&commit_err);
                if audit.is_err() {
                    let record = Self::withdrawal_record(
                        &saga,
                        &withdrawal,
                        record.external_ref.clone(),
                        None,
                    );
                    item = item.with_pending_record(record);
                }
                Ok(self.escalate(&mut saga, item, receipt).await)
            }
        }
    }

    /// The external call may have gone through. Keep the debit and hand the
    /// outcome to reconciliation.
    async fn hold_ambiguous(
        &self,
        mut saga: SagaTracker,
        mut scope: LedgerScope,
        withdrawal: Withdrawal,
        mut receipt: SettlementReceipt,
        refund: LedgerRepair,
        cause: GatewayError,
    ) -> SettlementOutcome {
        let reference = cause.reference().map(str::to_string);
        receipt.external_ref = reference.clone();

        let claimed = match &reference {
            Some(reference) => scope
                .claim_external_ref(reference, &saga.user, saga.kind.as_str())
                .await
                .map(|_| ()),
            None => Ok(()),
        };
        let committed = match claimed {
            Ok(()) => scope.commit().await,
            Err(e) => {
                if let Err(rollback_err) = scope.rollback().await {
                    error!(tx_id = %saga.tx_id, error = %rollback_err, "Ledger rollback failed");
                }
                Err(e)
            }
        };

        let awaiting = withdrawal.confirmable && reference.is_some();
        let mut item = saga
            .item(&withdrawal.asset, withdrawal.amount, ReconciliationReason::AmbiguousExternalEffect)
            .with_external_ref(reference.clone())
            .awaiting_confirmation(awaiting)
            .with_pending_record(Self::withdrawal_record(
                &saga,
                &withdrawal,
                reference.clone(),
                committed.as_ref().ok().map(|_| withdrawal.balance_after),
            ))
            .with_error(&cause);

        match committed {
            Ok(()) => item = item.with_refund_on_revert(refund),
            Err(e) => {
                receipt.balance_after = None;
                item = item
                    .with_ledger_repair(LedgerRepair {
                        asset: withdrawal.asset.clone(),
                        delta: -withdrawal.amount,
                        claim_ref: reference
                            .clone()
                            .unwrap_or_else(|| format!("debit:{}", saga.tx_id)),
                    })
                    .with_error(format!("{cause}; debit commit failed: {e}"));
            }
        }
        if !awaiting {
            item = item.manual_review();
        }
        self.escalate(&mut saga, item, receipt).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::Harness;
    use super::*;
    use crate::reconciliation::{ReconciliationQueue, ReconciliationStatus};
    use crate::wallet;
    use std::time::Duration;

    fn crypto(h: &Harness, amount: Decimal) -> CryptoWithdrawalRequest {
        CryptoWithdrawalRequest {
            user: h.user.clone(),
            to_address: wallet::generate().address,
            amount,
        }
    }

    fn fiat(h: &Harness, amount: Decimal) -> FiatWithdrawalRequest {
        FiatWithdrawalRequest {
            user: h.user.clone(),
            recipient: "bob@example.com".into(),
            amount,
        }
    }

    #[tokio::test]
    async fn test_crypto_withdrawal_happy_path() {
        let h = Harness::new().await;
        h.fund("ETH", Decimal::new(2, 0)).await;

        let outcome = h
            .coordinator
            .withdraw_crypto(crypto(&h, Decimal::new(5, 1)))
            .await
            .unwrap();

        assert!(outcome.is_settled());
        assert_eq!(h.balance("ETH").await, Decimal::new(15, 1));
        assert_eq!(h.chain.sent().len(), 1);
        let external_ref = outcome.receipt().external_ref.clone().unwrap();
        assert!(h.ledger.is_claimed(&external_ref));
        assert_eq!(h.audit.len().await, 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_never_calls_gateway() {
        let h = Harness::new().await;
        h.fund("ETH", Decimal::ONE).await;

        let err = h
            .coordinator
            .withdraw_crypto(crypto(&h, Decimal::new(2, 0)))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SettlementError::InsufficientFunds {
                asset: AssetCode::new("ETH"),
                requested: Decimal::new(2, 0),
                available: Decimal::ONE,
            }
        );
        assert_eq!(h.chain.send_attempts(), 0);
        assert_eq!(h.balance("ETH").await, Decimal::ONE);
    }

    #[tokio::test]
    async fn test_definite_rejection_rolls_back() {
        let h = Harness::new().await;
        h.fund("ETH", Decimal::ONE).await;
        h.chain
            .push_send_result(Err(GatewayError::InsufficientGasFunds("hot wallet empty".into())));

        let err = h
            .coordinator
            .withdraw_crypto(crypto(&h, Decimal::ONE))
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::ExternalEffectFailed(_)));
        assert!(err.is_retryable());
        assert_eq!(h.balance("ETH").await, Decimal::ONE);
        assert!(h.queue.is_empty().await);
        assert_eq!(h.audit.len().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_keeps_debit_and_flags() {
        let h = Harness::new().await;
        h.fund("ETH", Decimal::ONE).await;
        h.chain.set_send_delay(Some(Duration::from_secs(5)));

        let outcome = h
            .coordinator
            .withdraw_crypto(crypto(&h, Decimal::new(4, 1)))
            .await
            .unwrap();

        let SettlementOutcome::ReconciliationNeeded {
            reconciliation_id,
            reason,
            receipt,
        } = outcome
        else {
            panic!("expected reconciliation, got {outcome:?}");
        };
        assert_eq!(reason, ReconciliationReason::AmbiguousExternalEffect);
        assert_eq!(h.chain.send_attempts(), 1);
        assert_eq!(h.balance("ETH").await, Decimal::new(6, 1));

        let item = h.queue.get(reconciliation_id).await.unwrap().unwrap();
        assert!(item.awaiting_confirmation);
        assert_eq!(item.external_ref, receipt.external_ref);
        assert!(item.refund_on_revert.is_some());
        assert!(item.ledger_repair.is_none());
    }

    #[tokio::test]
    async fn test_audit_failure_after_send_commits_and_flags() {
        let h = Harness::new().await;
        h.fund("ETH", Decimal::ONE).await;
        h.audit.fail_next_appends(1);

        let outcome = h
            .coordinator
            .withdraw_crypto(crypto(&h, Decimal::ONE))
            .await
            .unwrap();

        assert!(outcome.needs_reconciliation());
        assert_eq!(h.balance("ETH").await, Decimal::ZERO);
        let item = h
            .queue
            .get(outcome.reconciliation_id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.reason, ReconciliationReason::AuditWriteFailed);
        assert!(item.pending_record.is_some());
    }

    #[tokio::test]
    async fn test_commit_failure_after_send_queues_debit() {
        let h = Harness::new().await;
        h.fund("ETH", Decimal::ONE).await;
        h.ledger.fail_next_commits(1);

        let outcome = h
            .coordinator
            .withdraw_crypto(crypto(&h, Decimal::ONE))
            .await
            .unwrap();

        assert!(outcome.needs_reconciliation());
        assert_eq!(outcome.receipt().balance_after, None);
        // Debit lost with the scope, owed by reconciliation
        assert_eq!(h.balance("ETH").await, Decimal::ONE);
        let item = h
            .queue
            .get(outcome.reconciliation_id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.reason, ReconciliationReason::LedgerCommitFailed);
        assert_eq!(item.ledger_repair.unwrap().delta, -Decimal::ONE);
    }

    #[tokio::test]
    async fn test_fiat_withdrawal_uses_tx_id_as_batch() {
        let h = Harness::new().await;
        h.fund("USD", Decimal::new(100, 0)).await;

        let outcome = h
            .coordinator
            .withdraw_fiat(fiat(&h, Decimal::new(2550, 2)))
            .await
            .unwrap();

        assert!(outcome.is_settled());
        assert_eq!(h.balance("USD").await, Decimal::new(7450, 2));
        let paid = h.payout.paid();
        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].batch_id, outcome.receipt().tx_id.to_string());
    }

    #[tokio::test]
    async fn test_fiat_withdrawal_ambiguous_goes_to_manual_review() {
        let h = Harness::new().await;
        h.fund("USD", Decimal::new(100, 0)).await;
        h.payout.push_result(Err(GatewayError::Ambiguous {
            reference: None,
            reason: "502 from provider".into(),
        }));

        let outcome = h
            .coordinator
            .withdraw_fiat(fiat(&h, Decimal::TEN))
            .await
            .unwrap();

        assert!(outcome.needs_reconciliation());
        assert_eq!(h.payout.attempts(), 1);
        assert_eq!(h.balance("USD").await, Decimal::new(90, 0));
        let item = h
            .queue
            .get(outcome.reconciliation_id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.status, ReconciliationStatus::ManualReview);
    }

    #[tokio::test]
    async fn test_fiat_withdrawal_network_error_retried_then_succeeds() {
        let h = Harness::new().await;
        h.fund("USD", Decimal::new(100, 0)).await;
        h.payout
            .push_result(Err(GatewayError::Network("connection refused".into())));

        let outcome = h
            .coordinator
            .withdraw_fiat(fiat(&h, Decimal::TEN))
            .await
            .unwrap();

        assert!(outcome.is_settled());
        assert_eq!(h.payout.attempts(), 2);
        assert_eq!(h.payout.paid().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_recipient_rejected_before_ledger() {
        let h = Harness::new().await;
        h.fund("USD", Decimal::new(100, 0)).await;
        let mut request = fiat(&h, Decimal::TEN);
        request.recipient = "not-an-email".into();

        let err = h.coordinator.withdraw_fiat(request).await.unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(h.payout.attempts(), 0);
    }
}
