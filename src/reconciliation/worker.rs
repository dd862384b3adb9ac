//! Reconciliation Worker
//!
//! Background worker that drives queued items to a final status. It never
//! repeats an external effect: it only asks the chain what happened, then
//! applies the ledger change and audit record the saga left owed.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ReconciliationError, ReconciliationItem, ReconciliationQueue, ReconciliationStatus};
use crate::audit::AuditStore;
use crate::gateway::{ChainClient, Confirmation};
use crate::ledger::{LedgerError, LedgerStore, apply_claimed_delta};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan the queue
    pub scan_interval: Duration,
    /// Maximum items to process per scan
    pub batch_size: usize,
    /// Receipt lookups before an unconfirmed item goes to manual review
    pub max_confirmation_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            batch_size: 100,
            max_confirmation_attempts: 40,
        }
    }
}

/// Counts from one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub resolved: usize,
    pub manual_review: usize,
}

pub struct ReconciliationWorker {
    ledger: Arc<dyn LedgerStore>,
    audit: Arc<dyn AuditStore>,
    chain: Arc<dyn ChainClient>,
    queue: Arc<dyn ReconciliationQueue>,
    config: WorkerConfig,
}

impl ReconciliationWorker {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        audit: Arc<dyn AuditStore>,
        chain: Arc<dyn ChainClient>,
        queue: Arc<dyn ReconciliationQueue>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            ledger,
            audit,
            chain,
            queue,
            config,
        }
    }

    /// Scan until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting reconciliation worker"
        );

        loop {
            if let Err(e) = self.scan_once().await {
                error!(error = %e, "Reconciliation scan failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.scan_interval) => {}
            }
        }
        info!("Reconciliation worker stopped");
    }

    /// Run a single scan over pending items
    pub async fn scan_once(&self) -> Result<ScanReport, ReconciliationError> {
        let items = self.queue.pending(self.config.batch_size).await?;
        if items.is_empty() {
            debug!("No pending reconciliation items");
            return Ok(ScanReport::default());
        }

        let mut report = ScanReport {
            scanned: items.len(),
            ..ScanReport::default()
        };
        for item in items {
            let id = item.id;
            match self.process(item).await {
                Ok(ReconciliationStatus::Resolved) => report.resolved += 1,
                Ok(ReconciliationStatus::ManualReview) => report.manual_review += 1,
                Ok(ReconciliationStatus::Pending) => {}
                Err(e) => {
                    error!(reconciliation_id = %id, error = %e, "Failed to update reconciliation item");
                }
            }
        }

        if report.resolved > 0 || report.manual_review > 0 {
            info!(
                scanned = report.scanned,
                resolved = report.resolved,
                manual_review = report.manual_review,
                "Reconciliation scan complete"
            );
        }
        Ok(report)
    }

    async fn process(
        &self,
        mut item: ReconciliationItem,
    ) -> Result<ReconciliationStatus, ReconciliationError> {
        item.attempts += 1;
        debug!(
            reconciliation_id = %item.id,
            tx_id = %item.tx_id,
            reason = %item.reason,
            attempts = item.attempts,
            "Reconciling"
        );

        if item.awaiting_confirmation && !self.confirm(&mut item).await {
            return self.save(item).await;
        }

        if let Some(repair) = item.ledger_repair.clone() {
            match apply_claimed_delta(
                self.ledger.as_ref(),
                &item.user,
                &repair.asset,
                repair.delta,
                &repair.claim_ref,
                item.kind.as_str(),
            )
            .await
            {
                Ok(balance) => {
                    info!(
                        reconciliation_id = %item.id,
                        user = %item.user,
                        asset = %repair.asset,
                        delta = %repair.delta,
                        balance = %balance,
                        "Ledger repaired"
                    );
                    item.ledger_repair = None;
                }
                Err(LedgerError::RefAlreadyClaimed(_)) => {
                    debug!(reconciliation_id = %item.id, "Ledger repair already applied");
                    item.ledger_repair = None;
                }
                Err(e @ LedgerError::NegativeBalance { .. }) => {
                    warn!(reconciliation_id = %item.id, error = %e, "Ledger repair needs an operator");
                    item.last_error = Some(e.to_string());
                    item.status = ReconciliationStatus::ManualReview;
                    return self.save(item).await;
                }
                Err(e) => {
                    item.last_error = Some(e.to_string());
                    return self.save(item).await;
                }
            }
        }

        if let Some(record) = item.pending_record.clone() {
            match self.audit.append(&record).await {
                Ok(_) => item.pending_record = None,
                Err(e) => {
                    item.last_error = Some(e.to_string());
                    return self.save(item).await;
                }
            }
        }

        item.status = ReconciliationStatus::Resolved;
        info!(
            reconciliation_id = %item.id,
            tx_id = %item.tx_id,
            reason = %item.reason,
            "Reconciliation item resolved"
        );
        self.save(item).await
    }

    /// Settle the outcome of the external effect. `false` stops processing
    /// for this scan.
    async fn confirm(&self, item: &mut ReconciliationItem) -> bool {
        let Some(reference) = item.external_ref.clone() else {
            item.status = ReconciliationStatus::ManualReview;
            item.last_error = Some("no external reference to confirm".to_string());
            return false;
        };

        match self.chain.confirmation(&reference).await {
            Ok(Confirmation::Confirmed) => {
                debug!(reconciliation_id = %item.id, tx_hash = %reference, "External effect confirmed");
                item.awaiting_confirmation = false;
                item.refund_on_revert = None;
                true
            }
            Ok(Confirmation::Reverted) => self.revert(item, &reference).await,
            Ok(Confirmation::Unknown) => {
                self.give_up_after_max(item, "transaction not yet mined");
                false
            }
            Err(e) => {
                self.give_up_after_max(item, &e.to_string());
                false
            }
        }
    }

    /// The effect definitely did not happen: undo what the saga kept and
    /// drop what it still owed.
    async fn revert(&self, item: &mut ReconciliationItem, reference: &str) -> bool {
        warn!(
            reconciliation_id = %item.id,
            tx_hash = %reference,
            "External effect reverted"
        );
        if let Some(refund) = item.refund_on_revert.clone() {
            match apply_claimed_delta(
                self.ledger.as_ref(),
                &item.user,
                &refund.asset,
                refund.delta,
                &refund.claim_ref,
                item.kind.as_str(),
            )
            .await
            {
                Ok(_) | Err(LedgerError::RefAlreadyClaimed(_)) => {}
                Err(e) => {
                    item.last_error = Some(e.to_string());
                    return false;
                }
            }
        }
        item.awaiting_confirmation = false;
        item.refund_on_revert = None;
        item.ledger_repair = None;
        item.pending_record = None;
        item.last_error = Some(format!("transaction {reference} reverted"));
        // Nothing left to do, the resolve path runs next
        true
    }

    fn give_up_after_max(&self, item: &mut ReconciliationItem, cause: &str) {
        item.last_error = Some(cause.to_string());
        if item.attempts >= self.config.max_confirmation_attempts {
            warn!(
                reconciliation_id = %item.id,
                attempts = item.attempts,
                "Confirmation attempts exhausted, moving to manual review"
            );
            item.status = ReconciliationStatus::ManualReview;
        }
    }

    async fn save(
        &self,
        item: ReconciliationItem,
    ) -> Result<ReconciliationStatus, ReconciliationError> {
        let status = item.status;
        self.queue.update(&item).await?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{MemoryAuditLog, RecordKind};
    use crate::core_types::{AssetCode, UserId};
    use crate::gateway::MockChain;
    use crate::ledger::MemoryLedger;
    use crate::reconciliation::MemoryReconciliationQueue;
    use crate::settlement::testkit::Harness;
    use crate::settlement::{CryptoWithdrawalRequest, FiatDepositRequest, SettlementOutcome};
    use crate::wallet;
    use futures::TryStreamExt;
    use rust_decimal::Decimal;

    fn worker(h: &Harness, max_confirmation_attempts: u32) -> ReconciliationWorker {
        ReconciliationWorker::new(
            Arc::new(h.ledger.clone()),
            Arc::new(h.audit.clone()),
            h.chain.clone(),
            Arc::new(h.queue.clone()),
            WorkerConfig {
                scan_interval: Duration::from_millis(10),
                batch_size: 10,
                max_confirmation_attempts,
            },
        )
    }

    async fn ambiguous_withdrawal(h: &Harness) -> SettlementOutcome {
        h.fund("ETH", Decimal::ONE).await;
        h.chain.set_send_delay(Some(Duration::from_secs(5)));
        let outcome = h
            .coordinator
            .withdraw_crypto(CryptoWithdrawalRequest {
                user: h.user.clone(),
                to_address: wallet::generate().address,
                amount: Decimal::new(4, 1),
            })
            .await
            .unwrap();
        h.chain.set_send_delay(None);
        outcome
    }

    #[tokio::test]
    async fn test_confirmed_withdrawal_resolves_and_logs() {
        let h = Harness::new().await;
        let outcome = ambiguous_withdrawal(&h).await;
        let hash = outcome.receipt().external_ref.clone().unwrap();
        h.chain.set_confirmation(&hash, Confirmation::Confirmed);

        let report = worker(&h, 3).scan_once().await.unwrap();
        assert_eq!(report.resolved, 1);

        assert_eq!(h.balance("ETH").await, Decimal::new(6, 1));
        let withdrawals: Vec<_> = h
            .audit
            .query_by_user(RecordKind::Withdrawal, &h.user)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0].external_ref.as_deref(), Some(hash.as_str()));
    }

    #[tokio::test]
    async fn test_reverted_withdrawal_refunds_once() {
        let h = Harness::new().await;
        let outcome = ambiguous_withdrawal(&h).await;
        let hash = outcome.receipt().external_ref.clone().unwrap();
        h.chain.set_confirmation(&hash, Confirmation::Reverted);

        let worker = worker(&h, 3);
        assert_eq!(worker.scan_once().await.unwrap().resolved, 1);
        assert_eq!(worker.scan_once().await.unwrap().scanned, 0);

        assert_eq!(h.balance("ETH").await, Decimal::ONE);
        assert_eq!(h.audit.len().await, 0);
        let item = h
            .queue
            .get(outcome.reconciliation_id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.status, ReconciliationStatus::Resolved);
    }

    #[tokio::test]
    async fn test_unknown_goes_to_manual_review_after_max_attempts() {
        let h = Harness::new().await;
        let outcome = ambiguous_withdrawal(&h).await;
        let hash = outcome.receipt().external_ref.clone().unwrap();
        h.chain.set_confirmation(&hash, Confirmation::Unknown);

        let worker = worker(&h, 2);
        let first = worker.scan_once().await.unwrap();
        assert_eq!((first.resolved, first.manual_review), (0, 0));
        let second = worker.scan_once().await.unwrap();
        assert_eq!(second.manual_review, 1);
        // Debit stays in place until an operator decides
        assert_eq!(h.balance("ETH").await, Decimal::new(6, 1));
    }

    #[tokio::test]
    async fn test_audit_lag_replayed() {
        let h = Harness::new().await;
        h.audit.fail_next_appends(1);
        h.coordinator
            .deposit_fiat(FiatDepositRequest {
                user: h.user.clone(),
                amount: Decimal::TEN,
                external_id: "pay-1".into(),
                payer: "card".into(),
            })
            .await
            .unwrap();
        assert_eq!(h.audit.len().await, 0);

        let report = worker(&h, 3).scan_once().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(h.audit.len().await, 1);
        assert_eq!(h.balance("USD").await, Decimal::TEN);
    }

    #[tokio::test]
    async fn test_failed_append_keeps_item_pending() {
        let h = Harness::new().await;
        h.audit.fail_next_appends(2);
        h.coordinator
            .deposit_fiat(FiatDepositRequest {
                user: h.user.clone(),
                amount: Decimal::TEN,
                external_id: "pay-1".into(),
                payer: "card".into(),
            })
            .await
            .unwrap();

        let worker = worker(&h, 3);
        assert_eq!(worker.scan_once().await.unwrap().resolved, 0);
        assert_eq!(worker.scan_once().await.unwrap().resolved, 1);
        assert_eq!(h.audit.len().await, 1);
    }

    #[tokio::test]
    async fn test_repair_driving_balance_negative_needs_operator() {
        let ledger = MemoryLedger::new();
        let queue = MemoryReconciliationQueue::new();
        let user = UserId::new("alice");
        let generated = wallet::generate();
        let mut scope = ledger.begin().await.unwrap();
        scope
            .insert_account(&crate::ledger::NewAccount {
                user: user.clone(),
                wallet: crate::ledger::WalletRecord {
                    address: generated.address,
                    signing_key: generated.signing_key,
                },
                assets: vec![AssetCode::new("USD")],
            })
            .await
            .unwrap();
        scope.commit().await.unwrap();

        let item = ReconciliationItem::new(
            crate::core_types::SagaKind::FiatWithdrawal,
            uuid::Uuid::new_v4(),
            user,
            AssetCode::new("USD"),
            Decimal::TEN,
            super::super::ReconciliationReason::LedgerCommitFailed,
        )
        .with_external_ref(Some("PAYOUT-1".into()))
        .with_ledger_repair(super::super::LedgerRepair {
            asset: AssetCode::new("USD"),
            delta: -Decimal::TEN,
            claim_ref: "PAYOUT-1".into(),
        });
        queue.enqueue(&item).await.unwrap();

        let worker = ReconciliationWorker::new(
            Arc::new(ledger.clone()),
            Arc::new(MemoryAuditLog::new()),
            Arc::new(MockChain::new()),
            Arc::new(queue.clone()),
            WorkerConfig::default(),
        );
        let report = worker.scan_once().await.unwrap();
        assert_eq!(report.manual_review, 1);
        assert!(!ledger.is_claimed("PAYOUT-1"));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = Harness::new().await;
        let worker = Arc::new(worker(&h, 3));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
