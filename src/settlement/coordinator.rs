//! Settlement Coordinator
//!
//! Owns the collaborators every saga needs and the plumbing the sagas share:
//! state tracking, detached execution, bounded external calls and
//! reconciliation hand-off. The sagas themselves live in `deposit`,
//! `withdraw` and `trade`.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};
use ulid::Ulid;

use rust_decimal::Decimal;

use super::error::SettlementError;
use super::state::SagaState;
use super::types::{HotWallet, SagaPolicy, SettlementOutcome, SettlementReceipt};
use crate::audit::AuditStore;
use crate::core_types::{AssetCode, ExternalRef, SagaKind, TxId, UserId};
use crate::gateway::{
    ChainClient, FeeQuote, GatewayError, PayoutClient, PayoutRequest, TransferRequest,
};
use crate::ledger::{LedgerError, LedgerScope, LedgerStore};
use crate::reconciliation::{ReconciliationItem, ReconciliationQueue, ReconciliationReason};

/// Per-saga state holder. Logs every transition.
pub(super) struct SagaTracker {
    pub tx_id: TxId,
    pub kind: SagaKind,
    pub user: UserId,
    state: SagaState,
    effect_sent: bool,
}

impl SagaTracker {
    pub fn new(kind: SagaKind, user: UserId) -> Self {
        let tx_id = uuid::Uuid::new_v4();
        debug!(tx_id = %tx_id, user = %user, kind = %kind, "Saga started");
        Self {
            tx_id,
            kind,
            user,
            state: SagaState::Started,
            effect_sent: false,
        }
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn advance(&mut self, next: SagaState) {
        // Once the external call went out, only a definite failure may roll back
        let rollback_after_send = next == SagaState::RolledBack
            && self.effect_sent
            && self.state != SagaState::ExternalFailed;
        if !self.state.can_transition_to(next) || rollback_after_send {
            error!(
                tx_id = %self.tx_id,
                kind = %self.kind,
                from = %self.state,
                to = %next,
                "Illegal saga transition"
            );
        }
        if next == SagaState::ExternalPending {
            self.effect_sent = true;
        }
        debug!(
            tx_id = %self.tx_id,
            user = %self.user,
            kind = %self.kind,
            from = %self.state,
            state = %next,
            "Saga transition"
        );
        self.state = next;
    }

    pub fn receipt(&self, asset: &AssetCode, amount: Decimal) -> SettlementReceipt {
        SettlementReceipt {
            tx_id: self.tx_id,
            kind: self.kind,
            user: self.user.clone(),
            asset: asset.clone(),
            amount,
            external_ref: None,
            balance_after: None,
            quote_balance_after: None,
        }
    }

    pub fn item(
        &self,
        asset: &AssetCode,
        amount: Decimal,
        reason: ReconciliationReason,
    ) -> ReconciliationItem {
        ReconciliationItem::new(
            self.kind,
            self.tx_id,
            self.user.clone(),
            asset.clone(),
            amount,
            reason,
        )
    }
}

struct Inner {
    ledger: Arc<dyn LedgerStore>,
    audit: Arc<dyn AuditStore>,
    chain: Arc<dyn ChainClient>,
    payout: Arc<dyn PayoutClient>,
    reconciliation: Arc<dyn ReconciliationQueue>,
    policy: SagaPolicy,
    hot_wallet: HotWallet,
    /// Held from nonce read to send, one per sending address
    sender_locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Entry point for every balance-changing operation.
///
/// Cheap to clone. Each saga runs on its own task, so a caller that goes
/// away mid-request never cancels a saga past its irreversible point.
#[derive(Clone)]
pub struct SettlementCoordinator {
    inner: Arc<Inner>,
}

impl SettlementCoordinator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        audit: Arc<dyn AuditStore>,
        chain: Arc<dyn ChainClient>,
        payout: Arc<dyn PayoutClient>,
        reconciliation: Arc<dyn ReconciliationQueue>,
        policy: SagaPolicy,
        hot_wallet: HotWallet,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                audit,
                chain,
                payout,
                reconciliation,
                policy,
                hot_wallet,
                sender_locks: DashMap::new(),
            }),
        }
    }

    pub fn policy(&self) -> &SagaPolicy {
        &self.inner.policy
    }

    pub fn hot_wallet(&self) -> &HotWallet {
        &self.inner.hot_wallet
    }

    pub(super) fn ledger(&self) -> &dyn LedgerStore {
        self.inner.ledger.as_ref()
    }

    pub(super) fn audit(&self) -> &dyn AuditStore {
        self.inner.audit.as_ref()
    }

    pub(super) fn chain(&self) -> &dyn ChainClient {
        self.inner.chain.as_ref()
    }

    /// Run a saga to completion on its own task
    pub(super) async fn detached<T, F>(&self, saga: F) -> Result<T, SettlementError>
    where
        F: Future<Output = Result<T, SettlementError>> + Send + 'static,
        T: Send + 'static,
    {
        match tokio::spawn(saga).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Saga task did not complete");
                Err(SettlementError::SagaInterrupted(e.to_string()))
            }
        }
    }

    // ------------------------------------------------------------------
    // External calls
    // ------------------------------------------------------------------

    /// Retry only failures that happened before the gateway accepted anything
    async fn with_pre_accept_retry<F, Fut>(
        &self,
        saga: &SagaTracker,
        mut call: F,
    ) -> Result<ExternalRef, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ExternalRef, GatewayError>>,
    {
        let policy = &self.inner.policy;
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_retryable() && attempt < policy.max_pre_accept_attempts => {
                    warn!(
                        tx_id = %saga.tx_id,
                        attempt,
                        error = %e,
                        "External call failed before acceptance, retrying"
                    );
                    tokio::time::sleep(policy.retry_backoff).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn lock_sender(&self, address: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .inner
            .sender_locks
            .entry(address.to_ascii_lowercase())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    async fn try_transfer(&self, request: &TransferRequest) -> Result<ExternalRef, GatewayError> {
        let timeout = self.inner.policy.external_timeout;
        let chain = self.chain();
        let _sender = self.lock_sender(&request.from).await;

        let prepared = match tokio::time::timeout(timeout, chain.prepare_transfer(request)).await {
            Ok(prepared) => prepared?,
            Err(_) => {
                return Err(GatewayError::Network(format!(
                    "preparing transfer timed out after {timeout:?}"
                )));
            }
        };

        match tokio::time::timeout(timeout, chain.send_prepared(&prepared)).await {
            Ok(Err(GatewayError::Ambiguous {
                reference: None,
                reason,
            })) => Err(GatewayError::Ambiguous {
                reference: Some(prepared.hash),
                reason,
            }),
            Ok(result) => result,
            Err(_) => Err(GatewayError::Ambiguous {
                reference: Some(prepared.hash),
                reason: format!("broadcast timed out after {timeout:?}"),
            }),
        }
    }

    pub(super) async fn transfer_onchain(
        &self,
        saga: &SagaTracker,
        request: &TransferRequest,
    ) -> Result<ExternalRef, GatewayError> {
        self.with_pre_accept_retry(saga, || self.try_transfer(request))
            .await
    }

    async fn try_payout(&self, request: &PayoutRequest) -> Result<ExternalRef, GatewayError> {
        let timeout = self.inner.policy.external_timeout;
        match tokio::time::timeout(timeout, self.inner.payout.payout(request)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Ambiguous {
                reference: Some(request.batch_id.clone()),
                reason: format!("payout timed out after {timeout:?}"),
            }),
        }
    }

    pub(super) async fn pay_out(
        &self,
        saga: &SagaTracker,
        request: &PayoutRequest,
    ) -> Result<ExternalRef, GatewayError> {
        self.with_pre_accept_retry(saga, || self.try_payout(request))
            .await
    }

    /// On-chain balance read, bounded like every other gateway call
    pub(super) async fn chain_balance(&self, address: &str) -> Result<Decimal, GatewayError> {
        let timeout = self.inner.policy.external_timeout;
        match tokio::time::timeout(timeout, self.chain().balance(address)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Network(format!(
                "balance lookup timed out after {timeout:?}"
            ))),
        }
    }

    /// Current fee quote. Falls back to the withdrawal gas price when the
    /// oracle does not answer in time.
    pub(super) async fn fee_quote(&self) -> FeeQuote {
        let policy = &self.inner.policy;
        match tokio::time::timeout(policy.external_timeout, self.chain().fee_quote()).await {
            Ok(quote) => quote,
            Err(_) => {
                warn!(
                    fallback_gwei = %policy.withdrawal_gas_price_gwei,
                    "Fee quote timed out, using fallback"
                );
                FeeQuote {
                    gas_price_gwei: policy.withdrawal_gas_price_gwei,
                    gas_limit: policy.gas_limit,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Ledger helpers
    // ------------------------------------------------------------------

    /// Roll back the scope and end the saga as `RolledBack`
    pub(super) async fn roll_back(
        &self,
        saga: &mut SagaTracker,
        scope: &mut LedgerScope,
        cause: &str,
    ) {
        if let Err(e) = scope.rollback().await {
            error!(tx_id = %saga.tx_id, error = %e, "Ledger rollback failed");
        }
        saga.advance(SagaState::RolledBack);
        warn!(
            tx_id = %saga.tx_id,
            user = %saga.user,
            kind = %saga.kind,
            cause,
            "Saga rolled back"
        );
    }

    /// Pass `result` through, rolling back first when it is an error
    pub(super) async fn or_roll_back<T>(
        &self,
        saga: &mut SagaTracker,
        scope: &mut LedgerScope,
        cause: &str,
        result: Result<T, LedgerError>,
    ) -> Result<T, SettlementError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.roll_back(saga, scope, cause).await;
                Err(e.into())
            }
        }
    }

    /// Locking read, funds check, debit. Rolls back on any failure.
    pub(super) async fn debit(
        &self,
        saga: &mut SagaTracker,
        scope: &mut LedgerScope,
        asset: &AssetCode,
        amount: Decimal,
    ) -> Result<Decimal, SettlementError> {
        let user = saga.user.clone();
        let snapshot = scope.lock_account(&user).await;
        let snapshot = self.or_roll_back(saga, scope, "balance read failed", snapshot).await?;

        let available = snapshot.balance(asset);
        if amount > available {
            self.reject_insufficient(saga, scope, asset, amount, available)
                .await;
            return Err(SettlementError::InsufficientFunds {
                asset: asset.clone(),
                requested: amount,
                available,
            });
        }

        let after = available - amount;
        let written = scope.write_balances(&user, &[(asset.clone(), after)]).await;
        self.or_roll_back(saga, scope, "balance write failed", written)
            .await?;
        Ok(after)
    }

    pub(super) async fn reject_insufficient(
        &self,
        saga: &mut SagaTracker,
        scope: &mut LedgerScope,
        asset: &AssetCode,
        requested: Decimal,
        available: Decimal,
    ) {
        if let Err(e) = scope.rollback().await {
            error!(tx_id = %saga.tx_id, error = %e, "Ledger rollback failed");
        }
        saga.advance(SagaState::RejectedInsufficientFunds);
        warn!(
            tx_id = %saga.tx_id,
            user = %saga.user,
            kind = %saga.kind,
            asset = %asset,
            requested = %requested,
            available = %available,
            "Insufficient funds"
        );
    }

    // ------------------------------------------------------------------
    // Reconciliation hand-off
    // ------------------------------------------------------------------

    /// Enqueue an item. If the queue itself is down, the item is written to
    /// the error log in full so it can be replayed by hand.
    pub(super) async fn flag(&self, saga: &SagaTracker, item: ReconciliationItem) -> Ulid {
        let id = item.id;
        if let Err(e) = self.inner.reconciliation.enqueue(&item).await {
            let payload = serde_json::to_string(&item).unwrap_or_else(|_| format!("{item:?}"));
            error!(
                tx_id = %saga.tx_id,
                state = %saga.state(),
                reconciliation_id = %id,
                error = %e,
                item = %payload,
                "Reconciliation enqueue failed"
            );
        }
        id
    }

    /// End the saga in `ReconciliationNeeded`
    pub(super) async fn escalate(
        &self,
        saga: &mut SagaTracker,
        item: ReconciliationItem,
        receipt: SettlementReceipt,
    ) -> SettlementOutcome {
        saga.advance(SagaState::ReconciliationNeeded);
        let reason = item.reason;
        let status = item.status;
        let reconciliation_id = self.flag(saga, item).await;
        error!(
            tx_id = %saga.tx_id,
            user = %saga.user,
            kind = %saga.kind,
            reconciliation_id = %reconciliation_id,
            reason = %reason,
            status = %status,
            external_ref = ?receipt.external_ref,
            "Saga needs reconciliation"
        );
        SettlementOutcome::ReconciliationNeeded {
            receipt,
            reconciliation_id,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::gateway::{MockChain, MockPayout};
    use crate::ledger::MemoryLedger;
    use crate::reconciliation::MemoryReconciliationQueue;
    use crate::wallet;
    use std::time::Duration;

    fn coordinator(chain: Arc<MockChain>, payout: Arc<MockPayout>) -> SettlementCoordinator {
        let hot = wallet::generate();
        SettlementCoordinator::new(
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryAuditLog::new()),
            chain,
            payout,
            Arc::new(MemoryReconciliationQueue::new()),
            SagaPolicy {
                external_timeout: Duration::from_millis(100),
                retry_backoff: Duration::from_millis(1),
                ..SagaPolicy::default()
            },
            HotWallet {
                address: hot.address,
                signing_key: hot.signing_key,
            },
        )
    }

    fn transfer() -> TransferRequest {
        let from = wallet::generate();
        TransferRequest {
            from: from.address,
            to: wallet::generate().address,
            amount: Decimal::ONE,
            gas_price_gwei: Decimal::new(30, 0),
            signing_key: from.signing_key,
        }
    }

    #[test]
    fn test_tracker_follows_legal_path() {
        let mut saga = SagaTracker::new(SagaKind::CryptoWithdrawal, UserId::new("alice"));
        for next in [
            SagaState::Validated,
            SagaState::LedgerPending,
            SagaState::ExternalPending,
            SagaState::ExternalFailed,
            SagaState::RolledBack,
        ] {
            saga.advance(next);
        }
        assert_eq!(saga.state(), SagaState::RolledBack);
        assert!(saga.state().is_terminal());
    }

    #[tokio::test]
    async fn test_network_errors_retried_up_to_limit() {
        let chain = Arc::new(MockChain::new());
        for _ in 0..3 {
            chain.push_send_result(Err(GatewayError::Network("refused".into())));
        }
        let coordinator = coordinator(chain.clone(), Arc::new(MockPayout::new()));
        let saga = SagaTracker::new(SagaKind::CryptoWithdrawal, UserId::new("alice"));

        let err = coordinator
            .transfer_onchain(&saga, &transfer())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(chain.send_attempts(), 3);
    }

    #[tokio::test]
    async fn test_ambiguous_never_retried() {
        let chain = Arc::new(MockChain::new());
        chain.push_send_result(Err(GatewayError::Ambiguous {
            reference: None,
            reason: "connection reset".into(),
        }));
        let coordinator = coordinator(chain.clone(), Arc::new(MockPayout::new()));
        let saga = SagaTracker::new(SagaKind::CryptoWithdrawal, UserId::new("alice"));

        let err = coordinator
            .transfer_onchain(&saga, &transfer())
            .await
            .unwrap_err();
        assert!(err.possibly_accepted());
        // The prepared hash fills in the missing reference
        assert!(err.reference().is_some_and(|r| r.starts_with("0x")));
        assert_eq!(chain.send_attempts(), 1);
    }

    #[tokio::test]
    async fn test_send_timeout_is_ambiguous() {
        let chain = Arc::new(MockChain::new());
        chain.set_send_delay(Some(Duration::from_secs(5)));
        let coordinator = coordinator(chain.clone(), Arc::new(MockPayout::new()));
        let saga = SagaTracker::new(SagaKind::CryptoWithdrawal, UserId::new("alice"));

        let err = coordinator
            .transfer_onchain(&saga, &transfer())
            .await
            .unwrap_err();
        assert!(err.possibly_accepted());
        assert_eq!(chain.send_attempts(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_sender_transfers_get_distinct_nonces() {
        let chain = Arc::new(MockChain::new());
        chain.set_send_delay(Some(Duration::from_millis(10)));
        let coordinator = coordinator(chain.clone(), Arc::new(MockPayout::new()));
        let request = transfer();

        let sends = (0..4).map(|_| {
            let coordinator = coordinator.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let saga = SagaTracker::new(SagaKind::CryptoWithdrawal, UserId::new("alice"));
                coordinator.transfer_onchain(&saga, &request).await
            })
        });
        for result in futures::future::join_all(sends).await {
            assert!(result.unwrap().is_ok());
        }

        let mut nonces: Vec<u64> = chain.sent().iter().map(|t| t.nonce).collect();
        nonces.sort_unstable();
        assert_eq!(nonces, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_payout_timeout_keeps_batch_reference() {
        let payout = Arc::new(MockPayout::new());
        payout.set_delay(Some(Duration::from_secs(5)));
        let coordinator = coordinator(Arc::new(MockChain::new()), payout.clone());
        let saga = SagaTracker::new(SagaKind::FiatWithdrawal, UserId::new("alice"));

        let err = coordinator
            .pay_out(
                &saga,
                &PayoutRequest {
                    batch_id: "batch-7".into(),
                    amount: Decimal::TEN,
                    recipient: "bob@example.com".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.reference(), Some("batch-7"));
        assert_eq!(payout.attempts(), 1);
    }

    #[tokio::test]
    async fn test_detached_task_panic_is_interrupted() {
        let coordinator = coordinator(Arc::new(MockChain::new()), Arc::new(MockPayout::new()));
        let blow_up = true;
        let result: Result<(), SettlementError> = coordinator
            .detached(async move {
                if blow_up {
                    panic!("saga blew up");
                }
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, SettlementError::SagaInterrupted(_)));
        assert!(!err.nothing_happened());
    }
}
