//! Shared fixture for saga unit tests

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use super::coordinator::SettlementCoordinator;
use super::types::{FiatDepositRequest, HotWallet, SagaPolicy};
use crate::audit::MemoryAuditLog;
use crate::core_types::{AssetCode, UserId};
use crate::gateway::{MockChain, MockPayout};
use crate::ledger::{LedgerStore, MemoryLedger};
use crate::reconciliation::MemoryReconciliationQueue;
use crate::wallet;

pub(crate) struct Harness {
    pub coordinator: SettlementCoordinator,
    pub ledger: MemoryLedger,
    pub audit: MemoryAuditLog,
    pub queue: MemoryReconciliationQueue,
    pub chain: Arc<MockChain>,
    pub payout: Arc<MockPayout>,
    pub user: UserId,
    pub deposit_address: String,
}

impl Harness {
    /// Fresh stores and one open account, `alice`
    pub async fn new() -> Self {
        let ledger = MemoryLedger::new();
        let audit = MemoryAuditLog::new();
        let queue = MemoryReconciliationQueue::new();
        let chain = Arc::new(MockChain::new());
        let payout = Arc::new(MockPayout::new());
        let hot = wallet::generate();

        let coordinator = SettlementCoordinator::new(
            Arc::new(ledger.clone()),
            Arc::new(audit.clone()),
            chain.clone(),
            payout.clone(),
            Arc::new(queue.clone()),
            SagaPolicy {
                external_timeout: Duration::from_millis(100),
                retry_backoff: Duration::from_millis(1),
                ..SagaPolicy::default()
            },
            HotWallet {
                address: hot.address,
                signing_key: hot.signing_key,
            },
        );

        let user = UserId::new("alice");
        let deposit_address = coordinator
            .open_account(&user)
            .await
            .expect("open test account");

        Self {
            coordinator,
            ledger,
            audit,
            queue,
            chain,
            payout,
            user,
            deposit_address,
        }
    }

    pub fn fiat_deposit(&self, external_id: &str, amount: Decimal) -> FiatDepositRequest {
        FiatDepositRequest {
            user: self.user.clone(),
            amount,
            external_id: external_id.to_string(),
            payer: "card".to_string(),
        }
    }

    /// Set a balance directly, bypassing sagas and the audit log
    pub async fn fund(&self, asset: &str, amount: Decimal) {
        let mut scope = self.ledger.begin().await.expect("begin");
        scope
            .write_balances(&self.user, &[(AssetCode::new(asset), amount)])
            .await
            .expect("write");
        scope.commit().await.expect("commit");
    }

    pub async fn balance(&self, asset: &str) -> Decimal {
        self.ledger
            .balances(&self.user)
            .await
            .expect("balances")
            .get(&AssetCode::new(asset))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}
