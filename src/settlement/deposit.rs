//! Deposit sagas
//!
//! Fiat: claim the payment reference and credit in one scope, then log.
//! Crypto: sweep the deposit address into the hot wallet first, then credit
//! the net amount under a claim on the sweep hash.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::coordinator::{SagaTracker, SettlementCoordinator};
use super::error::{SettlementError, ValidationError};
use super::state::SagaState;
use super::types::{
    CryptoDepositRequest, FiatDepositRequest, SettlementOutcome, SettlementReceipt,
};
use super::validate;
use crate::audit::{Counterparty, RecordDetail, RecordKind, SettlementRecord};
use crate::core_types::SagaKind;
use crate::gateway::TransferRequest;
use crate::ledger::apply_claimed_delta;
use crate::reconciliation::{LedgerRepair, ReconciliationReason};

impl SettlementCoordinator {
    /// Credit an off-system fiat payment. A repeated `external_id` is
    /// rejected with `DuplicateExternalRef` and changes nothing.
    pub async fn deposit_fiat(
        &self,
        request: FiatDepositRequest,
    ) -> Result<SettlementOutcome, SettlementError> {
        let this = self.clone();
        self.detached(async move { this.run_fiat_deposit(request).await })
            .await
    }

    /// Sweep the user's deposit address and credit the amount net of gas
    pub async fn deposit_crypto(
        &self,
        request: CryptoDepositRequest,
    ) -> Result<SettlementOutcome, SettlementError> {
        let this = self.clone();
        self.detached(async move { this.run_crypto_deposit(request).await })
            .await
    }

    async fn run_fiat_deposit(
        &self,
        request: FiatDepositRequest,
    ) -> Result<SettlementOutcome, SettlementError> {
        let mut saga = SagaTracker::new(SagaKind::FiatDeposit, request.user.clone());
        let asset = self.policy().fiat_asset.clone();
        validate::user(&request.user)?;
        validate::amount(request.amount, self.policy().fiat_scale)?;
        validate::external_ref(&request.external_id)?;
        saga.advance(SagaState::Validated);

        let mut scope = self.ledger().begin().await?;
        saga.advance(SagaState::LedgerPending);

        let snapshot = scope.lock_account(&request.user).await;
        let snapshot = self
            .or_roll_back(&mut saga, &mut scope, "account lock failed", snapshot)
            .await?;

        let claimed = scope
            .claim_external_ref(&request.external_id, &request.user, saga.kind.as_str())
            .await;
        let claimed = self
            .or_roll_back(&mut saga, &mut scope, "claim failed", claimed)
            .await?;
        if !claimed {
            self.roll_back(&mut saga, &mut scope, "duplicate deposit reference")
                .await;
            return Err(SettlementError::DuplicateExternalRef(request.external_id));
        }

        let after = snapshot.balance(&asset) + request.amount;
        let written = scope
            .write_balances(&request.user, &[(asset.clone(), after)])
            .await;
        self.or_roll_back(&mut saga, &mut scope, "balance write failed", written)
            .await?;

        if let Err(e) = scope.commit().await {
            saga.advance(SagaState::RolledBack);
            warn!(tx_id = %saga.tx_id, error = %e, "Deposit commit failed");
            return Err(e.into());
        }
        saga.advance(SagaState::Committed);

        let mut receipt = saga.receipt(&asset, request.amount);
        receipt.external_ref = Some(request.external_id.clone());
        receipt.balance_after = Some(after);

        let record = SettlementRecord {
            kind: RecordKind::Deposit,
            user: request.user.clone(),
            counterparty: Counterparty::Payer {
                source: request.payer,
            },
            asset: asset.clone(),
            amount: request.amount,
            external_ref: Some(request.external_id),
            tx_id: saga.tx_id,
            balance_after: Some(after),
            time: Utc::now(),
            detail: RecordDetail::Fiat,
        };
        self.log_deposit(&saga, record, receipt).await
    }

    async fn run_crypto_deposit(
        &self,
        request: CryptoDepositRequest,
    ) -> Result<SettlementOutcome, SettlementError> {
        let mut saga = SagaTracker::new(SagaKind::CryptoDeposit, request.user.clone());
        let asset = self.policy().native_asset.clone();
        validate::user(&request.user)?;

        let wallet = self.ledger().wallet(&request.user).await?;
        let gross = self
            .chain_balance(&wallet.address)
            .await
            .map_err(SettlementError::ExternalEffectFailed)?;
        let quote = self.fee_quote().await;
        let fee = quote.fee();
        let net = gross - fee;
        if net <= Decimal::ZERO {
            return Err(ValidationError::NothingToSweep { gross, fee }.into());
        }
        saga.advance(SagaState::Validated);

        let tx_id = saga.tx_id;
        let mut receipt = saga.receipt(&asset, net);
        let record_for = |external_ref: Option<String>, balance_after: Option<Decimal>| {
            SettlementRecord {
                kind: RecordKind::Deposit,
                user: request.user.clone(),
                counterparty: Counterparty::Payer {
                    source: wallet.address.clone(),
                },
                asset: asset.clone(),
                amount: net,
                external_ref,
                tx_id,
                balance_after,
                time: Utc::now(),
                detail: RecordDetail::Crypto {
                    gross: Some(gross),
                    fee,
                    gas_price_gwei: quote.gas_price_gwei,
                },
            }
        };

        saga.advance(SagaState::ExternalPending);
        let sweep = TransferRequest {
            from: wallet.address.clone(),
            to: self.hot_wallet().address.clone(),
            amount: net,
            gas_price_gwei: quote.gas_price_gwei,
            signing_key: wallet.signing_key.clone(),
        };
        let hash = match self.transfer_onchain(&saga, &sweep).await {
            Ok(hash) => {
                saga.advance(SagaState::ExternalDone);
                hash
            }
            Err(e) if !e.possibly_accepted() => {
                saga.advance(SagaState::ExternalFailed);
                saga.advance(SagaState::RolledBack);
                warn!(tx_id = %saga.tx_id, user = %saga.user, error = %e, "Deposit sweep failed");
                return Err(SettlementError::ExternalEffectFailed(e));
            }
            Err(e) => {
                let reference = e.reference().map(str::to_string);
                receipt.external_ref = reference.clone();
                let claim_ref = reference
                    .clone()
                    .unwrap_or_else(|| format!("sweep:{}", saga.tx_id));
                let mut item = saga
                    .item(&asset, net, ReconciliationReason::AmbiguousExternalEffect)
                    .with_external_ref(reference.clone())
                    .awaiting_confirmation(reference.is_some())
                    .with_ledger_repair(LedgerRepair {
                        asset: asset.clone(),
                        delta: net,
                        claim_ref,
                    })
                    .with_pending_record(record_for(reference.clone(), None))
                    .with_error(&e);
                if reference.is_none() {
                    item = item.manual_review();
                }
                return Ok(self.escalate(&mut saga, item, receipt).await);
            }
        };
        receipt.external_ref = Some(hash.clone());

        saga.advance(SagaState::LedgerPending);
        let credited = apply_claimed_delta(
            self.ledger(),
            &request.user,
            &asset,
            net,
            &hash,
            saga.kind.as_str(),
        )
        .await;

        match credited {
            Ok(after) => {
                saga.advance(SagaState::Committed);
                receipt.balance_after = Some(after);
                let record = record_for(Some(hash), Some(after));
                self.log_deposit(&saga, record, receipt).await
            }
            Err(e) => {
                let item = saga
                    .item(&asset, net, ReconciliationReason::LedgerCommitFailed)
                    .with_external_ref(Some(hash.clone()))
                    .with_ledger_repair(LedgerRepair {
                        asset: asset.clone(),
                        delta: net,
                        claim_ref: hash.clone(),
                    })
                    .with_pending_record(record_for(Some(hash), None))
                    .with_error(&e);
                Ok(self.escalate(&mut saga, item, receipt).await)
            }
        }
    }

    /// Append the record of a committed deposit. A failed append leaves the
    /// deposit settled and queues the record.
    async fn log_deposit(
        &self,
        saga: &SagaTracker,
        record: SettlementRecord,
        receipt: SettlementReceipt,
    ) -> Result<SettlementOutcome, SettlementError> {
        match self.audit().append(&record).await {
            Ok(_) => {
                info!(
                    tx_id = %saga.tx_id,
                    user = %saga.user,
                    kind = %saga.kind,
                    asset = %receipt.asset,
                    amount = %receipt.amount,
                    external_ref = ?receipt.external_ref,
                    "Deposit settled"
                );
                Ok(SettlementOutcome::Settled(receipt))
            }
            Err(e) => {
                let item = saga
                    .item(&record.asset, record.amount, ReconciliationReason::AuditLag)
                    .with_external_ref(record.external_ref.clone())
                    .with_pending_record(record)
                    .with_error(&e);
                let reconciliation_id = self.flag(saga, item).await;
                warn!(
                    tx_id = %saga.tx_id,
                    reconciliation_id = %reconciliation_id,
                    error = %e,
                    "Deposit committed, audit write queued"
                );
                Ok(SettlementOutcome::AuditLagging {
                    receipt,
                    reconciliation_id,
                })
            }
        }
    }
}
