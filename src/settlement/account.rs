//! Account operations: opening, deposit address, balances, history and
//! favourite addresses. None of these move funds.

use futures::TryStreamExt;
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::coordinator::SettlementCoordinator;
use super::error::{SettlementError, ValidationError};
use super::types::{AccountHistory, FavouriteView};
use super::validate;
use crate::audit::{RecordKind, SettlementRecord};
use crate::core_types::{AssetCode, UserId};
use crate::ledger::{FavouriteEntry, NewAccount, WalletRecord};
use crate::wallet;

impl SettlementCoordinator {
    /// Create the account with a fresh deposit wallet and zero balances.
    /// Returns the deposit address.
    pub async fn open_account(&self, user: &UserId) -> Result<String, SettlementError> {
        validate::user(user)?;
        let generated = wallet::generate();
        let account = NewAccount {
            user: user.clone(),
            wallet: WalletRecord {
                address: generated.address.clone(),
                signing_key: generated.signing_key,
            },
            assets: vec![
                self.policy().fiat_asset.clone(),
                self.policy().native_asset.clone(),
            ],
        };

        let mut scope = self.ledger().begin().await?;
        if let Err(e) = scope.insert_account(&account).await {
            if let Err(rollback_err) = scope.rollback().await {
                warn!(user = %user, error = %rollback_err, "Rollback after failed open");
            }
            return Err(e.into());
        }
        scope.commit().await?;

        info!(user = %user, address = %generated.address, "Account opened");
        Ok(generated.address)
    }

    pub async fn deposit_address(&self, user: &UserId) -> Result<String, SettlementError> {
        validate::user(user)?;
        Ok(self.ledger().wallet(user).await?.address)
    }

    /// Display read, not a locking read
    pub async fn balances(
        &self,
        user: &UserId,
    ) -> Result<BTreeMap<AssetCode, Decimal>, SettlementError> {
        validate::user(user)?;
        Ok(self.ledger().balances(user).await?)
    }

    /// Deposits, withdrawals and trades, each newest first
    pub async fn history(&self, user: &UserId) -> Result<AccountHistory, SettlementError> {
        validate::user(user)?;
        let audit = self.audit();
        let (deposits, withdrawals, trades) = tokio::try_join!(
            audit
                .query_by_user(RecordKind::Deposit, user)
                .try_collect::<Vec<SettlementRecord>>(),
            audit
                .query_by_user(RecordKind::Withdrawal, user)
                .try_collect::<Vec<SettlementRecord>>(),
            audit
                .query_by_user(RecordKind::Trade, user)
                .try_collect::<Vec<SettlementRecord>>(),
        )?;
        Ok(AccountHistory {
            deposits,
            withdrawals,
            trades,
        })
    }

    /// Favourite addresses with their current on-chain balance. A failed
    /// lookup leaves that balance empty instead of failing the list.
    pub async fn favourites(&self, user: &UserId) -> Result<Vec<FavouriteView>, SettlementError> {
        validate::user(user)?;
        let entries = self.ledger().favourites(user).await?;
        let balances = join_all(entries.iter().map(|entry| async move {
            match self.chain_balance(&entry.address).await {
                Ok(balance) => Some(balance),
                Err(e) => {
                    warn!(address = %entry.address, error = %e, "Favourite balance lookup failed");
                    None
                }
            }
        }))
        .await;

        Ok(entries
            .into_iter()
            .zip(balances)
            .map(|(entry, balance)| FavouriteView { entry, balance })
            .collect())
    }

    /// Replace the whole favourites list in one scope
    pub async fn replace_favourites(
        &self,
        user: &UserId,
        entries: Vec<FavouriteEntry>,
    ) -> Result<(), SettlementError> {
        validate::user(user)?;
        for entry in &entries {
            if entry.tag.trim().is_empty() {
                return Err(ValidationError::BlankTag.into());
            }
            validate::address(&entry.address)?;
        }

        let mut scope = self.ledger().begin().await?;
        if let Err(e) = scope.replace_favourites(user, &entries).await {
            if let Err(rollback_err) = scope.rollback().await {
                warn!(user = %user, error = %rollback_err, "Rollback after failed favourites update");
            }
            return Err(e.into());
        }
        scope.commit().await?;
        info!(user = %user, count = entries.len(), "Favourites replaced");
        Ok(())
    }
}
