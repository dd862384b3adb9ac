//! Ledger Store
//!
//! Relational store of per-user balances with scoped transactions.
//!
//! Every financial decision inside a saga is made against a
//! [`LedgerScope`]: `begin()` hands out an exclusive scope, reads inside it
//! are locking reads, and the scope is terminated exactly once by
//! `commit()` or `rollback()`. Pool-level reads on [`LedgerStore`] are for
//! display only.

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

use crate::core_types::{AssetCode, UserId};
use crate::wallet::SigningKey;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    /// Pool exhausted or closed. Retryable by the caller.
    #[error("Ledger resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Scope used after commit/rollback. Programming error.
    #[error("Invalid scope state: {0}")]
    InvalidScopeState(&'static str),

    #[error("Account not found: {0}")]
    AccountNotFound(UserId),

    #[error("Account already exists: {0}")]
    AccountExists(UserId),

    #[error("External reference already claimed: {0}")]
    RefAlreadyClaimed(String),

    #[error("Balance would go negative: user={user} asset={asset}")]
    NegativeBalance { user: UserId, asset: AssetCode },

    #[error("Ledger backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                LedgerError::ResourceUnavailable(e.to_string())
            }
            other => LedgerError::Backend(other.to_string()),
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

/// Balances of one account as read under its row lock
#[derive(Debug, Clone, PartialEq)]
pub struct AccountSnapshot {
    pub user: UserId,
    pub balances: BTreeMap<AssetCode, Decimal>,
}

impl AccountSnapshot {
    /// Missing balance rows read as zero
    pub fn balance(&self, asset: &AssetCode) -> Decimal {
        self.balances.get(asset).copied().unwrap_or(Decimal::ZERO)
    }
}

/// Wallet columns of the account row
#[derive(Debug, Clone)]
pub struct WalletRecord {
    pub address: String,
    pub signing_key: SigningKey,
}

/// Account row to insert at opening time
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user: UserId,
    pub wallet: WalletRecord,
    /// Assets that get an explicit zero balance row
    pub assets: Vec<AssetCode>,
}

/// One saved address in a user's favourites list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavouriteEntry {
    pub tag: String,
    pub address: String,
    #[serde(default)]
    pub notes: Option<String>,
}

// ============================================================================
// Store + scope backend traits
// ============================================================================

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open an exclusive transaction scope.
    ///
    /// Fails with `ResourceUnavailable` when admission control refuses a new
    /// scope, never by blocking indefinitely.
    async fn begin(&self) -> Result<LedgerScope, LedgerError>;

    /// Pool-level read of the account's wallet
    async fn wallet(&self, user: &UserId) -> Result<WalletRecord, LedgerError>;

    /// Pool-level read of all balances. Display only.
    async fn balances(&self, user: &UserId) -> Result<BTreeMap<AssetCode, Decimal>, LedgerError>;

    /// Pool-level read of the favourites list, in insertion order
    async fn favourites(&self, user: &UserId) -> Result<Vec<FavouriteEntry>, LedgerError>;
}

/// Backend half of a scope. Implemented once per store.
#[async_trait]
pub trait ScopeBackend: Send {
    /// Locking read of every balance row of `user`
    async fn lock_account(&mut self, user: &UserId) -> Result<AccountSnapshot, LedgerError>;

    /// Upsert the given balances in one statement. Negative values are refused.
    async fn write_balances(
        &mut self,
        user: &UserId,
        balances: &[(AssetCode, Decimal)],
    ) -> Result<(), LedgerError>;

    /// Claim an external reference. `Ok(false)` when already claimed.
    async fn claim_external_ref(
        &mut self,
        external_ref: &str,
        user: &UserId,
        kind: &str,
    ) -> Result<bool, LedgerError>;

    async fn insert_account(&mut self, account: &NewAccount) -> Result<(), LedgerError>;

    /// Delete-all then insert-all for one user
    async fn replace_favourites(
        &mut self,
        user: &UserId,
        entries: &[FavouriteEntry],
    ) -> Result<(), LedgerError>;

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError>;
}

// ============================================================================
// LedgerScope
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Open,
    Committed,
    RolledBack,
}

impl ScopeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeState::Open => "OPEN",
            ScopeState::Committed => "COMMITTED",
            ScopeState::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One relational transaction, exclusively owned by the saga that opened it.
///
/// Lifecycle: `begin → {read, mutate}* → commit | rollback`, terminated
/// exactly once. Any use after termination returns `InvalidScopeState`.
/// Dropping an open scope rolls it back.
pub struct LedgerScope {
    state: ScopeState,
    backend: Option<Box<dyn ScopeBackend>>,
}

impl LedgerScope {
    pub fn new(backend: Box<dyn ScopeBackend>) -> Self {
        Self {
            state: ScopeState::Open,
            backend: Some(backend),
        }
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    fn open_backend(&mut self) -> Result<&mut Box<dyn ScopeBackend>, LedgerError> {
        match self.backend.as_mut() {
            Some(backend) if self.state == ScopeState::Open => Ok(backend),
            _ => Err(LedgerError::InvalidScopeState("scope already terminated")),
        }
    }

    pub async fn lock_account(&mut self, user: &UserId) -> Result<AccountSnapshot, LedgerError> {
        self.open_backend()?.lock_account(user).await
    }

    pub async fn write_balances(
        &mut self,
        user: &UserId,
        balances: &[(AssetCode, Decimal)],
    ) -> Result<(), LedgerError> {
        if let Some((asset, _)) = balances.iter().find(|(_, amount)| *amount < Decimal::ZERO) {
            return Err(LedgerError::NegativeBalance {
                user: user.clone(),
                asset: asset.clone(),
            });
        }
        self.open_backend()?.write_balances(user, balances).await
    }

    /// Lock, add `delta` to one balance, write it back. Returns the new balance.
    pub async fn apply_delta(
        &mut self,
        user: &UserId,
        asset: &AssetCode,
        delta: Decimal,
    ) -> Result<Decimal, LedgerError> {
        let snapshot = self.lock_account(user).await?;
        let updated = snapshot.balance(asset) + delta;
        self.write_balances(user, &[(asset.clone(), updated)]).await?;
        Ok(updated)
    }

    pub async fn claim_external_ref(
        &mut self,
        external_ref: &str,
        user: &UserId,
        kind: &str,
    ) -> Result<bool, LedgerError> {
        self.open_backend()?
            .claim_external_ref(external_ref, user, kind)
            .await
    }

    pub async fn insert_account(&mut self, account: &NewAccount) -> Result<(), LedgerError> {
        self.open_backend()?.insert_account(account).await
    }

    pub async fn replace_favourites(
        &mut self,
        user: &UserId,
        entries: &[FavouriteEntry],
    ) -> Result<(), LedgerError> {
        self.open_backend()?.replace_favourites(user, entries).await
    }

    /// Commit. A failed commit still terminates the scope.
    pub async fn commit(&mut self) -> Result<(), LedgerError> {
        let backend = self.take_backend("commit on terminated scope")?;
        match backend.commit().await {
            Ok(()) => {
                self.state = ScopeState::Committed;
                Ok(())
            }
            Err(e) => {
                self.state = ScopeState::RolledBack;
                Err(e)
            }
        }
    }

    pub async fn rollback(&mut self) -> Result<(), LedgerError> {
        let backend = self.take_backend("rollback on terminated scope")?;
        self.state = ScopeState::RolledBack;
        backend.rollback().await
    }

    fn take_backend(&mut self, what: &'static str) -> Result<Box<dyn ScopeBackend>, LedgerError> {
        if self.state != ScopeState::Open {
            return Err(LedgerError::InvalidScopeState(what));
        }
        self.backend
            .take()
            .ok_or(LedgerError::InvalidScopeState(what))
    }
}

/// Apply one balance change under its own scope, guarded by a claim on
/// `claim_ref` so a second application fails with `RefAlreadyClaimed`.
pub async fn apply_claimed_delta(
    ledger: &dyn LedgerStore,
    user: &UserId,
    asset: &AssetCode,
    delta: Decimal,
    claim_ref: &str,
    kind: &str,
) -> Result<Decimal, LedgerError> {
    let mut scope = ledger.begin().await?;
    let result = async {
        scope.lock_account(user).await?;
        if !scope.claim_external_ref(claim_ref, user, kind).await? {
            return Err(LedgerError::RefAlreadyClaimed(claim_ref.to_string()));
        }
        let updated = scope.apply_delta(user, asset, delta).await?;
        scope.commit().await?;
        Ok(updated)
    }
    .await;

    if result.is_err() && scope.state() == ScopeState::Open {
        if let Err(e) = scope.rollback().await {
            warn!(user = %user, error = %e, "Rollback after failed delta also failed");
        }
    }
    result
}

impl Drop for LedgerScope {
    fn drop(&mut self) {
        if self.backend.is_some() {
            warn!("Ledger scope dropped while open, backend rolls back implicitly");
        }
    }
}

impl fmt::Debug for LedgerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerScope")
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_missing_asset_is_zero() {
        let snapshot = AccountSnapshot {
            user: UserId::new("alice"),
            balances: BTreeMap::from([(AssetCode::new("USD"), Decimal::new(1050, 2))]),
        };
        assert_eq!(snapshot.balance(&AssetCode::new("USD")), Decimal::new(1050, 2));
        assert_eq!(snapshot.balance(&AssetCode::new("ETH")), Decimal::ZERO);
    }

    #[test]
    fn test_sqlx_pool_errors_map_to_resource_unavailable() {
        assert!(matches!(
            LedgerError::from(sqlx::Error::PoolTimedOut),
            LedgerError::ResourceUnavailable(_)
        ));
        assert!(matches!(
            LedgerError::from(sqlx::Error::RowNotFound),
            LedgerError::Backend(_)
        ));
    }

    #[tokio::test]
    async fn test_scope_terminates_exactly_once() {
        let ledger = MemoryLedger::new();
        let mut scope = ledger.begin().await.unwrap();
        assert_eq!(scope.state(), ScopeState::Open);

        scope.commit().await.unwrap();
        assert_eq!(scope.state(), ScopeState::Committed);

        assert!(matches!(
            scope.commit().await,
            Err(LedgerError::InvalidScopeState(_))
        ));
        assert!(matches!(
            scope.rollback().await,
            Err(LedgerError::InvalidScopeState(_))
        ));
        assert!(matches!(
            scope.lock_account(&UserId::new("alice")).await,
            Err(LedgerError::InvalidScopeState(_))
        ));
    }

    #[tokio::test]
    async fn test_claimed_delta_applies_once() {
        let ledger = MemoryLedger::new();
        let user = UserId::new("alice");
        let usd = AssetCode::new("USD");
        let mut scope = ledger.begin().await.unwrap();
        scope
            .insert_account(&NewAccount {
                user: user.clone(),
                wallet: WalletRecord {
                    address: crate::wallet::generate().address,
                    signing_key: crate::wallet::generate().signing_key,
                },
                assets: vec![usd.clone()],
            })
            .await
            .unwrap();
        scope.commit().await.unwrap();

        let after = apply_claimed_delta(&ledger, &user, &usd, Decimal::TEN, "ref-1", "fiat_deposit")
            .await
            .unwrap();
        assert_eq!(after, Decimal::TEN);

        let again =
            apply_claimed_delta(&ledger, &user, &usd, Decimal::TEN, "ref-1", "fiat_deposit").await;
        assert_eq!(again, Err(LedgerError::RefAlreadyClaimed("ref-1".into())));

        let negative =
            apply_claimed_delta(&ledger, &user, &usd, Decimal::new(-20, 0), "ref-2", "fiat_withdrawal")
                .await;
        assert!(matches!(negative, Err(LedgerError::NegativeBalance { .. })));
        assert!(!ledger.is_claimed("ref-2"));
        assert_eq!(ledger.balances(&user).await.unwrap()[&usd], Decimal::TEN);
    }

    #[tokio::test]
    async fn test_negative_write_refused_before_backend() {
        let ledger = MemoryLedger::new();
        let mut scope = ledger.begin().await.unwrap();
        let err = scope
            .write_balances(
                &UserId::new("alice"),
                &[(AssetCode::new("USD"), Decimal::new(-1, 0))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NegativeBalance { .. }));
        scope.rollback().await.unwrap();
    }
}
