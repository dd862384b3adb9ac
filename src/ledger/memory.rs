//! In-memory ledger
//!
//! Same contract as [`super::PgLedger`]: per-account exclusive locks play
//! the part of `SELECT ... FOR UPDATE`, writes are staged in the scope and
//! applied on commit, and a bounded semaphore stands in for the connection
//! pool. Used by tests and the `mock-api` wiring.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use super::{
    AccountSnapshot, FavouriteEntry, LedgerError, LedgerScope, LedgerStore, NewAccount,
    ScopeBackend, WalletRecord,
};
use crate::core_types::{AssetCode, UserId};

const DEFAULT_MAX_SCOPES: usize = 50;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct AccountRow {
    wallet: WalletRecord,
    balances: BTreeMap<AssetCode, Decimal>,
    favourites: Vec<FavouriteEntry>,
}

struct Inner {
    accounts: DashMap<UserId, AccountRow>,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
    claimed: DashSet<String>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    failing_commits: AtomicUsize,
}

impl Inner {
    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Clone)]
pub struct MemoryLedger {
    inner: Arc<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_SCOPES, DEFAULT_ACQUIRE_TIMEOUT)
    }

    /// Bound the number of concurrently open scopes
    pub fn with_limits(max_scopes: usize, acquire_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                accounts: DashMap::new(),
                locks: DashMap::new(),
                claimed: DashSet::new(),
                permits: Arc::new(Semaphore::new(max_scopes)),
                acquire_timeout,
                failing_commits: AtomicUsize::new(0),
            }),
        }
    }

    /// Refuse new scopes. Open scopes finish normally.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    /// Make the next `n` commits fail with a backend error
    #[cfg(any(test, feature = "mock-api"))]
    pub fn fail_next_commits(&self, n: usize) {
        self.inner.failing_commits.store(n, Ordering::SeqCst);
    }

    pub fn is_claimed(&self, external_ref: &str) -> bool {
        self.inner.claimed.contains(external_ref)
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn begin(&self) -> Result<LedgerScope, LedgerError> {
        let acquire = self.inner.permits.clone().acquire_owned();
        let permit = match tokio::time::timeout(self.inner.acquire_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(LedgerError::ResourceUnavailable(
                    "ledger is shutting down".to_string(),
                ));
            }
            Err(_) => {
                return Err(LedgerError::ResourceUnavailable(format!(
                    "no ledger scope available within {:?}",
                    self.inner.acquire_timeout
                )));
            }
        };

        Ok(LedgerScope::new(Box::new(MemoryScope {
            inner: self.inner.clone(),
            _permit: permit,
            guards: HashMap::new(),
            balances: HashMap::new(),
            favourites: HashMap::new(),
            new_accounts: Vec::new(),
            claims: Vec::new(),
            committed: false,
        })))
    }

    async fn wallet(&self, user: &UserId) -> Result<WalletRecord, LedgerError> {
        self.inner
            .accounts
            .get(user)
            .map(|row| row.wallet.clone())
            .ok_or_else(|| LedgerError::AccountNotFound(user.clone()))
    }

    async fn balances(&self, user: &UserId) -> Result<BTreeMap<AssetCode, Decimal>, LedgerError> {
        self.inner
            .accounts
            .get(user)
            .map(|row| row.balances.clone())
            .ok_or_else(|| LedgerError::AccountNotFound(user.clone()))
    }

    async fn favourites(&self, user: &UserId) -> Result<Vec<FavouriteEntry>, LedgerError> {
        self.inner
            .accounts
            .get(user)
            .map(|row| row.favourites.clone())
            .ok_or_else(|| LedgerError::AccountNotFound(user.clone()))
    }
}

struct MemoryScope {
    inner: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
    guards: HashMap<UserId, OwnedMutexGuard<()>>,
    balances: HashMap<UserId, BTreeMap<AssetCode, Decimal>>,
    favourites: HashMap<UserId, Vec<FavouriteEntry>>,
    new_accounts: Vec<NewAccount>,
    claims: Vec<String>,
    committed: bool,
}

impl MemoryScope {
    async fn ensure_locked(&mut self, user: &UserId) -> Result<(), LedgerError> {
        if self.guards.contains_key(user) {
            return Ok(());
        }
        if !self.inner.accounts.contains_key(user) {
            return Err(LedgerError::AccountNotFound(user.clone()));
        }
        let lock = self
            .inner
            .locks
            .entry(user.clone())
            .or_default()
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        self.guards.insert(user.clone(), guard);
        Ok(())
    }
}

#[async_trait]
impl ScopeBackend for MemoryScope {
    async fn lock_account(&mut self, user: &UserId) -> Result<AccountSnapshot, LedgerError> {
        self.ensure_locked(user).await?;

        let mut balances = self
            .inner
            .accounts
            .get(user)
            .map(|row| row.balances.clone())
            .ok_or_else(|| LedgerError::AccountNotFound(user.clone()))?;
        if let Some(staged) = self.balances.get(user) {
            balances.extend(staged.iter().map(|(a, v)| (a.clone(), *v)));
        }

        Ok(AccountSnapshot {
            user: user.clone(),
            balances,
        })
    }

    async fn write_balances(
        &mut self,
        user: &UserId,
        balances: &[(AssetCode, Decimal)],
    ) -> Result<(), LedgerError> {
        self.ensure_locked(user).await?;
        let staged = self.balances.entry(user.clone()).or_default();
        for (asset, amount) in balances {
            if *amount < Decimal::ZERO {
                return Err(LedgerError::NegativeBalance {
                    user: user.clone(),
                    asset: asset.clone(),
                });
            }
            staged.insert(asset.clone(), *amount);
        }
        Ok(())
    }

    async fn claim_external_ref(
        &mut self,
        external_ref: &str,
        _user: &UserId,
        _kind: &str,
    ) -> Result<bool, LedgerError> {
        if self.claims.iter().any(|c| c == external_ref) {
            return Ok(false);
        }
        if self.inner.claimed.insert(external_ref.to_string()) {
            self.claims.push(external_ref.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn insert_account(&mut self, account: &NewAccount) -> Result<(), LedgerError> {
        let staged = self.new_accounts.iter().any(|a| a.user == account.user);
        if staged || self.inner.accounts.contains_key(&account.user) {
            return Err(LedgerError::AccountExists(account.user.clone()));
        }
        self.new_accounts.push(account.clone());
        Ok(())
    }

    async fn replace_favourites(
        &mut self,
        user: &UserId,
        entries: &[FavouriteEntry],
    ) -> Result<(), LedgerError> {
        self.ensure_locked(user).await?;
        self.favourites.insert(user.clone(), entries.to_vec());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), LedgerError> {
        if self.inner.take_injected_failure() {
            return Err(LedgerError::Backend("injected commit failure".to_string()));
        }

        for account in self.new_accounts.drain(..) {
            match self.inner.accounts.entry(account.user.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    return Err(LedgerError::AccountExists(account.user));
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(AccountRow {
                        wallet: account.wallet,
                        balances: account
                            .assets
                            .into_iter()
                            .map(|asset| (asset, Decimal::ZERO))
                            .collect(),
                        favourites: Vec::new(),
                    });
                }
            }
        }

        for (user, staged) in self.balances.drain() {
            if let Some(mut row) = self.inner.accounts.get_mut(&user) {
                row.balances.extend(staged);
            }
        }
        for (user, entries) in self.favourites.drain() {
            if let Some(mut row) = self.inner.accounts.get_mut(&user) {
                row.favourites = entries;
            }
        }

        self.committed = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        Ok(())
    }
}

impl Drop for MemoryScope {
    fn drop(&mut self) {
        if !self.committed {
            for claim in &self.claims {
                self.inner.claimed.remove(claim);
            }
        }
    }
}
