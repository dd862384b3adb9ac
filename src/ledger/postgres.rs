//! PostgreSQL ledger
//!
//! A scope is one `sqlx::Transaction`. Locking reads take the account row
//! with `SELECT ... FOR UPDATE`, so a second saga on the same account blocks
//! until the first commits or rolls back.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::BTreeMap;

use super::{
    AccountSnapshot, FavouriteEntry, LedgerError, LedgerScope, LedgerStore, NewAccount,
    ScopeBackend, WalletRecord,
};
use crate::core_types::{AssetCode, UserId};
use crate::wallet::SigningKey;

/// Ledger tables. Applied by `Database::ensure_schema`.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    user_id     TEXT PRIMARY KEY,
    eth_address TEXT NOT NULL UNIQUE,
    eth_key     TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS balances (
    user_id    TEXT NOT NULL REFERENCES accounts(user_id),
    asset      TEXT NOT NULL,
    amount     NUMERIC(40, 18) NOT NULL CHECK (amount >= 0),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (user_id, asset)
);

CREATE TABLE IF NOT EXISTS favourites (
    id          BIGSERIAL PRIMARY KEY,
    user_id     TEXT NOT NULL REFERENCES accounts(user_id),
    tag         TEXT NOT NULL,
    eth_address TEXT NOT NULL,
    notes       TEXT
);
CREATE INDEX IF NOT EXISTS idx_favourites_user ON favourites(user_id);

CREATE TABLE IF NOT EXISTS external_refs (
    external_ref TEXT PRIMARY KEY,
    user_id      TEXT NOT NULL,
    kind         TEXT NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn require_account(&self, user: &UserId) -> Result<(), LedgerError> {
        let exists = sqlx::query("SELECT 1 FROM accounts WHERE user_id = $1")
            .bind(user.as_str())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(LedgerError::AccountNotFound(user.clone()));
        }
        Ok(())
    }
}

fn balances_from_rows(rows: &[PgRow]) -> Result<BTreeMap<AssetCode, Decimal>, LedgerError> {
    rows.iter()
        .map(|row| -> Result<(AssetCode, Decimal), LedgerError> {
            let asset: String = row.try_get("asset")?;
            let amount: Decimal = row.try_get("amount")?;
            Ok((AssetCode::new(asset), amount))
        })
        .collect()
}

fn map_insert_error(e: sqlx::Error, user: &UserId) -> LedgerError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            LedgerError::AccountExists(user.clone())
        }
        _ => LedgerError::from(e),
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn begin(&self) -> Result<LedgerScope, LedgerError> {
        let tx = self.pool.begin().await?;
        Ok(LedgerScope::new(Box::new(PgScope { tx })))
    }

    async fn wallet(&self, user: &UserId) -> Result<WalletRecord, LedgerError> {
        let row = sqlx::query("SELECT eth_address, eth_key FROM accounts WHERE user_id = $1")
            .bind(user.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(user.clone()))?;

        Ok(WalletRecord {
            address: row.try_get("eth_address")?,
            signing_key: SigningKey::new(row.try_get::<String, _>("eth_key")?),
        })
    }

    async fn balances(&self, user: &UserId) -> Result<BTreeMap<AssetCode, Decimal>, LedgerError> {
        self.require_account(user).await?;
        let rows = sqlx::query("SELECT asset, amount FROM balances WHERE user_id = $1")
            .bind(user.as_str())
            .fetch_all(&self.pool)
            .await?;
        balances_from_rows(&rows)
    }

    async fn favourites(&self, user: &UserId) -> Result<Vec<FavouriteEntry>, LedgerError> {
        self.require_account(user).await?;
        let rows = sqlx::query(
            "SELECT tag, eth_address, notes FROM favourites WHERE user_id = $1 ORDER BY id",
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<FavouriteEntry, LedgerError> {
                Ok(FavouriteEntry {
                    tag: row.try_get("tag")?,
                    address: row.try_get("eth_address")?,
                    notes: row.try_get("notes")?,
                })
            })
            .collect()
    }
}

struct PgScope {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ScopeBackend for PgScope {
    async fn lock_account(&mut self, user: &UserId) -> Result<AccountSnapshot, LedgerError> {
        let locked = sqlx::query("SELECT user_id FROM accounts WHERE user_id = $1 FOR UPDATE")
            .bind(user.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        if locked.is_none() {
            return Err(LedgerError::AccountNotFound(user.clone()));
        }

        let rows =
            sqlx::query("SELECT asset, amount FROM balances WHERE user_id = $1 FOR UPDATE")
                .bind(user.as_str())
                .fetch_all(&mut *self.tx)
                .await?;

        Ok(AccountSnapshot {
            user: user.clone(),
            balances: balances_from_rows(&rows)?,
        })
    }

    async fn write_balances(
        &mut self,
        user: &UserId,
        balances: &[(AssetCode, Decimal)],
    ) -> Result<(), LedgerError> {
        let assets: Vec<String> = balances.iter().map(|(a, _)| a.as_str().to_string()).collect();
        let amounts: Vec<Decimal> = balances.iter().map(|(_, v)| *v).collect();

        sqlx::query(
            r#"
            INSERT INTO balances (user_id, asset, amount, updated_at)
            SELECT $1, t.asset, t.amount, NOW()
            FROM UNNEST($2::text[], $3::numeric[]) AS t(asset, amount)
            ON CONFLICT (user_id, asset)
            DO UPDATE SET amount = EXCLUDED.amount, updated_at = NOW()
            "#,
        )
        .bind(user.as_str())
        .bind(&assets)
        .bind(&amounts)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn claim_external_ref(
        &mut self,
        external_ref: &str,
        user: &UserId,
        kind: &str,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO external_refs (external_ref, user_id, kind)
            VALUES ($1, $2, $3)
            ON CONFLICT (external_ref) DO NOTHING
            "#,
        )
        .bind(external_ref)
        .bind(user.as_str())
        .bind(kind)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_account(&mut self, account: &NewAccount) -> Result<(), LedgerError> {
        sqlx::query("INSERT INTO accounts (user_id, eth_address, eth_key) VALUES ($1, $2, $3)")
            .bind(account.user.as_str())
            .bind(&account.wallet.address)
            .bind(account.wallet.signing_key.expose())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_insert_error(e, &account.user))?;

        let zeroes: Vec<(AssetCode, Decimal)> = account
            .assets
            .iter()
            .map(|asset| (asset.clone(), Decimal::ZERO))
            .collect();
        if !zeroes.is_empty() {
            self.write_balances(&account.user, &zeroes).await?;
        }
        Ok(())
    }

    async fn replace_favourites(
        &mut self,
        user: &UserId,
        entries: &[FavouriteEntry],
    ) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM favourites WHERE user_id = $1")
            .bind(user.as_str())
            .execute(&mut *self.tx)
            .await?;

        for entry in entries {
            sqlx::query(
                "INSERT INTO favourites (user_id, tag, eth_address, notes) VALUES ($1, $2, $3, $4)",
            )
            .bind(user.as_str())
            .bind(&entry.tag)
            .bind(&entry.address)
            .bind(&entry.notes)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
