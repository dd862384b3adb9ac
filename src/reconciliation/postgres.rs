//! PostgreSQL reconciliation queue

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::Row;
use ulid::Ulid;

use super::{ReconciliationError, ReconciliationItem, ReconciliationQueue, ReconciliationStatus};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reconciliation_items (
    id          TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    reason      TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    tx_id       UUID NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL,
    doc         JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reconciliation_items_status
    ON reconciliation_items(status, created_at);
"#;

#[derive(Clone)]
pub struct PgReconciliationQueue {
    pool: PgPool,
}

impl PgReconciliationQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReconciliationQueue for PgReconciliationQueue {
    async fn enqueue(&self, item: &ReconciliationItem) -> Result<(), ReconciliationError> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_items
                (id, status, reason, user_id, tx_id, created_at, updated_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(item.id.to_string())
        .bind(item.status.as_str())
        .bind(item.reason.as_str())
        .bind(item.user.as_str())
        .bind(item.tx_id)
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(Json(item))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<ReconciliationItem>, ReconciliationError> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM reconciliation_items
            WHERE status = $1
            ORDER BY created_at, id
            LIMIT $2
            "#,
        )
        .bind(ReconciliationStatus::Pending.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ReconciliationItem, ReconciliationError> {
                let Json(item): Json<ReconciliationItem> = row.try_get("doc")?;
                Ok(item)
            })
            .collect()
    }

    async fn update(&self, item: &ReconciliationItem) -> Result<(), ReconciliationError> {
        let mut item = item.clone();
        item.updated_at = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE reconciliation_items
            SET status = $2, updated_at = $3, doc = $4
            WHERE id = $1
            "#,
        )
        .bind(item.id.to_string())
        .bind(item.status.as_str())
        .bind(item.updated_at)
        .bind(Json(&item))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReconciliationError::Unavailable(format!(
                "unknown reconciliation item {}",
                item.id
            )));
        }
        Ok(())
    }

    async fn get(&self, id: Ulid) -> Result<Option<ReconciliationItem>, ReconciliationError> {
        let row = sqlx::query("SELECT doc FROM reconciliation_items WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let Json(item): Json<ReconciliationItem> = row.try_get("doc")?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}
