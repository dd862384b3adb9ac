//! PostgreSQL audit log
//!
//! Records are JSONB documents keyed by `tx_id`, with a unique partial index
//! on `external_ref`. Queries page lazily with a `(time, tx_id)` keyset so a
//! long history is never materialised at once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::Row;
use std::collections::VecDeque;

use super::{AppendOutcome, AuditError, AuditStore, RecordKind, SettlementRecord};
use crate::core_types::{TxId, UserId};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settlement_records (
    tx_id        UUID PRIMARY KEY,
    kind         TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    external_ref TEXT,
    time         TIMESTAMPTZ NOT NULL,
    doc          JSONB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_settlement_records_external_ref
    ON settlement_records(external_ref) WHERE external_ref IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_settlement_records_user_kind_time
    ON settlement_records(user_id, kind, time DESC, tx_id DESC);
"#;

const PAGE_SIZE: i64 = 200;

#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct PageCursor {
    pool: PgPool,
    kind: RecordKind,
    user: UserId,
    after: Option<(DateTime<Utc>, TxId)>,
    buffer: VecDeque<SettlementRecord>,
    exhausted: bool,
}

impl PageCursor {
    async fn fetch_page(&mut self) -> Result<(), AuditError> {
        let rows = match self.after {
            None => {
                sqlx::query(
                    r#"
                    SELECT doc FROM settlement_records
                    WHERE user_id = $1 AND kind = $2
                    ORDER BY time DESC, tx_id DESC
                    LIMIT $3
                    "#,
                )
                .bind(self.user.as_str())
                .bind(self.kind.as_str())
                .bind(PAGE_SIZE)
                .fetch_all(&self.pool)
                .await?
            }
            Some((time, tx_id)) => {
                sqlx::query(
                    r#"
                    SELECT doc FROM settlement_records
                    WHERE user_id = $1 AND kind = $2 AND (time, tx_id) < ($3, $4)
                    ORDER BY time DESC, tx_id DESC
                    LIMIT $5
                    "#,
                )
                .bind(self.user.as_str())
                .bind(self.kind.as_str())
                .bind(time)
                .bind(tx_id)
                .bind(PAGE_SIZE)
                .fetch_all(&self.pool)
                .await?
            }
        };

        if (rows.len() as i64) < PAGE_SIZE {
            self.exhausted = true;
        }
        for row in rows {
            let Json(record): Json<SettlementRecord> = row.try_get("doc")?;
            self.after = Some((record.time, record.tx_id));
            self.buffer.push_back(record);
        }
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgAuditLog {
    async fn append(&self, record: &SettlementRecord) -> Result<AppendOutcome, AuditError> {
        let result = sqlx::query(
            r#"
            INSERT INTO settlement_records (tx_id, kind, user_id, external_ref, time, doc)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.tx_id)
        .bind(record.kind.as_str())
        .bind(record.user.as_str())
        .bind(&record.external_ref)
        .bind(record.time)
        .bind(Json(record))
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            AppendOutcome::Appended
        } else {
            AppendOutcome::Duplicate
        })
    }

    fn query_by_user(
        &self,
        kind: RecordKind,
        user: &UserId,
    ) -> BoxStream<'static, Result<SettlementRecord, AuditError>> {
        let cursor = PageCursor {
            pool: self.pool.clone(),
            kind,
            user: user.clone(),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        futures::stream::unfold(Some(cursor), |state| async move {
            let mut cursor = state?;
            loop {
                if let Some(record) = cursor.buffer.pop_front() {
                    return Some((Ok(record), Some(cursor)));
                }
                if cursor.exhausted {
                    return None;
                }
                if let Err(e) = cursor.fetch_page().await {
                    return Some((Err(e), None));
                }
            }
        })
        .boxed()
    }
}
