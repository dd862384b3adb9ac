//! In-memory audit log with fault injection for saga tests

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::{AppendOutcome, AuditError, AuditStore, RecordKind, SettlementRecord};
use crate::core_types::UserId;

#[derive(Default)]
struct Inner {
    records: RwLock<Vec<SettlementRecord>>,
    failing_appends: AtomicUsize,
    unavailable: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryAuditLog {
    inner: Arc<Inner>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail
    #[cfg(any(test, feature = "mock-api"))]
    pub fn fail_next_appends(&self, n: usize) {
        self.inner.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Fail every append until switched back
    #[cfg(any(test, feature = "mock-api"))]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.inner.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn injected_failure(&self) -> bool {
        self.inner.unavailable.load(Ordering::SeqCst)
            || self
                .inner
                .failing_appends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditLog {
    async fn append(&self, record: &SettlementRecord) -> Result<AppendOutcome, AuditError> {
        if self.injected_failure() {
            return Err(AuditError::Unavailable("injected append failure".to_string()));
        }

        let mut records = self.inner.records.write().await;
        let duplicate = records.iter().any(|existing| {
            existing.tx_id == record.tx_id
                || (record.external_ref.is_some() && existing.external_ref == record.external_ref)
        });
        if duplicate {
            return Ok(AppendOutcome::Duplicate);
        }
        records.push(record.clone());
        Ok(AppendOutcome::Appended)
    }

    fn query_by_user(
        &self,
        kind: RecordKind,
        user: &UserId,
    ) -> BoxStream<'static, Result<SettlementRecord, AuditError>> {
        let inner = self.inner.clone();
        let user = user.clone();

        futures::stream::once(async move {
            let mut matching: Vec<SettlementRecord> = inner
                .records
                .read()
                .await
                .iter()
                .filter(|r| r.kind == kind && r.user == user)
                .cloned()
                .collect();
            matching.sort_by(|a, b| b.time.cmp(&a.time));
            futures::stream::iter(matching.into_iter().map(Ok))
        })
        .flatten()
        .boxed()
    }
}
