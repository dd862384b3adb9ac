//! In-memory reconciliation queue

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use ulid::Ulid;

use super::{ReconciliationError, ReconciliationItem, ReconciliationQueue, ReconciliationStatus};

#[derive(Default)]
struct Inner {
    // Ulid order is creation order
    items: RwLock<BTreeMap<Ulid, ReconciliationItem>>,
    failing_enqueues: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryReconciliationQueue {
    inner: Arc<Inner>,
}

impl MemoryReconciliationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` enqueues fail
    #[cfg(any(test, feature = "mock-api"))]
    pub fn fail_next_enqueues(&self, n: usize) {
        self.inner.failing_enqueues.store(n, Ordering::SeqCst);
    }

    /// Every item regardless of status, oldest first
    pub async fn all(&self) -> Vec<ReconciliationItem> {
        self.inner.items.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ReconciliationQueue for MemoryReconciliationQueue {
    async fn enqueue(&self, item: &ReconciliationItem) -> Result<(), ReconciliationError> {
        let injected = self
            .inner
            .failing_enqueues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ReconciliationError::Unavailable(
                "injected enqueue failure".to_string(),
            ));
        }
        self.inner.items.write().await.insert(item.id, item.clone());
        Ok(())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<ReconciliationItem>, ReconciliationError> {
        Ok(self
            .inner
            .items
            .read()
            .await
            .values()
            .filter(|item| item.status == ReconciliationStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update(&self, item: &ReconciliationItem) -> Result<(), ReconciliationError> {
        let mut items = self.inner.items.write().await;
        match items.get_mut(&item.id) {
            Some(existing) => {
                *existing = item.clone();
                existing.updated_at = Utc::now();
                Ok(())
            }
            None => Err(ReconciliationError::Unavailable(format!(
                "unknown reconciliation item {}",
                item.id
            ))),
        }
    }

    async fn get(&self, id: Ulid) -> Result<Option<ReconciliationItem>, ReconciliationError> {
        Ok(self.inner.items.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{AssetCode, SagaKind, UserId};
    use crate::reconciliation::ReconciliationReason;
    use rust_decimal::Decimal;

    fn item() -> ReconciliationItem {
        ReconciliationItem::new(
            SagaKind::FiatDeposit,
            uuid::Uuid::new_v4(),
            UserId::new("alice"),
            AssetCode::new("USD"),
            Decimal::TEN,
            ReconciliationReason::AuditLag,
        )
    }

    #[tokio::test]
    async fn test_pending_excludes_resolved_and_manual() {
        let queue = MemoryReconciliationQueue::new();
        let first = item();
        let second = item();
        let third = item().manual_review();
        for i in [&first, &second, &third] {
            queue.enqueue(i).await.unwrap();
        }

        let mut resolved = second.clone();
        resolved.status = ReconciliationStatus::Resolved;
        queue.update(&resolved).await.unwrap();

        let pending = queue.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(queue.len().await, 3);
    }

    #[tokio::test]
    async fn test_pending_respects_limit_oldest_first() {
        let queue = MemoryReconciliationQueue::new();
        let items: Vec<_> = (0..5).map(|_| item()).collect();
        for i in &items {
            queue.enqueue(i).await.unwrap();
        }
        let pending = queue.pending(2).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].id < pending[1].id);
    }

    #[tokio::test]
    async fn test_injected_enqueue_failure() {
        let queue = MemoryReconciliationQueue::new();
        queue.fail_next_enqueues(1);
        assert!(queue.enqueue(&item()).await.is_err());
        assert!(queue.enqueue(&item()).await.is_ok());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_unknown_item() {
        let queue = MemoryReconciliationQueue::new();
        assert!(queue.update(&item()).await.is_err());
        assert!(queue.get(Ulid::new()).await.unwrap().is_none());
    }
}
