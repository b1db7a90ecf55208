use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;

use crate::store::{InsertMessages, MessageStore};
use crate::{DeliveryState, Message, MessageId, NewMessage};

/// An in-memory message store for testing or local usage.
///
/// Rows live in a `BTreeMap` keyed by identifier behind a single mutex; the
/// mutex is the critical section that makes claims linearizable. Clones share
/// the same rows.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Rows>>,
}

#[derive(Default)]
struct Rows {
    next_id: MessageId,
    rows: BTreeMap<MessageId, Row>,
}

struct Row {
    message: Message,
    state: DeliveryState,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a message, if it exists.
    pub async fn state(&self, id: MessageId) -> Option<DeliveryState> {
        self.inner.lock().await.rows.get(&id).map(|row| row.state)
    }

    /// Identifiers currently in `state`, ascending.
    pub async fn ids_in_state(&self, state: DeliveryState) -> Vec<MessageId> {
        self.inner
            .lock()
            .await
            .rows
            .iter()
            .filter(|(_, row)| row.state == state)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.rows.is_empty()
    }
}

#[async_trait]
impl InsertMessages for InMemoryStore {
    type Error = InMemoryStoreError;

    /// Insert messages as pending, assigning identifiers from 1 upwards.
    async fn insert_messages(&self, msgs: Vec<NewMessage>) -> Result<Vec<MessageId>, Self::Error> {
        if msgs.is_empty() {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock().await;
        // Reserve every identifier up front so a failure leaves no row behind.
        let last = MessageId::try_from(msgs.len())
            .ok()
            .and_then(|count| inner.next_id.checked_add(count))
            .ok_or(InMemoryStoreError::exhausted())?;
        let first = inner.next_id + 1;
        inner.next_id = last;

        let ids: Vec<MessageId> = (first..=last).collect();
        for (id, msg) in ids.iter().zip(msgs) {
            inner.rows.insert(
                *id,
                Row {
                    message: msg.with_id(*id),
                    state: DeliveryState::Pending,
                },
            );
        }
        Ok(ids)
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    type Error = InMemoryStoreError;

    async fn claim_batch(&self, limit: usize) -> Result<Vec<Message>, Self::Error> {
        let mut inner = self.inner.lock().await;
        let claimed: Vec<Message> = inner
            .rows
            .values_mut()
            .filter(|row| row.state == DeliveryState::Pending)
            .take(limit)
            .map(|row| {
                row.state = DeliveryState::Dispatched;
                row.message.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn set_state_range(
        &self,
        low: MessageId,
        high: MessageId,
        state: DeliveryState,
    ) -> Result<u64, Self::Error> {
        if low > high {
            return Ok(0);
        }
        let mut inner = self.inner.lock().await;
        let mut updated = 0;
        for row in inner.rows.range_mut(low..=high).map(|(_, row)| row) {
            row.state = state;
            updated += 1;
        }
        Ok(updated)
    }

    async fn set_state_ids(
        &self,
        ids: &[MessageId],
        state: DeliveryState,
    ) -> Result<u64, Self::Error> {
        let mut inner = self.inner.lock().await;
        let mut updated = 0;
        for id in ids {
            if let Some(row) = inner.rows.get_mut(id) {
                row.state = state;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn count_not_dispatched(&self) -> Result<u64, Self::Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .values()
            .filter(|row| row.state != DeliveryState::Dispatched)
            .count() as u64)
    }

    async fn count_by_state(&self, state: DeliveryState) -> Result<u64, Self::Error> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.values().filter(|row| row.state == state).count() as u64)
    }

    async fn requeue_failed(&self) -> Result<u64, Self::Error> {
        let mut inner = self.inner.lock().await;
        let mut updated = 0;
        for row in inner
            .rows
            .values_mut()
            .filter(|row| row.state == DeliveryState::Failed)
        {
            row.state = DeliveryState::Pending;
            updated += 1;
        }
        Ok(updated)
    }
}

/// Error type for `InMemoryStore` operations.
#[derive(Debug)]
pub struct InMemoryStoreError {
    kind: InMemoryStoreErrorKind,
}

impl InMemoryStoreError {
    fn exhausted() -> Self {
        Self {
            kind: InMemoryStoreErrorKind::IdsExhausted,
        }
    }
}

impl std::fmt::Display for InMemoryStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryStoreErrorKind::IdsExhausted => {
                write!(f, "Message identifiers exhausted in in-memory store")
            }
        }
    }
}

impl std::error::Error for InMemoryStoreError {}

#[derive(Debug)]
enum InMemoryStoreErrorKind {
    IdsExhausted,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::store::Store;

    fn new_messages(count: usize) -> Vec<NewMessage> {
        (1..=count)
            .map(|i| {
                NewMessage::new(
                    "sender@example.com",
                    format!("recipient{i}@example.com"),
                    format!("Subject {i}"),
                    format!("Body {i}"),
                )
            })
            .collect()
    }

    async fn populated(count: usize) -> Store<InMemoryStore> {
        let store = Store::new(InMemoryStore::new());
        store.insert_messages(new_messages(count)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids_as_pending() {
        let store = Store::new(InMemoryStore::new());

        let first = store.insert_messages(new_messages(3)).await.unwrap();
        let second = store.insert_messages(new_messages(2)).await.unwrap();

        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, vec![4, 5]);
        assert_eq!(store.count_by_state(DeliveryState::Pending).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn exhausted_ids_insert_nothing() {
        let store = populated(2).await;
        store.driver().inner.lock().await.next_id = MessageId::MAX - 1;

        let error = store.insert_messages(new_messages(3)).await.unwrap_err();

        assert_eq!(error.operation(), "insert_messages");
        assert_eq!(store.driver().len().await, 2);
        assert_eq!(store.driver().inner.lock().await.next_id, MessageId::MAX - 1);
        // A batch that still fits goes through.
        let ids = store.insert_messages(new_messages(1)).await.unwrap();
        assert_eq!(ids, vec![MessageId::MAX]);
    }

    #[tokio::test]
    async fn claim_takes_lowest_pending_and_marks_dispatched() {
        let store = populated(5).await;

        let claimed = store.claim_batch(3).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(Message::id).collect();

        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(claimed[1].recipient(), "recipient2@example.com");
        assert_eq!(
            store.driver().ids_in_state(DeliveryState::Dispatched).await,
            vec![1, 2, 3]
        );
        assert_eq!(store.count_not_dispatched().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn claim_returns_remaining_then_empty() {
        let store = populated(3).await;

        assert_eq!(store.claim_batch(2).await.unwrap().len(), 2);
        assert_eq!(store.claim_batch(2).await.unwrap().len(), 1);
        assert!(store.claim_batch(2).await.unwrap().is_empty());
        assert!(store.claim_batch(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_skips_failed_messages() {
        let store = populated(4).await;
        store
            .set_state_ids(&[1, 3], DeliveryState::Failed)
            .await
            .unwrap();

        let ids: Vec<_> = store
            .claim_batch(10)
            .await
            .unwrap()
            .iter()
            .map(Message::id)
            .collect();

        assert_eq!(ids, vec![2, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_overlap() {
        let store = populated(1_000).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                loop {
                    let batch = store.claim_batch(7).await.unwrap();
                    if batch.is_empty() {
                        return ids;
                    }
                    ids.extend(batch.iter().map(Message::id));
                }
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "message {id} claimed twice");
            }
        }
        assert_eq!(seen, (1..=1_000).collect::<HashSet<_>>());
        assert_eq!(store.count_not_dispatched().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn range_update_is_inclusive_and_counts_rows() {
        let store = populated(6).await;
        store.claim_batch(6).await.unwrap();

        let updated = store
            .set_state_range(2, 4, DeliveryState::Pending)
            .await
            .unwrap();

        assert_eq!(updated, 3);
        assert_eq!(
            store.driver().ids_in_state(DeliveryState::Pending).await,
            vec![2, 3, 4]
        );
        assert_eq!(
            store
                .set_state_range(50, 60, DeliveryState::Pending)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent() {
        let store = populated(5).await;
        store.claim_batch(5).await.unwrap();

        store
            .set_state_ids(&[2, 4], DeliveryState::Failed)
            .await
            .unwrap();
        let once = store.driver().ids_in_state(DeliveryState::Failed).await;
        store
            .set_state_ids(&[2, 4], DeliveryState::Failed)
            .await
            .unwrap();
        let twice = store.driver().ids_in_state(DeliveryState::Failed).await;

        assert_eq!(once, twice);
        assert_eq!(store.count_not_dispatched().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn requeue_failed_moves_only_failed_rows() {
        let store = populated(4).await;
        store.claim_batch(4).await.unwrap();
        store
            .set_state_ids(&[1, 2], DeliveryState::Failed)
            .await
            .unwrap();

        assert_eq!(store.requeue_failed().await.unwrap(), 2);
        assert_eq!(
            store.driver().ids_in_state(DeliveryState::Pending).await,
            vec![1, 2]
        );
        assert_eq!(store.count_by_state(DeliveryState::Dispatched).await.unwrap(), 2);
    }
}
