//! In-memory outbox store, distributed lock, and offset store.

use async_trait::async_trait;
use chrono::Utc;
use silverback_core::envelope::{MessageId, TopicPartition};
use silverback_core::offset_store::{OffsetStore, OffsetStoreError};
use silverback_core::outbox::{
    DistributedLock, LockError, NewOutboxRecord, OutboxError, OutboxRecord, OutboxStore,
    OutboxTransaction,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct OutboxState {
    rows: Vec<OutboxRecord>,
    next_id: i64,
}

impl OutboxState {
    fn insert(&mut self, record: NewOutboxRecord) {
        self.next_id += 1;
        self.rows.push(OutboxRecord {
            id: self.next_id,
            endpoint_name: record.endpoint_name,
            message_type: record.message_type,
            headers: record.headers,
            content: record.content,
            created_at: Utc::now(),
        });
    }
}

/// In-memory [`OutboxStore`] with real transaction visibility: rows
/// appended inside a transaction stay invisible until commit, and a
/// rollback discards them.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<OutboxState>>,
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed rows currently stored.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }

    /// `true` when no committed rows are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, record: NewOutboxRecord) -> Result<(), OutboxError> {
        #[allow(clippy::unwrap_used)]
        self.state.lock().unwrap().insert(record);
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, OutboxError> {
        Ok(Box::new(InMemoryOutboxTransaction {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
        }))
    }

    async fn fetch_batch(&self, limit: u32) -> Result<Vec<OutboxRecord>, OutboxError> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        Ok(state.rows.iter().take(limit as usize).cloned().collect())
    }

    async fn delete(&self, ids: &[i64]) -> Result<(), OutboxError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.rows.retain(|row| !ids.contains(&row.id));
        Ok(())
    }
}

/// A pending in-memory outbox transaction. Dropping it without committing
/// discards the staged rows.
pub struct InMemoryOutboxTransaction {
    state: Arc<Mutex<OutboxState>>,
    staged: Vec<NewOutboxRecord>,
}

#[async_trait]
impl OutboxTransaction for InMemoryOutboxTransaction {
    async fn append(&mut self, record: NewOutboxRecord) -> Result<(), OutboxError> {
        self.staged.push(record);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), OutboxError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        for record in self.staged {
            state.insert(record);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), OutboxError> {
        Ok(())
    }
}

/// In-memory [`DistributedLock`].
#[derive(Clone, Default)]
pub struct InMemoryLock {
    held: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryLock {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current holder of `name`, if any.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn holder(&self, name: &str) -> Option<String> {
        self.held.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, name: &str, holder: &str) -> Result<bool, LockError> {
        #[allow(clippy::unwrap_used)]
        let mut held = self.held.lock().unwrap();
        match held.get(name) {
            Some(current) => Ok(current == holder),
            None => {
                held.insert(name.to_string(), holder.to_string());
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, holder: &str) -> Result<(), LockError> {
        #[allow(clippy::unwrap_used)]
        let mut held = self.held.lock().unwrap();
        if held.get(name).is_some_and(|current| current == holder) {
            held.remove(name);
        }
        Ok(())
    }
}

/// In-memory [`OffsetStore`].
#[derive(Clone, Default)]
pub struct InMemoryOffsetStore {
    offsets: Arc<Mutex<HashMap<(String, TopicPartition), i64>>>,
}

impl InMemoryOffsetStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload a stored offset (test setup).
    pub fn preload(&self, group: &str, partition: TopicPartition, offset: i64) {
        #[allow(clippy::unwrap_used)]
        self.offsets
            .lock()
            .unwrap()
            .insert((group.to_string(), partition), offset);
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn load(
        &self,
        group: &str,
        partition: &TopicPartition,
    ) -> Result<Option<i64>, OffsetStoreError> {
        #[allow(clippy::unwrap_used)]
        let offsets = self.offsets.lock().unwrap();
        Ok(offsets.get(&(group.to_string(), partition.clone())).copied())
    }

    async fn store(&self, group: &str, id: &MessageId) -> Result<(), OffsetStoreError> {
        #[allow(clippy::unwrap_used)]
        let mut offsets = self.offsets.lock().unwrap();
        let entry = offsets
            .entry((group.to_string(), id.topic_partition()))
            .or_insert(id.offset);
        *entry = (*entry).max(id.offset);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn row(endpoint: &str) -> NewOutboxRecord {
        NewOutboxRecord {
            endpoint_name: endpoint.to_string(),
            message_type: Some("T.v1".to_string()),
            headers: Vec::new(),
            content: Some(b"x".to_vec()),
        }
    }

    #[tokio::test]
    async fn rows_keep_insertion_order() {
        let store = InMemoryOutboxStore::new();
        store.append(row("a")).await.unwrap();
        store.append(row("b")).await.unwrap();

        let batch = store.fetch_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[0].id < batch[1].id);
        assert_eq!(batch[0].endpoint_name, "a");
    }

    #[tokio::test]
    async fn rolled_back_rows_stay_invisible() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.append(row("a")).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.append(row("a")).await.unwrap();
        tx.append(row("b")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn lock_is_exclusive_but_reentrant_per_holder() {
        let lock = InMemoryLock::new();
        assert!(lock.try_acquire("outbox", "w1").await.unwrap());
        assert!(lock.try_acquire("outbox", "w1").await.unwrap());
        assert!(!lock.try_acquire("outbox", "w2").await.unwrap());

        // Only the holder can release.
        lock.release("outbox", "w2").await.unwrap();
        assert!(!lock.try_acquire("outbox", "w2").await.unwrap());
        lock.release("outbox", "w1").await.unwrap();
        assert!(lock.try_acquire("outbox", "w2").await.unwrap());
    }

    #[tokio::test]
    async fn offset_store_keeps_the_highest_offset() {
        let store = InMemoryOffsetStore::new();
        let tp = TopicPartition::new("t", 0);
        store.store("g", &MessageId::new("t", 0, 5)).await.unwrap();
        store.store("g", &MessageId::new("t", 0, 3)).await.unwrap();
        assert_eq!(store.load("g", &tp).await.unwrap(), Some(5));
    }
}
