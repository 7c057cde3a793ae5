//! In-process remote store with fault injection.
//!
//! Used by tests and demos. Writes made through the store are echoed on the
//! change stream exactly like a hosted store echoes a client's own writes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use indexmap::IndexMap;
use tokio::sync::broadcast;

use super::{ChangeEvent, ChangeStream, RemoteStore, StoreError};
use crate::types::{CollectionRef, EntityRecord};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Wire {
    Change(CollectionRef, ChangeEvent),
    Disconnect,
}

#[derive(Debug, Default)]
struct MemoryInner {
    collections: HashMap<CollectionRef, IndexMap<String, EntityRecord>>,
    failing_writes: u32,
    failing_reads: u32,
    offline: bool,
    writes: u64,
    deletes: u64,
}

pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    wire: broadcast::Sender<Wire>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (wire, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(MemoryInner::default()),
            wire,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Transport("memory store lock poisoned".to_string()))
    }

    /// Load records without emitting change events.
    pub fn seed(&self, collection: &CollectionRef, records: Vec<EntityRecord>) {
        if let Ok(mut inner) = self.lock() {
            let entries = inner.collections.entry(collection.clone()).or_default();
            for record in records {
                entries.insert(record.id.clone(), record);
            }
        }
    }

    /// Simulate a write from another device: stored and broadcast, but not
    /// counted as one of this client's writes.
    pub fn external_write(&self, collection: &CollectionRef, record: EntityRecord) {
        if let Ok(mut inner) = self.lock() {
            let event = upsert(&mut inner, collection, record);
            drop(inner);
            let _ = self.wire.send(Wire::Change(collection.clone(), event));
        }
    }

    pub fn external_delete(&self, collection: &CollectionRef, id: &str) {
        if let Ok(mut inner) = self.lock() {
            let removed = inner
                .collections
                .get_mut(collection)
                .and_then(|entries| entries.shift_remove(id));
            drop(inner);
            if removed.is_some() {
                let _ = self.wire.send(Wire::Change(
                    collection.clone(),
                    ChangeEvent::Delete {
                        collection: collection.name.clone(),
                        id: id.to_string(),
                    },
                ));
            }
        }
    }

    /// Reject the next `count` writes/deletes.
    pub fn fail_next_writes(&self, count: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.failing_writes = count;
        }
    }

    /// Make the next `count` reads fail as if the stored data were corrupt.
    pub fn fail_next_reads(&self, count: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.failing_reads = count;
        }
    }

    /// Go offline (every call fails, open streams drop) or come back.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.offline = offline;
        }
        if offline {
            let _ = self.wire.send(Wire::Disconnect);
        }
    }

    /// Drop every open change stream without going offline.
    pub fn disconnect_streams(&self) {
        let _ = self.wire.send(Wire::Disconnect);
    }

    /// Successful writes (upserts) made through the `RemoteStore` API.
    pub fn write_count(&self) -> u64 {
        self.lock().map(|inner| inner.writes).unwrap_or(0)
    }

    pub fn delete_count(&self) -> u64 {
        self.lock().map(|inner| inner.deletes).unwrap_or(0)
    }

    pub fn records(&self, collection: &CollectionRef) -> Vec<EntityRecord> {
        self.lock()
            .ok()
            .and_then(|inner| {
                inner
                    .collections
                    .get(collection)
                    .map(|entries| entries.values().cloned().collect())
            })
            .unwrap_or_default()
    }

    fn check_online(inner: &MemoryInner) -> Result<(), StoreError> {
        if inner.offline {
            Err(StoreError::Transport("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn take_failure(inner: &mut MemoryInner) -> Result<(), StoreError> {
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(StoreError::Rejected("injected write failure".to_string()));
        }
        Ok(())
    }
}

fn upsert(inner: &mut MemoryInner, collection: &CollectionRef, record: EntityRecord) -> ChangeEvent {
    let entries = inner.collections.entry(collection.clone()).or_default();
    let existed = entries.insert(record.id.clone(), record.clone()).is_some();
    if existed {
        ChangeEvent::Update {
            collection: collection.name.clone(),
            record,
        }
    } else {
        ChangeEvent::Insert {
            collection: collection.name.clone(),
            record,
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn read(&self, collection: &CollectionRef) -> Result<Vec<EntityRecord>, StoreError> {
        let mut inner = self.lock()?;
        Self::check_online(&inner)?;
        if inner.failing_reads > 0 {
            inner.failing_reads -= 1;
            return Err(StoreError::Serialization("injected read failure".to_string()));
        }
        Ok(inner
            .collections
            .get(collection)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn write(
        &self,
        collection: &CollectionRef,
        record: &EntityRecord,
    ) -> Result<(), StoreError> {
        let event = {
            let mut inner = self.lock()?;
            Self::check_online(&inner)?;
            Self::take_failure(&mut inner)?;
            inner.writes += 1;
            upsert(&mut inner, collection, record.clone())
        };
        let _ = self.wire.send(Wire::Change(collection.clone(), event));
        Ok(())
    }

    async fn delete(&self, collection: &CollectionRef, id: &str) -> Result<(), StoreError> {
        let removed = {
            let mut inner = self.lock()?;
            Self::check_online(&inner)?;
            Self::take_failure(&mut inner)?;
            inner.deletes += 1;
            inner
                .collections
                .get_mut(collection)
                .and_then(|entries| entries.shift_remove(id))
        };
        if removed.is_some() {
            let _ = self.wire.send(Wire::Change(
                collection.clone(),
                ChangeEvent::Delete {
                    collection: collection.name.clone(),
                    id: id.to_string(),
                },
            ));
        }
        Ok(())
    }

    async fn subscribe(&self, collection: &CollectionRef) -> Result<ChangeStream, StoreError> {
        {
            let inner = self.lock()?;
            Self::check_online(&inner)?;
        }
        let receiver = self.wire.subscribe();
        let target = collection.clone();

        let stream = futures::stream::unfold(
            (receiver, target, false),
            |(mut receiver, target, done)| async move {
                if done {
                    return None;
                }
                loop {
                    match receiver.recv().await {
                        Ok(Wire::Change(collection, event)) if collection == target => {
                            return Some((Ok(event), (receiver, target, false)));
                        }
                        Ok(Wire::Change(..)) => continue,
                        Ok(Wire::Disconnect) => {
                            return Some((Err(StoreError::Disconnected), (receiver, target, true)));
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let err = StoreError::Transport(format!(
                                "change stream lagged by {skipped} event(s)"
                            ));
                            return Some((Err(err), (receiver, target, true)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn collection() -> CollectionRef {
        CollectionRef::new("alice", "gastos")
    }

    fn record(id: &str, valor: i64) -> EntityRecord {
        let fields: Map<String, Value> = json!({ "valor": valor }).as_object().cloned().unwrap();
        EntityRecord::with_id(id, fields)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemoryStore::new();
        store.write(&collection(), &record("g1", 10)).await.unwrap();
        store.write(&collection(), &record("g1", 20)).await.unwrap();

        let records = store.read(&collection()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("valor"), Some(&json!(20)));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_collections_are_scoped_by_owner() {
        let store = MemoryStore::new();
        store.write(&collection(), &record("g1", 10)).await.unwrap();

        let bob = CollectionRef::new("bob", "gastos");
        assert!(store.read(&bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_receives_insert_then_update() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe(&collection()).await.unwrap();

        store.write(&collection(), &record("g1", 10)).await.unwrap();
        store.write(&collection(), &record("g1", 11)).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, ChangeEvent::Insert { .. }));
        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(second, ChangeEvent::Update { .. }));
    }

    #[tokio::test]
    async fn test_subscribe_filters_other_collections() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe(&collection()).await.unwrap();

        let other = CollectionRef::new("alice", "envelopes");
        store.write(&other, &record("e1", 1)).await.unwrap();
        store.write(&collection(), &record("g1", 1)).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.record_id(), "g1");
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store.write(&collection(), &record("g1", 1)).await.is_err());
        assert!(store.write(&collection(), &record("g1", 1)).await.is_ok());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_drops_streams_and_fails_calls() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe(&collection()).await.unwrap();

        store.set_offline(true);
        assert_eq!(stream.next().await, Some(Err(StoreError::Disconnected)));
        assert!(stream.next().await.is_none());
        assert!(store.read(&collection()).await.is_err());
        assert!(store.subscribe(&collection()).await.is_err());

        store.set_offline(false);
        assert!(store.read(&collection()).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_emits_event_only_when_present() {
        let store = MemoryStore::new();
        store.seed(&collection(), vec![record("g1", 1)]);
        let mut stream = store.subscribe(&collection()).await.unwrap();

        store.delete(&collection(), "missing").await.unwrap();
        store.delete(&collection(), "g1").await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(
            event,
            ChangeEvent::Delete {
                collection: "gastos".to_string(),
                id: "g1".to_string()
            }
        );
        assert!(store.records(&collection()).is_empty());
    }
}
