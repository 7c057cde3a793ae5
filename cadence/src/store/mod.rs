//! Remote store contract consumed by the engine.
//!
//! The store provides full-snapshot reads, upsert/delete writes, and a
//! per-collection change stream with at-least-once delivery while connected.
//! Nothing is promised across a disconnect; callers resync instead.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CollectionRef, EntityRecord};

pub use file::FileStore;
pub use memory::MemoryStore;

/// A remote insert/update/delete notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeEvent {
    Insert {
        collection: String,
        record: EntityRecord,
    },
    Update {
        collection: String,
        record: EntityRecord,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl ChangeEvent {
    pub fn record_id(&self) -> &str {
        match self {
            ChangeEvent::Insert { record, .. } | ChangeEvent::Update { record, .. } => &record.id,
            ChangeEvent::Delete { id, .. } => id,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            ChangeEvent::Insert { collection, .. }
            | ChangeEvent::Update { collection, .. }
            | ChangeEvent::Delete { collection, .. } => collection,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChangeEvent::Insert { .. } => "insert",
            ChangeEvent::Update { .. } => "update",
            ChangeEvent::Delete { .. } => "delete",
        }
    }
}

/// Errors reported by a remote store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Store unreachable: {0}")]
    Transport(String),
    #[error("Change stream disconnected")]
    Disconnected,
    #[error("Write rejected by store: {0}")]
    Rejected(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Store IO error: {0}")]
    Io(String),
    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_transport(&self) -> bool {
        matches!(self, StoreError::Transport(_) | StoreError::Disconnected)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Change notifications for one collection. An `Err` item ends delivery.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, StoreError>>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Full snapshot of the collection.
    async fn read(&self, collection: &CollectionRef) -> Result<Vec<EntityRecord>, StoreError>;

    /// Insert or replace a record.
    async fn write(
        &self,
        collection: &CollectionRef,
        record: &EntityRecord,
    ) -> Result<(), StoreError>;

    /// Delete a record. Deleting an absent record succeeds.
    async fn delete(&self, collection: &CollectionRef, id: &str) -> Result<(), StoreError>;

    /// Open the change stream for the collection.
    async fn subscribe(&self, collection: &CollectionRef) -> Result<ChangeStream, StoreError>;
}
