//! JSON-file backed remote store.
//!
//! Each (owner, collection) pair lives in `<root>/<owner>/<collection>.json`
//! as a JSON array of records. Writes replace the file atomically. Changes
//! made through this store are broadcast in-process; modifications made by
//! anything else (another `cadence` process, an editor) are detected with a
//! file watcher and reported as a stream error so subscribers resync.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use notify::{RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{ChangeEvent, ChangeStream, RemoteStore, StoreError};
use crate::types::{CollectionRef, EntityRecord};

const CHANNEL_CAPACITY: usize = 256;

/// Content last written per collection file, so the watcher can tell our
/// own writes apart from external ones.
type WrittenContent = Arc<Mutex<HashMap<PathBuf, String>>>;

pub struct FileStore {
    root: PathBuf,
    written: WrittenContent,
    io_lock: Mutex<()>,
    wire: broadcast::Sender<(CollectionRef, ChangeEvent)>,
}

impl FileStore {
    /// Open (and create) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        fs::create_dir_all(root.as_ref())?;
        let root = fs::canonicalize(root.as_ref())?;
        let (wire, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self {
            root,
            written: Arc::new(Mutex::new(HashMap::new())),
            io_lock: Mutex::new(()),
            wire,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the JSON file backing `collection`.
    pub fn collection_path(&self, collection: &CollectionRef) -> Result<PathBuf, StoreError> {
        validate_segment(&collection.owner)?;
        validate_segment(&collection.name)?;
        Ok(self
            .root
            .join(&collection.owner)
            .join(format!("{}.json", collection.name)))
    }

    fn load(path: &Path) -> Result<Vec<EntityRecord>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, path: &Path, records: &[EntityRecord]) -> Result<(), StoreError> {
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::Io(format!("no parent directory for {}", path.display())))?;
        fs::create_dir_all(dir)?;

        let content = serde_json::to_string_pretty(records)?;
        if let Ok(mut written) = self.written.lock() {
            written.insert(path.to_path_buf(), content.clone());
        }

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error.to_string()))?;
        Ok(())
    }

    fn mutate<F>(&self, collection: &CollectionRef, apply: F) -> Result<Option<ChangeEvent>, StoreError>
    where
        F: FnOnce(&mut Vec<EntityRecord>) -> Option<ChangeEvent>,
    {
        let path = self.collection_path(collection)?;
        let _guard = self
            .io_lock
            .lock()
            .map_err(|_| StoreError::Io("file store lock poisoned".to_string()))?;
        let mut records = Self::load(&path)?;
        let event = apply(&mut records);
        if event.is_some() {
            self.save(&path, &records)?;
        }
        Ok(event)
    }
}

fn validate_segment(segment: &str) -> Result<(), StoreError> {
    let valid = !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StoreError::Rejected(format!("invalid collection path segment: '{segment}'")))
    }
}

/// True when the file at `path` no longer holds what this store last wrote.
fn is_external_change(path: &Path, written: &WrittenContent) -> bool {
    let current = fs::read_to_string(path).ok();
    let Ok(written) = written.lock() else {
        return true;
    };
    match (written.get(path), current) {
        (Some(ours), Some(current)) => *ours != current,
        (None, None) => false,
        _ => true,
    }
}

#[async_trait]
impl RemoteStore for FileStore {
    async fn read(&self, collection: &CollectionRef) -> Result<Vec<EntityRecord>, StoreError> {
        let path = self.collection_path(collection)?;
        Self::load(&path)
    }

    async fn write(
        &self,
        collection: &CollectionRef,
        record: &EntityRecord,
    ) -> Result<(), StoreError> {
        let event = self.mutate(collection, |records| {
            let record = record.clone();
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => {
                    *existing = record.clone();
                    Some(ChangeEvent::Update {
                        collection: collection.name.clone(),
                        record,
                    })
                }
                None => {
                    records.push(record.clone());
                    Some(ChangeEvent::Insert {
                        collection: collection.name.clone(),
                        record,
                    })
                }
            }
        })?;
        if let Some(event) = event {
            let _ = self.wire.send((collection.clone(), event));
        }
        Ok(())
    }

    async fn delete(&self, collection: &CollectionRef, id: &str) -> Result<(), StoreError> {
        let event = self.mutate(collection, |records| {
            let before = records.len();
            records.retain(|r| r.id != id);
            (records.len() != before).then(|| ChangeEvent::Delete {
                collection: collection.name.clone(),
                id: id.to_string(),
            })
        })?;
        if let Some(event) = event {
            let _ = self.wire.send((collection.clone(), event));
        }
        Ok(())
    }

    async fn subscribe(&self, collection: &CollectionRef) -> Result<ChangeStream, StoreError> {
        let path = self.collection_path(collection)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StoreError::Io(format!("no parent directory for {}", path.display())))?;
        fs::create_dir_all(&dir)?;

        let (tx, rx) = mpsc::unbounded_channel::<Result<ChangeEvent, StoreError>>();

        let watch_tx = tx.clone();
        let watch_path = path.clone();
        let written = Arc::clone(&self.written);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else {
                return;
            };
            let touches_collection = event
                .paths
                .iter()
                .any(|p| p.file_name() == watch_path.file_name());
            if touches_collection && !event.kind.is_access() && is_external_change(&watch_path, &written) {
                debug!(path = %watch_path.display(), "collection file changed outside the store");
                let _ = watch_tx.send(Err(StoreError::Disconnected));
            }
        })
        .map_err(|e| StoreError::Transport(format!("file watcher: {e}")))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| StoreError::Transport(format!("file watcher: {e}")))?;

        let mut wire = self.wire.subscribe();
        let target = collection.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = wire.recv() => match msg {
                        Ok((collection, event)) if collection == target => {
                            if tx.send(Ok(event)).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(collection = %target, skipped, "file store change stream lagged");
                            let _ = tx.send(Err(StoreError::Transport(format!(
                                "change stream lagged by {skipped} event(s)"
                            ))));
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        // The watcher lives as long as the stream does.
        let stream = futures::stream::unfold(
            (rx, watcher, false),
            |(mut rx, watcher, done)| async move {
                if done {
                    return None;
                }
                let item = rx.recv().await?;
                let done = item.is_err();
                Some((item, (rx, watcher, done)))
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
        CollectionRef::new("alice", "envelopes")
    }

    fn record(id: &str, saldo: f64) -> EntityRecord {
        let fields: Map<String, Value> = json!({ "saldo_atual": saldo }).as_object().cloned().unwrap();
        EntityRecord::with_id(id, fields)
    }

    #[tokio::test]
    async fn test_read_missing_collection_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        assert!(store.read(&collection()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_persists_to_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        store.write(&collection(), &record("e1", 10.0)).await.unwrap();
        store.write(&collection(), &record("e2", 5.0)).await.unwrap();
        store.write(&collection(), &record("e1", 7.5)).await.unwrap();

        let reopened = FileStore::open(tmp.path()).unwrap();
        let records = reopened.read(&collection()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "e1");
        assert_eq!(records[0].get("saldo_atual"), Some(&json!(7.5)));

        let path = store.collection_path(&collection()).unwrap();
        assert!(path.ends_with("alice/envelopes.json"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        store.write(&collection(), &record("e1", 1.0)).await.unwrap();
        store.delete(&collection(), "e1").await.unwrap();
        store.delete(&collection(), "e1").await.unwrap();
        assert!(store.read(&collection()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        let evil = CollectionRef::new("..", "envelopes");
        assert!(matches!(
            store.read(&evil).await,
            Err(StoreError::Rejected(_))
        ));
        let evil = CollectionRef::new("alice", "a/b");
        assert!(store.write(&evil, &record("e1", 1.0)).await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_receives_own_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        let mut stream = store.subscribe(&collection()).await.unwrap();

        store.write(&collection(), &record("e1", 1.0)).await.unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(event, ChangeEvent::Insert { .. }));
        assert_eq!(event.record_id(), "e1");
    }

    #[test]
    fn test_external_change_detection() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("envelopes.json");
        let written: WrittenContent = Arc::new(Mutex::new(HashMap::new()));

        assert!(!is_external_change(&path, &written));

        fs::write(&path, "[]").unwrap();
        assert!(is_external_change(&path, &written));

        written.lock().unwrap().insert(path.clone(), "[]".to_string());
        assert!(!is_external_change(&path, &written));

        fs::write(&path, "[{\"id\":\"x\"}]").unwrap();
        assert!(is_external_change(&path, &written));
    }
}
