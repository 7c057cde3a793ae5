//! One cooperative loop per (owner, collection).
//!
//! The loop owns the reconciler and the persistence scheduler and
//! multiplexes three sources with `tokio::select!`: commands from the
//! presentation layer, change-channel messages, and scheduler deadlines.
//! Nothing else touches the cache, so no locking is needed around it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::cache::CacheOrder;
use crate::channel::{ChangeChannel, ChannelMessage, ChannelOptions, ChannelStatus, SubscriptionHandle};
use crate::clock::SharedClock;
use crate::diagnostics::{data, Diagnostics};
use crate::error::SyncError;
use crate::reconciler::{
    Mutation, MutationGuard, PendingMutation, Reconciler, ResyncReport, RunningSessionGuard,
    WriteOp, WriteOutcome,
};
use crate::scheduler::{PersistenceScheduler, WriteReason};
use crate::store::RemoteStore;
use crate::types::{
    CollectionRef, DiagnosticEventType, DiagnosticSource, EntityRecord, MutationState, SyncConfig,
    SyncStatus,
};

/// Rewrites a record right before a heartbeat write. Returning `None` ends
/// the heartbeat.
pub type CheckpointFn =
    Arc<dyn Fn(&EntityRecord, DateTime<Utc>) -> Option<EntityRecord> + Send + Sync>;

const COMMAND_BUFFER: usize = 64;

/// Snapshot published to the presentation layer after every loop turn.
#[derive(Debug, Clone, Default)]
pub struct CollectionView {
    pub records: Vec<EntityRecord>,
    pub failed: Vec<PendingMutation>,
    pub status: SyncStatus,
    /// Local changes not yet confirmed by the store.
    pub pending: usize,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Why the last full sync failed, until one succeeds.
    pub last_error: Option<SyncError>,
}

impl CollectionView {
    pub fn get(&self, id: &str) -> Option<&EntityRecord> {
        self.records.iter().find(|r| r.id == id)
    }
}

pub struct SyncOptions {
    config: SyncConfig,
    clock: SharedClock,
    order: CacheOrder,
    guards: Vec<Box<dyn MutationGuard>>,
    diagnostics: Diagnostics,
}

impl SyncOptions {
    pub fn new(config: SyncConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            order: CacheOrder::default(),
            guards: Vec::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn with_order(mut self, order: CacheOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_guard(mut self, guard: Box<dyn MutationGuard>) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

enum Command {
    Apply {
        mutation: Mutation,
        reply: oneshot::Sender<Result<String, SyncError>>,
    },
    Resync {
        reply: oneshot::Sender<Result<ResyncReport, SyncError>>,
    },
    Flush {
        reply: oneshot::Sender<Result<usize, SyncError>>,
    },
    TrackHeartbeat {
        id: String,
        checkpoint: Option<CheckpointFn>,
    },
    UntrackHeartbeat {
        id: String,
    },
    Rollback {
        id: String,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Shutdown {
        flush: bool,
        reply: oneshot::Sender<()>,
    },
}

pub struct CollectionSync {
    store: Arc<dyn RemoteStore>,
    reconciler: Reconciler,
    scheduler: PersistenceScheduler,
    clock: SharedClock,
    checkpoints: HashMap<String, CheckpointFn>,
    /// `None` until the channel reports its first status.
    connected: Option<bool>,
    synced_once: bool,
    last_synced_at: Option<DateTime<Utc>>,
    sync_error: Option<SyncError>,
    /// Resync retry after a failed reload, on the channel's backoff.
    resync_backoff: ChannelOptions,
    resync_delay: Duration,
    resync_at: Option<Instant>,
    view_tx: watch::Sender<CollectionView>,
    diagnostics: Diagnostics,
}

impl CollectionSync {
    /// Start the loop for `collection`. Must be called inside a tokio
    /// runtime.
    pub fn spawn(
        store: Arc<dyn RemoteStore>,
        collection: CollectionRef,
        options: SyncOptions,
    ) -> CollectionHandle {
        let SyncOptions {
            config,
            clock,
            order,
            guards,
            diagnostics,
        } = options;

        let mut reconciler = Reconciler::new(collection.clone(), order, &config)
            .with_diagnostics(diagnostics.clone());
        for guard in guards {
            reconciler = reconciler.with_guard(guard);
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (view_tx, view_rx) = watch::channel(CollectionView::default());
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();

        let backoff = ChannelOptions::from(&config);
        let subscription = ChangeChannel::new(Arc::clone(&store), backoff)
            .subscribe(collection.clone(), move |message| {
                let _ = channel_tx.send(message);
            });

        let engine = CollectionSync {
            store,
            reconciler,
            scheduler: PersistenceScheduler::from_config(&config),
            clock,
            checkpoints: HashMap::new(),
            connected: None,
            synced_once: false,
            last_synced_at: None,
            sync_error: None,
            resync_backoff: backoff,
            resync_delay: backoff.backoff,
            resync_at: None,
            view_tx,
            diagnostics,
        };
        tokio::spawn(engine.run(command_rx, channel_rx, subscription));

        CollectionHandle {
            collection,
            commands: command_tx,
            view: view_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut channel_rx: mpsc::UnboundedReceiver<ChannelMessage>,
        subscription: SubscriptionHandle,
    ) {
        debug!(collection = %self.reconciler.collection(), "collection loop started");
        let mut channel_open = true;

        loop {
            let deadline = self.scheduler.next_deadline();
            let resync_at = self.resync_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { flush, reply }) => {
                        if flush {
                            if let Err(e) = self.flush_all().await {
                                warn!(error = %e, "flush on shutdown incomplete");
                            }
                        }
                        self.publish();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                message = channel_rx.recv(), if channel_open => match message {
                    Some(message) => self.handle_channel(message).await,
                    None => channel_open = false,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    for due in self.scheduler.drain_due(Instant::now()) {
                        self.flush_unit(&due.unit, due.reason).await;
                    }
                }
                _ = sleep_until(resync_at.unwrap_or_else(Instant::now)), if resync_at.is_some() => {
                    self.resync_at = None;
                    let _ = self.resync().await;
                }
            }
            self.publish();
        }

        drop(subscription);
        self.scheduler.cancel_all();
        info!(collection = %self.reconciler.collection(), "collection loop stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Apply { mutation, reply } => {
                let now = self.clock.now();
                let result = self.reconciler.apply_optimistic(mutation, now);
                if let Ok(id) = &result {
                    self.scheduler.mark_dirty(id);
                }
                self.publish();
                let _ = reply.send(result);
            }
            Command::Resync { reply } => {
                let result = self.resync().await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Flush { reply } => {
                let result = self.flush_all().await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::TrackHeartbeat { id, checkpoint } => {
                match checkpoint {
                    Some(hook) => {
                        self.checkpoints.insert(id.clone(), hook);
                    }
                    None => {
                        self.checkpoints.remove(&id);
                    }
                }
                self.scheduler.start_heartbeat(&id);
            }
            Command::UntrackHeartbeat { id } => {
                self.checkpoints.remove(&id);
                self.scheduler.stop_heartbeat(&id);
            }
            Command::Rollback { id, reply } => {
                let result = self.reconciler.rollback(&id);
                if result.is_ok() {
                    self.scheduler.cancel(&id);
                    self.checkpoints.remove(&id);
                }
                self.publish();
                let _ = reply.send(result);
            }
            // Handled by the loop.
            Command::Shutdown { .. } => {}
        }
    }

    async fn handle_channel(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::Status(status) => {
                let connected = status == ChannelStatus::Connected;
                self.connected = Some(connected);
                self.diagnostics.log(
                    DiagnosticEventType::ChannelStatus,
                    DiagnosticSource::Channel,
                    None,
                    data([("connected", json!(connected))]),
                );
            }
            ChannelMessage::ResyncRequired => {
                let _ = self.resync().await;
            }
            ChannelMessage::Event(event) => {
                let outcome = self.reconciler.on_change_event(event);
                debug!(collection = %self.reconciler.collection(), ?outcome, "change event");
            }
        }
    }

    /// Reload the collection. A failure is published and retried with
    /// backoff until a reload succeeds.
    async fn resync(&mut self) -> Result<ResyncReport, SyncError> {
        let now = self.clock.now();
        let report = match self.reconciler.resync(self.store.as_ref(), now).await {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    collection = %self.reconciler.collection(),
                    error = %e,
                    retry_ms = self.resync_delay.as_millis() as u64,
                    "resync failed"
                );
                self.sync_error = Some(e.clone());
                self.resync_at = Some(Instant::now() + self.resync_delay);
                self.resync_delay = (self.resync_delay * 2).min(self.resync_backoff.backoff_max);
                return Err(e);
            }
        };
        self.sync_error = None;
        self.resync_at = None;
        self.resync_delay = self.resync_backoff.backoff;
        for id in &report.reapplied {
            self.scheduler.mark_dirty(id);
        }
        for id in &report.discarded {
            self.scheduler.cancel(id);
        }
        self.synced_once = true;
        self.last_synced_at = Some(now);
        Ok(report)
    }

    /// Write every queued change now. Reports the first write that failed.
    async fn flush_all(&mut self) -> Result<usize, SyncError> {
        self.scheduler.take_dirty();
        let mut written = 0;
        let mut first_error = None;
        for id in self.reconciler.queued_ids() {
            match self.write_unit(&id).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    async fn flush_unit(&mut self, unit: &str, reason: WriteReason) {
        if reason == WriteReason::Heartbeat && !self.checkpoint(unit) {
            return;
        }
        if let Err(e) = self.write_unit(unit).await {
            debug!(record_id = unit, error = %e, "scheduled write failed");
        }
    }

    /// Queue the heartbeat content for `unit`. Returns false when the
    /// heartbeat has ended.
    fn checkpoint(&mut self, unit: &str) -> bool {
        // A failed write waits for a rollback or resync; beats skip it.
        if self
            .reconciler
            .pending(unit)
            .is_some_and(|p| p.state == MutationState::Failed)
        {
            debug!(record_id = unit, "heartbeat skipped for failed write");
            return false;
        }
        let now = self.clock.now();
        let hook = self.checkpoints.get(unit).cloned();
        let current = self.reconciler.cache().get(unit).cloned();

        let queued = match (current, hook) {
            (None, _) => false,
            (Some(current), Some(hook)) => match hook(&current, now) {
                Some(updated) => self
                    .reconciler
                    .apply_optimistic(Mutation::Insert(updated), now)
                    .map_err(|e| warn!(record_id = unit, error = %e, "checkpoint rejected"))
                    .is_ok(),
                None => false,
            },
            (Some(_), None) => self.reconciler.touch(unit, now),
        };

        if !queued {
            debug!(record_id = unit, "heartbeat ended");
            self.scheduler.stop_heartbeat(unit);
            self.checkpoints.remove(unit);
            return false;
        }
        self.diagnostics.log(
            DiagnosticEventType::HeartbeatCheckpoint,
            DiagnosticSource::Scheduler,
            Some(unit),
            data([]),
        );
        true
    }

    /// Dispatch the queued write for one record. `Ok(false)` when nothing
    /// was queued.
    async fn write_unit(&mut self, unit: &str) -> Result<bool, SyncError> {
        let Some(intent) = self.reconciler.take_write(unit) else {
            return Ok(false);
        };
        let collection = self.reconciler.collection().clone();
        let result = match &intent.op {
            WriteOp::Upsert(record) => self.store.write(&collection, record).await,
            WriteOp::Delete(id) => self.store.delete(&collection, id).await,
        };

        match result {
            Ok(()) => {
                self.reconciler.record_write_success(&intent);
                Ok(true)
            }
            Err(e) => match self.reconciler.record_write_failure(unit, &e) {
                Some(WriteOutcome::Retry { .. }) => {
                    self.scheduler.record_failure(unit);
                    Err(SyncError::Store(e))
                }
                Some(WriteOutcome::Exhausted { attempts }) => {
                    self.scheduler.cancel(unit);
                    self.checkpoints.remove(unit);
                    Err(SyncError::WriteFailure {
                        record_id: unit.to_string(),
                        attempts,
                    })
                }
                None => Err(SyncError::Store(e)),
            },
        }
    }

    fn status(&self) -> SyncStatus {
        match self.connected {
            Some(false) => SyncStatus::Disconnected,
            _ if self.sync_error.as_ref().is_some_and(|e| !e.is_transport()) => SyncStatus::Error,
            _ if !self.synced_once || self.reconciler.in_flight() > 0 => SyncStatus::Syncing,
            _ => SyncStatus::Synced,
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(CollectionView {
            records: self.reconciler.records(),
            failed: self.reconciler.failed(),
            status: self.status(),
            pending: self.reconciler.in_flight(),
            last_synced_at: self.last_synced_at,
            last_error: self.sync_error.clone(),
        });
    }
}

/// Presentation-side API of one collection loop.
#[derive(Clone)]
pub struct CollectionHandle {
    collection: CollectionRef,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<CollectionView>,
}

impl CollectionHandle {
    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::EngineClosed)?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    pub async fn apply(&self, mutation: Mutation) -> Result<String, SyncError> {
        self.request(|reply| Command::Apply { mutation, reply })
            .await?
    }

    /// Create a record with a fresh id.
    pub async fn add(&self, fields: Map<String, Value>) -> Result<String, SyncError> {
        self.apply(Mutation::Insert(EntityRecord::new(fields))).await
    }

    pub async fn upsert(&self, record: EntityRecord) -> Result<String, SyncError> {
        self.apply(Mutation::Insert(record)).await
    }

    pub async fn update_fields(
        &self,
        id: impl Into<String>,
        patch: Map<String, Value>,
    ) -> Result<String, SyncError> {
        self.apply(Mutation::Update {
            id: id.into(),
            patch,
        })
        .await
    }

    pub async fn remove(&self, id: impl Into<String>) -> Result<String, SyncError> {
        self.apply(Mutation::Delete(id.into())).await
    }

    pub async fn resync(&self) -> Result<ResyncReport, SyncError> {
        self.request(|reply| Command::Resync { reply }).await?
    }

    /// Write every queued change immediately; returns the number written.
    pub async fn flush(&self) -> Result<usize, SyncError> {
        self.request(|reply| Command::Flush { reply }).await?
    }

    pub async fn rollback(&self, id: impl Into<String>) -> Result<(), SyncError> {
        let id = id.into();
        self.request(|reply| Command::Rollback { id, reply }).await?
    }

    pub async fn track_heartbeat(
        &self,
        id: impl Into<String>,
        checkpoint: Option<CheckpointFn>,
    ) -> Result<(), SyncError> {
        self.commands
            .send(Command::TrackHeartbeat {
                id: id.into(),
                checkpoint,
            })
            .await
            .map_err(|_| SyncError::EngineClosed)
    }

    pub async fn untrack_heartbeat(&self, id: impl Into<String>) -> Result<(), SyncError> {
        self.commands
            .send(Command::UntrackHeartbeat { id: id.into() })
            .await
            .map_err(|_| SyncError::EngineClosed)
    }

    pub fn view(&self) -> CollectionView {
        self.view.borrow().clone()
    }

    /// Receiver of view updates. Drop it to unsubscribe.
    pub fn subscribe(&self) -> watch::Receiver<CollectionView> {
        self.view.clone()
    }

    /// Wait for a full sync. Fails when the reload itself fails; the loop
    /// keeps retrying in the background.
    pub async fn wait_until_synced(&self) -> Result<CollectionView, SyncError> {
        let mut rx = self.view.clone();
        let view = rx
            .wait_for(|view| matches!(view.status, SyncStatus::Synced | SyncStatus::Error))
            .await
            .map_err(|_| SyncError::EngineClosed)?
            .clone();
        match (view.status, view.last_error.clone()) {
            (SyncStatus::Error, Some(e)) => Err(e),
            _ => Ok(view),
        }
    }

    /// Stop the loop, optionally flushing queued writes first.
    pub async fn shutdown(&self, flush: bool) -> Result<(), SyncError> {
        self.request(|reply| Command::Shutdown { flush, reply })
            .await
    }
}

/// Keeps exactly one collection loop per (owner, collection).
pub struct SyncHub {
    store: Arc<dyn RemoteStore>,
    config: SyncConfig,
    clock: SharedClock,
    diagnostics: Diagnostics,
    handles: Mutex<HashMap<CollectionRef, CollectionHandle>>,
}

impl SyncHub {
    pub fn new(store: Arc<dyn RemoteStore>, config: SyncConfig, clock: SharedClock) -> Self {
        Self {
            store,
            config,
            clock,
            diagnostics: Diagnostics::default(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn store(&self) -> Arc<dyn RemoteStore> {
        Arc::clone(&self.store)
    }

    fn get_or_spawn(
        &self,
        collection: CollectionRef,
        build: impl FnOnce(SyncOptions) -> SyncOptions,
    ) -> Result<CollectionHandle, SyncError> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|_| SyncError::EngineClosed)?;
        if let Some(handle) = handles.get(&collection) {
            if !handle.commands.is_closed() {
                return Ok(handle.clone());
            }
        }
        let options = build(
            SyncOptions::new(self.config.clone(), Arc::clone(&self.clock))
                .with_diagnostics(self.diagnostics.clone()),
        );
        let handle = CollectionSync::spawn(Arc::clone(&self.store), collection.clone(), options);
        handles.insert(collection, handle.clone());
        Ok(handle)
    }

    /// Opening the session collection by name still gets the
    /// running-session guard, so no caller can bypass it.
    pub fn collection(
        &self,
        owner: &str,
        name: &str,
        order: CacheOrder,
    ) -> Result<CollectionHandle, SyncError> {
        let guarded = name == crate::session_sync::SESSIONS_COLLECTION;
        self.get_or_spawn(CollectionRef::new(owner, name), |options| {
            let options = options.with_order(order);
            if guarded {
                options.with_guard(Box::new(RunningSessionGuard))
            } else {
                options
            }
        })
    }

    /// The owner's session collection, guarded against a second running
    /// session per kind group.
    pub fn sessions(&self, owner: &str) -> Result<CollectionHandle, SyncError> {
        self.collection(owner, crate::session_sync::SESSIONS_COLLECTION, CacheOrder::default())
    }

    pub async fn shutdown_all(&self, flush: bool) {
        let handles: Vec<CollectionHandle> = match self.handles.lock() {
            Ok(mut handles) => handles.drain().map(|(_, h)| h).collect(),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(e) = handle.shutdown(flush).await {
                debug!(collection = %handle.collection(), error = %e, "already stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::{MemoryStore, StoreError};

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn gastos() -> CollectionRef {
        CollectionRef::new("alice", "gastos")
    }

    fn spawn(store: &Arc<MemoryStore>) -> CollectionHandle {
        let options = SyncOptions::new(SyncConfig::default(), Arc::new(SystemClock));
        CollectionSync::spawn(store.clone(), gastos(), options)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_sync_loads_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.seed(
            &gastos(),
            vec![EntityRecord::with_id("g1", fields(&[("valor", json!(10))]))],
        );
        let handle = spawn(&store);
        let view = handle.wait_until_synced().await.unwrap();
        assert_eq!(view.records.len(), 1);
        assert!(view.last_synced_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_add_is_visible_before_write() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(&store);
        handle.wait_until_synced().await.unwrap();

        let id = handle.add(fields(&[("valor", json!(42))])).await.unwrap();
        let view = handle.view();
        assert_eq!(view.get(&id).and_then(|r| r.get("valor")), Some(&json!(42)));
        assert_eq!(view.status, SyncStatus::Syncing);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_updates_is_written_once() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(&store);
        handle.wait_until_synced().await.unwrap();

        let id = handle.add(fields(&[("valor", json!(0))])).await.unwrap();
        for i in 1..10 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle
                .update_fields(&id, fields(&[("valor", json!(i))]))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(store.write_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.records(&gastos())[0].get("valor"), Some(&json!(9)));

        let view = handle.wait_until_synced().await.unwrap();
        assert_eq!(view.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_immediately() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(&store);
        handle.wait_until_synced().await.unwrap();

        handle.add(fields(&[("valor", json!(1))])).await.unwrap();
        handle.add(fields(&[("valor", json!(2))])).await.unwrap();
        assert_eq!(handle.flush().await.unwrap(), 2);
        assert_eq!(store.write_count(), 2);
        assert_eq!(handle.flush().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_write_surfaces_failure_and_rolls_back() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(&store);
        handle.wait_until_synced().await.unwrap();

        store.fail_next_writes(100);
        let id = handle.add(fields(&[("valor", json!(5))])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        let view = handle.view();
        assert_eq!(view.failed.len(), 1);
        assert_eq!(view.failed[0].record_id, id);
        assert!(view.get(&id).is_some());

        handle.rollback(&id).await.unwrap();
        let view = handle.view();
        assert!(view.failed.is_empty());
        assert!(view.get(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_change_is_merged() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(&store);
        handle.wait_until_synced().await.unwrap();

        let mut rx = handle.subscribe();
        store.external_write(
            &gastos(),
            EntityRecord::with_id("ext", fields(&[("valor", json!(7))])),
        );
        let view = rx
            .wait_for(|v| v.get("ext").is_some())
            .await
            .unwrap()
            .clone();
        assert_eq!(view.records.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resyncs_and_keeps_local_changes() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(&store);
        handle.wait_until_synced().await.unwrap();

        store.set_offline(true);
        let mut rx = handle.subscribe();
        rx.wait_for(|v| v.status == SyncStatus::Disconnected)
            .await
            .unwrap();

        let id = handle.add(fields(&[("valor", json!(3))])).await.unwrap();
        store.external_write(
            &gastos(),
            EntityRecord::with_id("other", fields(&[("valor", json!(1))])),
        );
        store.set_offline(false);

        let view = handle.wait_until_synced().await.unwrap();
        assert!(view.get(&id).is_some());
        assert!(view.get("other").is_some());
        assert!(store.records(&gastos()).iter().any(|r| r.id == id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_writes_without_changes() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(&store);
        handle.wait_until_synced().await.unwrap();

        let id = handle.add(fields(&[("n", json!(0))])).await.unwrap();
        handle.flush().await.unwrap();
        let before = store.write_count();

        let hook: CheckpointFn = Arc::new(|record: &EntityRecord, _now: DateTime<Utc>| {
            let mut next = record.clone();
            let n = next.get("n").and_then(Value::as_u64).unwrap_or(0);
            next.set("n", json!(n + 1));
            Some(next)
        });
        handle.track_heartbeat(&id, Some(hook)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.write_count(), before + 2);

        handle.untrack_heartbeat(&id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(store.write_count(), before + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_does_not_revive_failed_write() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(&store);
        handle.wait_until_synced().await.unwrap();

        store.fail_next_writes(1000);
        let id = handle.add(fields(&[("n", json!(0))])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(handle.view().failed.len(), 1);

        handle.track_heartbeat(&id, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        let view = handle.view();
        assert_eq!(view.failed.len(), 1);
        assert_eq!(view.failed[0].attempts, SyncConfig::default().max_write_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resync_is_reported_and_retried() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&gastos(), vec![EntityRecord::with_id("g1", Map::new())]);
        store.fail_next_reads(2);
        let handle = spawn(&store);

        let err = handle.wait_until_synced().await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Serialization(_))));
        assert_eq!(handle.view().status, SyncStatus::Error);

        let mut rx = handle.subscribe();
        let view = rx
            .wait_for(|v| v.status == SyncStatus::Synced)
            .await
            .unwrap()
            .clone();
        assert_eq!(view.records.len(), 1);
        assert!(view.last_error.is_none());
        assert!(handle.wait_until_synced().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_and_closes() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(&store);
        handle.wait_until_synced().await.unwrap();

        handle.add(fields(&[("valor", json!(1))])).await.unwrap();
        handle.shutdown(true).await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert!(matches!(
            handle.add(Map::new()).await,
            Err(SyncError::EngineClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_shares_one_loop_per_collection() {
        let store = Arc::new(MemoryStore::new());
        let hub = SyncHub::new(store.clone(), SyncConfig::default(), Arc::new(SystemClock));
        let a = hub.collection("alice", "gastos", CacheOrder::Prepend).unwrap();
        let b = hub.collection("alice", "gastos", CacheOrder::Prepend).unwrap();
        a.wait_until_synced().await.unwrap();

        let id = a.add(fields(&[("valor", json!(1))])).await.unwrap();
        assert!(b.view().get(&id).is_some());
        hub.shutdown_all(false).await;
    }

    #[tokio::test]
    async fn test_session_collection_by_name_keeps_running_guard() {
        let store = Arc::new(MemoryStore::new());
        let hub = SyncHub::new(store.clone(), SyncConfig::default(), Arc::new(SystemClock));
        let generic = hub
            .collection("alice", "sessions", CacheOrder::Prepend)
            .unwrap();
        generic.wait_until_synced().await.unwrap();

        let running = |kind: &str| {
            fields(&[("kind", json!(kind)), ("status", json!("running"))])
        };
        generic.add(running("focus")).await.unwrap();
        let second = generic.add(running("break")).await;
        assert!(matches!(second, Err(SyncError::Rejected(_))));

        let sessions = hub.sessions("alice").unwrap();
        assert_eq!(sessions.view().records.len(), 1);
        hub.shutdown_all(false).await;
    }
}
