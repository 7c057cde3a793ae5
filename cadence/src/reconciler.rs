//! Merges optimistic local mutations and remote change events into one
//! collection cache.
//!
//! Every local write becomes a [`PendingMutation`] keyed by record id; later
//! writes to the same record coalesce into it. A pending mutation moves
//! through `Queued` (changed locally since the last dispatched write),
//! `Applied` (written, waiting for the echo) and `Failed` (retries
//! exhausted). Confirmation is transient: the mutation is dropped.
//!
//! Tie-break: once a write is in flight, the next change event for that
//! record confirms it and the event's content wins, even if it is an older
//! echo. A `Queued` mutation keeps its local value only against echoes of
//! writes this reconciler dispatched; any other event is an external change
//! and replaces it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::cache::{CacheOrder, EntityCollectionCache};
use crate::clock::elapsed_since;
use crate::diagnostics::{data, Diagnostics};
use crate::error::SyncError;
use crate::store::{ChangeEvent, RemoteStore, StoreError};
use crate::types::{
    CollectionRef, DiagnosticEventType, DiagnosticSource, EntityRecord, MutationState,
    SessionKind, SessionStatus, SyncConfig,
};

/// A local change requested by the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Create a record, or replace it if the id already exists.
    Insert(EntityRecord),
    /// Overlay fields onto an existing record.
    Update { id: String, patch: Map<String, Value> },
    Delete(String),
}

impl Mutation {
    pub fn record_id(&self) -> &str {
        match self {
            Mutation::Insert(record) => &record.id,
            Mutation::Update { id, .. } | Mutation::Delete(id) => id,
        }
    }
}

/// A local optimistic write awaiting confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub record_id: String,
    /// Desired remote state; `None` deletes the record.
    pub desired: Option<EntityRecord>,
    pub state: MutationState,
    /// When the record last changed locally.
    pub queued_at: DateTime<Utc>,
    /// Failed write attempts for the current desired state.
    pub attempts: u32,
    /// Cache content before the first unconfirmed local change.
    pub previous: Option<EntityRecord>,
    /// Whether any write for this mutation has reached the store.
    pub dispatched: bool,
    /// Contents of dispatched writes whose echo has not arrived, oldest first.
    pub unechoed: Vec<EntityRecord>,
    pub last_error: Option<String>,
}

const MAX_UNECHOED: usize = 8;

/// What a write for one record should do
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Upsert(EntityRecord),
    Delete(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteIntent {
    pub record_id: String,
    pub op: WriteOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Try again at the next scheduled tick.
    Retry { attempts: u32 },
    /// Retry budget spent; the mutation is now `Failed`.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The event matched an in-flight write.
    Confirmed,
    /// A locally newer value was kept.
    Deferred,
    /// External change merged into the cache.
    Merged,
    /// Nothing to do (e.g. delete of an unknown record).
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub records: usize,
    pub reapplied: Vec<String>,
    pub discarded: Vec<String>,
}

/// Check evaluated before a mutation has any local effect.
pub trait MutationGuard: Send + Sync {
    fn check(&self, cache: &EntityCollectionCache, candidate: &EntityRecord) -> Result<(), String>;
}

/// Rejects a second running session in the same kind group.
///
/// Works on session records (`kind` and `status` fields); other records pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningSessionGuard;

fn running_kind(record: &EntityRecord) -> Option<SessionKind> {
    let status: SessionStatus = record.get_str("status")?.parse().ok()?;
    if status != SessionStatus::Running {
        return None;
    }
    record.get_str("kind")?.parse().ok()
}

impl MutationGuard for RunningSessionGuard {
    fn check(&self, cache: &EntityCollectionCache, candidate: &EntityRecord) -> Result<(), String> {
        let Some(kind) = running_kind(candidate) else {
            return Ok(());
        };
        let group = kind.group();
        let conflict = cache
            .iter()
            .filter(|r| r.id != candidate.id)
            .any(|r| running_kind(r).is_some_and(|k| k.group() == group));
        if conflict {
            Err(format!("a {group} session is already running"))
        } else {
            Ok(())
        }
    }
}

pub struct Reconciler {
    cache: EntityCollectionCache,
    pending: IndexMap<String, PendingMutation>,
    guards: Vec<Box<dyn MutationGuard>>,
    staleness: Duration,
    max_write_attempts: u32,
    diagnostics: Diagnostics,
}

impl Reconciler {
    pub fn new(collection: CollectionRef, order: CacheOrder, config: &SyncConfig) -> Self {
        Self {
            cache: EntityCollectionCache::new(collection, order),
            pending: IndexMap::new(),
            guards: Vec::new(),
            staleness: config.staleness(),
            max_write_attempts: config.max_write_attempts.max(1),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn with_guard(mut self, guard: Box<dyn MutationGuard>) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn cache(&self) -> &EntityCollectionCache {
        &self.cache
    }

    pub fn collection(&self) -> &CollectionRef {
        self.cache.collection()
    }

    pub fn records(&self) -> Vec<EntityRecord> {
        self.cache.records()
    }

    pub fn pending(&self, record_id: &str) -> Option<&PendingMutation> {
        self.pending.get(record_id)
    }

    /// Pending mutations not yet failed.
    pub fn in_flight(&self) -> usize {
        self.pending
            .values()
            .filter(|p| p.state != MutationState::Failed)
            .count()
    }

    pub fn has_queued(&self) -> bool {
        self.pending
            .values()
            .any(|p| p.state == MutationState::Queued)
    }

    pub fn queued_ids(&self) -> Vec<String> {
        self.pending
            .values()
            .filter(|p| p.state == MutationState::Queued)
            .map(|p| p.record_id.clone())
            .collect()
    }

    pub fn failed(&self) -> Vec<PendingMutation> {
        self.pending
            .values()
            .filter(|p| p.state == MutationState::Failed)
            .cloned()
            .collect()
    }

    fn check_guards(&self, candidate: &EntityRecord) -> Result<(), SyncError> {
        for guard in &self.guards {
            guard
                .check(&self.cache, candidate)
                .map_err(SyncError::Rejected)?;
        }
        Ok(())
    }

    /// Apply a local change to the cache immediately and queue it for
    /// persistence. Returns the affected record id.
    pub fn apply_optimistic(
        &mut self,
        mutation: Mutation,
        now: DateTime<Utc>,
    ) -> Result<String, SyncError> {
        match mutation {
            Mutation::Insert(record) => {
                self.check_guards(&record)?;
                let id = record.id.clone();
                let previous = self.cache.upsert(record.clone());
                self.queue(id.clone(), Some(record), previous, now);
                Ok(id)
            }
            Mutation::Update { id, patch } => {
                let mut updated = self
                    .cache
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| SyncError::NotFound(id.clone()))?;
                updated.merge(patch);
                self.check_guards(&updated)?;
                let previous = self.cache.upsert(updated.clone());
                self.queue(id.clone(), Some(updated), previous, now);
                Ok(id)
            }
            Mutation::Delete(id) => {
                let previous = self
                    .cache
                    .remove(&id)
                    .ok_or_else(|| SyncError::NotFound(id.clone()))?;

                // A record created locally and never written needs no remote delete.
                let never_written = self
                    .pending
                    .get(&id)
                    .is_some_and(|p| !p.dispatched && p.previous.is_none());
                if never_written {
                    self.pending.shift_remove(&id);
                    debug!(record_id = %id, "dropped unsent insert");
                    return Ok(id);
                }

                self.queue(id.clone(), None, Some(previous), now);
                Ok(id)
            }
        }
    }

    fn queue(
        &mut self,
        id: String,
        desired: Option<EntityRecord>,
        previous: Option<EntityRecord>,
        now: DateTime<Utc>,
    ) {
        let operation = if desired.is_some() { "upsert" } else { "delete" };
        match self.pending.get_mut(&id) {
            Some(pending) => {
                pending.desired = desired;
                pending.state = MutationState::Queued;
                pending.queued_at = now;
                pending.attempts = 0;
                pending.last_error = None;
            }
            None => {
                self.pending.insert(
                    id.clone(),
                    PendingMutation {
                        record_id: id.clone(),
                        desired,
                        state: MutationState::Queued,
                        queued_at: now,
                        attempts: 0,
                        previous,
                        dispatched: false,
                        unechoed: Vec::new(),
                        last_error: None,
                    },
                );
            }
        }
        self.diagnostics.log(
            DiagnosticEventType::MutationQueued,
            DiagnosticSource::Reconciler,
            Some(&id),
            data([("operation", json!(operation))]),
        );
    }

    /// Mark the cached record dirty so its current content is written again
    /// (heartbeat checkpoints). Returns whether a write is queued. A failed
    /// mutation is left alone until it is rolled back or resynced.
    pub fn touch(&mut self, record_id: &str, now: DateTime<Utc>) -> bool {
        match self.pending.get(record_id).map(|p| p.state) {
            Some(MutationState::Queued) => return true,
            Some(MutationState::Failed) => return false,
            _ => {}
        }
        let Some(record) = self.cache.get(record_id).cloned() else {
            return false;
        };
        self.queue(record_id.to_string(), Some(record.clone()), Some(record), now);
        true
    }

    /// The write to dispatch for `record_id`, if one is queued.
    pub fn take_write(&self, record_id: &str) -> Option<WriteIntent> {
        let pending = self.pending.get(record_id)?;
        if pending.state != MutationState::Queued {
            return None;
        }
        let op = match &pending.desired {
            Some(record) => WriteOp::Upsert(record.clone()),
            None => WriteOp::Delete(record_id.to_string()),
        };
        Some(WriteIntent {
            record_id: record_id.to_string(),
            op,
        })
    }

    pub fn record_write_success(&mut self, intent: &WriteIntent) {
        let Some(pending) = self.pending.get_mut(&intent.record_id) else {
            return;
        };
        let still_current = match (&intent.op, &pending.desired) {
            (WriteOp::Upsert(written), Some(desired)) => written == desired,
            (WriteOp::Delete(_), None) => true,
            _ => false,
        };
        pending.dispatched = true;
        pending.attempts = 0;
        pending.last_error = None;
        if let WriteOp::Upsert(written) = &intent.op {
            if pending.unechoed.len() >= MAX_UNECHOED {
                pending.unechoed.remove(0);
            }
            pending.unechoed.push(written.clone());
        }
        if still_current {
            pending.state = MutationState::Applied;
        }
        self.diagnostics.log(
            DiagnosticEventType::WriteFlushed,
            DiagnosticSource::Scheduler,
            Some(&intent.record_id),
            data([("current", json!(still_current))]),
        );
    }

    pub fn record_write_failure(&mut self, record_id: &str, error: &StoreError) -> Option<WriteOutcome> {
        let max_attempts = self.max_write_attempts;
        let pending = self.pending.get_mut(record_id)?;
        pending.attempts += 1;
        pending.last_error = Some(error.to_string());
        let attempts = pending.attempts;

        if attempts >= max_attempts {
            pending.state = MutationState::Failed;
            warn!(record_id, attempts, error = %error, "write retries exhausted");
            self.diagnostics.log(
                DiagnosticEventType::MutationFailed,
                DiagnosticSource::Reconciler,
                Some(record_id),
                data([("attempts", json!(attempts)), ("error", json!(error.to_string()))]),
            );
            Some(WriteOutcome::Exhausted { attempts })
        } else {
            debug!(record_id, attempts, error = %error, "write failed, will retry");
            self.diagnostics.log(
                DiagnosticEventType::WriteFailed,
                DiagnosticSource::Scheduler,
                Some(record_id),
                data([("attempts", json!(attempts)), ("error", json!(error.to_string()))]),
            );
            Some(WriteOutcome::Retry { attempts })
        }
    }

    /// Merge one change event.
    pub fn on_change_event(&mut self, event: ChangeEvent) -> EventOutcome {
        let record_id = event.record_id().to_string();
        let state = self.pending.get(&record_id).map(|p| p.state);

        let outcome = match (state, event) {
            // A remote delete always removes the record; writing local
            // changes afterwards would resurrect it.
            (Some(_), ChangeEvent::Delete { id, .. }) => {
                let confirmed = self
                    .pending
                    .shift_remove(&id)
                    .is_some_and(|p| p.state == MutationState::Applied && p.desired.is_none());
                self.cache.remove(&id);
                if confirmed {
                    EventOutcome::Confirmed
                } else {
                    EventOutcome::Merged
                }
            }
            (Some(MutationState::Queued), ChangeEvent::Insert { record, .. } | ChangeEvent::Update { record, .. }) => {
                if self.take_echo(&record_id, &record) {
                    EventOutcome::Deferred
                } else {
                    info!(record_id = %record_id, "external change replaces queued local change");
                    self.pending.shift_remove(&record_id);
                    self.cache.upsert(record);
                    EventOutcome::Merged
                }
            }
            (Some(MutationState::Applied), ChangeEvent::Insert { record, .. } | ChangeEvent::Update { record, .. }) => {
                self.pending.shift_remove(&record_id);
                self.cache.upsert(record);
                EventOutcome::Confirmed
            }
            (Some(_), ChangeEvent::Insert { record, .. } | ChangeEvent::Update { record, .. }) => {
                // Failed (or transient Confirmed): server state is authoritative.
                self.pending.shift_remove(&record_id);
                self.cache.upsert(record);
                EventOutcome::Merged
            }
            (None, ChangeEvent::Insert { record, .. } | ChangeEvent::Update { record, .. }) => {
                self.cache.upsert(record);
                EventOutcome::Merged
            }
            (None, ChangeEvent::Delete { id, .. }) => {
                if self.cache.remove(&id).is_some() {
                    EventOutcome::Merged
                } else {
                    EventOutcome::Ignored
                }
            }
        };

        let event_type = match outcome {
            EventOutcome::Confirmed => DiagnosticEventType::MutationConfirmed,
            _ => DiagnosticEventType::EventMerged,
        };
        self.diagnostics.log(
            event_type,
            DiagnosticSource::Reconciler,
            Some(&record_id),
            data([("outcome", json!(format!("{outcome:?}").to_lowercase()))]),
        );
        outcome
    }

    /// Whether `record` is the echo of a write dispatched for `record_id`.
    /// Consumes that echo and any older ones.
    fn take_echo(&mut self, record_id: &str, record: &EntityRecord) -> bool {
        let Some(pending) = self.pending.get_mut(record_id) else {
            return false;
        };
        match pending.unechoed.iter().position(|written| written == record) {
            Some(index) => {
                pending.unechoed = pending.unechoed.split_off(index + 1);
                true
            }
            None => false,
        }
    }

    /// Reload the collection from the store and rebuild the cache.
    pub async fn resync(
        &mut self,
        store: &dyn RemoteStore,
        now: DateTime<Utc>,
    ) -> Result<ResyncReport, SyncError> {
        let snapshot = store.read(self.cache.collection()).await?;
        Ok(self.apply_snapshot(snapshot, now))
    }

    /// Replace the cache with `snapshot`, then re-apply pending mutations
    /// younger than the staleness threshold. Older ones are treated as lost
    /// writes and discarded.
    pub fn apply_snapshot(&mut self, snapshot: Vec<EntityRecord>, now: DateTime<Utc>) -> ResyncReport {
        self.cache.replace_all(snapshot);

        let mut report = ResyncReport::default();
        let pending = std::mem::take(&mut self.pending);
        for (id, mut mutation) in pending {
            if mutation.state == MutationState::Applied {
                // Delivered; the snapshot already reflects it or something newer.
                continue;
            }

            let age = elapsed_since(mutation.queued_at, now);
            if age > self.staleness {
                warn!(record_id = %id, age_secs = age.as_secs(), "discarding stale pending mutation");
                self.diagnostics.log(
                    DiagnosticEventType::StaleDiscarded,
                    DiagnosticSource::Reconciler,
                    Some(&id),
                    data([("ageSecs", json!(age.as_secs()))]),
                );
                report.discarded.push(id);
                continue;
            }

            match &mutation.desired {
                Some(record) => {
                    mutation.previous = self.cache.upsert(record.clone());
                }
                None => {
                    mutation.previous = self.cache.remove(&id);
                }
            }
            mutation.state = MutationState::Queued;
            mutation.attempts = 0;
            report.reapplied.push(id.clone());
            self.pending.insert(id, mutation);
        }

        report.records = self.cache.len();
        info!(
            collection = %self.cache.collection(),
            records = report.records,
            reapplied = report.reapplied.len(),
            discarded = report.discarded.len(),
            "resynced collection"
        );
        self.diagnostics.log(
            DiagnosticEventType::Resync,
            DiagnosticSource::Reconciler,
            None,
            data([
                ("records", json!(report.records)),
                ("reapplied", json!(report.reapplied.len())),
                ("discarded", json!(report.discarded.len())),
            ]),
        );
        report
    }

    /// Undo a failed mutation: restore the pre-mutation record and drop it.
    pub fn rollback(&mut self, record_id: &str) -> Result<(), SyncError> {
        let state = self
            .pending
            .get(record_id)
            .map(|p| p.state)
            .ok_or_else(|| SyncError::NotFound(record_id.to_string()))?;
        if state != MutationState::Failed {
            return Err(SyncError::Rejected(format!(
                "only failed mutations can be rolled back (record {record_id} is {state})"
            )));
        }
        if let Some(mutation) = self.pending.shift_remove(record_id) {
            match mutation.previous {
                Some(previous) => {
                    self.cache.upsert(previous);
                }
                None => {
                    self.cache.remove(record_id);
                }
            }
        }
        info!(record_id, "rolled back failed mutation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn collection() -> CollectionRef {
        CollectionRef::new("alice", "gastos")
    }

    fn reconciler() -> Reconciler {
        let config = SyncConfig {
            staleness_secs: 120,
            max_write_attempts: 3,
            ..SyncConfig::default()
        };
        Reconciler::new(collection(), CacheOrder::Append, &config)
    }

    fn record(id: &str, value: Value) -> EntityRecord {
        EntityRecord::with_id(id, value.as_object().cloned().unwrap())
    }

    fn update_event(record: EntityRecord) -> ChangeEvent {
        ChangeEvent::Update {
            collection: "gastos".to_string(),
            record,
        }
    }

    fn insert_event(record: EntityRecord) -> ChangeEvent {
        ChangeEvent::Insert {
            collection: "gastos".to_string(),
            record,
        }
    }

    fn dispatch(reconciler: &mut Reconciler, id: &str) -> WriteIntent {
        let intent = reconciler.take_write(id).unwrap();
        reconciler.record_write_success(&intent);
        intent
    }

    #[test]
    fn test_apply_optimistic_insert_is_visible_immediately() {
        let mut r = reconciler();
        let id = r
            .apply_optimistic(Mutation::Insert(record("g1", json!({"valor": 10}))), t0())
            .unwrap();
        assert_eq!(id, "g1");
        assert_eq!(r.records().len(), 1);
        assert_eq!(r.pending("g1").unwrap().state, MutationState::Queued);
    }

    #[test]
    fn test_update_and_delete_of_missing_record_fail() {
        let mut r = reconciler();
        let update = Mutation::Update {
            id: "nope".to_string(),
            patch: Map::new(),
        };
        assert!(matches!(r.apply_optimistic(update, t0()), Err(SyncError::NotFound(_))));
        assert!(matches!(
            r.apply_optimistic(Mutation::Delete("nope".to_string()), t0()),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_echo_of_applied_write_confirms_without_duplicate() {
        let mut r = reconciler();
        r.apply_optimistic(Mutation::Insert(record("g1", json!({"valor": 10}))), t0())
            .unwrap();
        dispatch(&mut r, "g1");
        assert_eq!(r.pending("g1").unwrap().state, MutationState::Applied);

        let outcome = r.on_change_event(insert_event(record("g1", json!({"valor": 10}))));
        assert_eq!(outcome, EventOutcome::Confirmed);
        assert!(r.pending("g1").is_none());
        assert_eq!(r.records().len(), 1);
    }

    #[test]
    fn test_event_wins_over_in_flight_write() {
        let mut r = reconciler();
        r.apply_optimistic(Mutation::Insert(record("g1", json!({"valor": 10}))), t0())
            .unwrap();
        dispatch(&mut r, "g1");

        let outcome = r.on_change_event(update_event(record("g1", json!({"valor": 99}))));
        assert_eq!(outcome, EventOutcome::Confirmed);
        assert_eq!(r.cache().get("g1").unwrap().get("valor"), Some(&json!(99)));
    }

    #[test]
    fn test_queued_local_change_is_kept_over_older_echo() {
        let mut r = reconciler();
        r.apply_optimistic(Mutation::Insert(record("g1", json!({"valor": 1}))), t0())
            .unwrap();
        dispatch(&mut r, "g1");
        let patch = json!({"valor": 2}).as_object().cloned().unwrap();
        r.apply_optimistic(
            Mutation::Update {
                id: "g1".to_string(),
                patch,
            },
            t0() + secs(1),
        )
        .unwrap();

        // Echo of the first write arrives after the second local change.
        let outcome = r.on_change_event(update_event(record("g1", json!({"valor": 1}))));
        assert_eq!(outcome, EventOutcome::Deferred);
        assert_eq!(r.cache().get("g1").unwrap().get("valor"), Some(&json!(2)));
        assert_eq!(r.pending("g1").unwrap().state, MutationState::Queued);

        // The second write is then dispatched and confirmed.
        dispatch(&mut r, "g1");
        let outcome = r.on_change_event(update_event(record("g1", json!({"valor": 2}))));
        assert_eq!(outcome, EventOutcome::Confirmed);
        assert!(r.pending("g1").is_none());
    }

    #[test]
    fn test_external_change_replaces_queued_local_change() {
        let mut r = reconciler();
        r.on_change_event(insert_event(record("g1", json!({"valor": 1}))));
        let patch = json!({"valor": 2}).as_object().cloned().unwrap();
        r.apply_optimistic(
            Mutation::Update {
                id: "g1".to_string(),
                patch,
            },
            t0(),
        )
        .unwrap();

        let outcome = r.on_change_event(update_event(record("g1", json!({"valor": 99}))));
        assert_eq!(outcome, EventOutcome::Merged);
        assert_eq!(r.cache().get("g1").unwrap().get("valor"), Some(&json!(99)));
        assert!(r.pending("g1").is_none());
        assert!(r.take_write("g1").is_none());
    }

    #[test]
    fn test_external_change_after_dispatch_replaces_newer_queued_change() {
        let mut r = reconciler();
        r.apply_optimistic(Mutation::Insert(record("g1", json!({"valor": 1}))), t0())
            .unwrap();
        dispatch(&mut r, "g1");
        let patch = json!({"valor": 2}).as_object().cloned().unwrap();
        r.apply_optimistic(
            Mutation::Update {
                id: "g1".to_string(),
                patch,
            },
            t0() + secs(1),
        )
        .unwrap();

        // Our own echo is deferred, a different value is not.
        assert_eq!(
            r.on_change_event(update_event(record("g1", json!({"valor": 1})))),
            EventOutcome::Deferred
        );
        assert_eq!(
            r.on_change_event(update_event(record("g1", json!({"valor": 1})))),
            EventOutcome::Merged
        );
        assert_eq!(r.cache().get("g1").unwrap().get("valor"), Some(&json!(1)));
        assert!(r.pending("g1").is_none());
    }

    #[test]
    fn test_external_events_merge_directly() {
        let mut r = reconciler();
        assert_eq!(
            r.on_change_event(insert_event(record("x", json!({"valor": 1})))),
            EventOutcome::Merged
        );
        assert_eq!(
            r.on_change_event(update_event(record("x", json!({"valor": 2})))),
            EventOutcome::Merged
        );
        assert_eq!(r.records().len(), 1);
        assert_eq!(
            r.on_change_event(ChangeEvent::Delete {
                collection: "gastos".to_string(),
                id: "x".to_string()
            }),
            EventOutcome::Merged
        );
        assert_eq!(
            r.on_change_event(ChangeEvent::Delete {
                collection: "gastos".to_string(),
                id: "x".to_string()
            }),
            EventOutcome::Ignored
        );
        assert!(r.records().is_empty());
    }

    #[test]
    fn test_interleaved_mutations_and_events_never_duplicate_ids() {
        let mut r = reconciler();
        for step in 0..20i64 {
            let value = json!({"valor": step});
            if step % 3 == 0 {
                r.on_change_event(insert_event(record("same", value)));
            } else {
                r.apply_optimistic(Mutation::Insert(record("same", value)), t0() + secs(step))
                    .unwrap();
                if step % 2 == 0 {
                    dispatch(&mut r, "same");
                }
            }
            let ids: Vec<String> = r.records().into_iter().map(|rec| rec.id).collect();
            assert_eq!(ids, vec!["same".to_string()]);
        }
    }

    #[test]
    fn test_delete_of_unsent_insert_drops_pending() {
        let mut r = reconciler();
        r.apply_optimistic(Mutation::Insert(record("g1", json!({}))), t0())
            .unwrap();
        r.apply_optimistic(Mutation::Delete("g1".to_string()), t0())
            .unwrap();
        assert!(r.pending("g1").is_none());
        assert!(r.take_write("g1").is_none());
    }

    #[test]
    fn test_delete_of_existing_record_queues_delete_write() {
        let mut r = reconciler();
        r.on_change_event(insert_event(record("g1", json!({}))));
        r.apply_optimistic(Mutation::Delete("g1".to_string()), t0())
            .unwrap();
        assert_eq!(
            r.take_write("g1").unwrap().op,
            WriteOp::Delete("g1".to_string())
        );
    }

    #[test]
    fn test_write_failures_exhaust_into_failed() {
        let mut r = reconciler();
        r.apply_optimistic(Mutation::Insert(record("g1", json!({}))), t0())
            .unwrap();
        let err = StoreError::Rejected("quota".to_string());

        assert_eq!(
            r.record_write_failure("g1", &err),
            Some(WriteOutcome::Retry { attempts: 1 })
        );
        assert_eq!(
            r.record_write_failure("g1", &err),
            Some(WriteOutcome::Retry { attempts: 2 })
        );
        assert_eq!(
            r.record_write_failure("g1", &err),
            Some(WriteOutcome::Exhausted { attempts: 3 })
        );

        let failed = r.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("Write rejected by store: quota"));
        assert!(r.take_write("g1").is_none());
        // The optimistic value stays visible until the user decides.
        assert!(r.cache().contains("g1"));
    }

    #[test]
    fn test_rollback_restores_previous_record() {
        let mut r = reconciler();
        r.on_change_event(insert_event(record("g1", json!({"valor": 1}))));
        let patch = json!({"valor": 5}).as_object().cloned().unwrap();
        r.apply_optimistic(
            Mutation::Update {
                id: "g1".to_string(),
                patch,
            },
            t0(),
        )
        .unwrap();

        assert!(matches!(r.rollback("g1"), Err(SyncError::Rejected(_))));

        let err = StoreError::Transport("offline".to_string());
        for _ in 0..3 {
            r.record_write_failure("g1", &err);
        }
        r.rollback("g1").unwrap();
        assert_eq!(r.cache().get("g1").unwrap().get("valor"), Some(&json!(1)));
        assert!(r.pending("g1").is_none());
        assert!(matches!(r.rollback("g1"), Err(SyncError::NotFound(_))));
    }

    #[test]
    fn test_rollback_of_failed_insert_removes_record() {
        let mut r = reconciler();
        r.apply_optimistic(Mutation::Insert(record("g1", json!({}))), t0())
            .unwrap();
        let err = StoreError::Rejected("rls".to_string());
        for _ in 0..3 {
            r.record_write_failure("g1", &err);
        }
        r.rollback("g1").unwrap();
        assert!(r.records().is_empty());
    }

    #[test]
    fn test_snapshot_discards_stale_and_reapplies_fresh() {
        let mut r = reconciler();
        r.apply_optimistic(Mutation::Insert(record("old", json!({"valor": 1}))), t0())
            .unwrap();
        r.apply_optimistic(
            Mutation::Insert(record("fresh", json!({"valor": 2}))),
            t0() + secs(200),
        )
        .unwrap();

        let snapshot = vec![record("remote", json!({"valor": 3}))];
        let report = r.apply_snapshot(snapshot, t0() + secs(250));

        assert_eq!(report.discarded, vec!["old".to_string()]);
        assert_eq!(report.reapplied, vec!["fresh".to_string()]);
        assert_eq!(report.records, 2);
        assert!(!r.cache().contains("old"));
        assert!(r.cache().contains("fresh"));
        assert!(r.cache().contains("remote"));
        assert_eq!(r.queued_ids(), vec!["fresh".to_string()]);
    }

    #[test]
    fn test_snapshot_drops_applied_mutations() {
        let mut r = reconciler();
        r.apply_optimistic(Mutation::Insert(record("g1", json!({"valor": 1}))), t0())
            .unwrap();
        dispatch(&mut r, "g1");

        let report = r.apply_snapshot(vec![record("g1", json!({"valor": 7}))], t0() + secs(1));
        assert!(report.reapplied.is_empty());
        assert!(r.pending("g1").is_none());
        assert_eq!(r.cache().get("g1").unwrap().get("valor"), Some(&json!(7)));
    }

    #[test]
    fn test_snapshot_retries_young_failed_mutation() {
        let mut r = reconciler();
        r.apply_optimistic(Mutation::Insert(record("g1", json!({}))), t0())
            .unwrap();
        let err = StoreError::Transport("offline".to_string());
        for _ in 0..3 {
            r.record_write_failure("g1", &err);
        }
        assert_eq!(r.failed().len(), 1);

        let report = r.apply_snapshot(Vec::new(), t0() + secs(30));
        assert_eq!(report.reapplied, vec!["g1".to_string()]);
        assert!(r.failed().is_empty());
        assert!(r.take_write("g1").is_some());
    }

    #[test]
    fn test_remote_delete_beats_queued_update() {
        let mut r = reconciler();
        r.on_change_event(insert_event(record("g1", json!({"valor": 1}))));
        let patch = json!({"valor": 2}).as_object().cloned().unwrap();
        r.apply_optimistic(
            Mutation::Update {
                id: "g1".to_string(),
                patch,
            },
            t0(),
        )
        .unwrap();

        let outcome = r.on_change_event(ChangeEvent::Delete {
            collection: "gastos".to_string(),
            id: "g1".to_string(),
        });
        assert_eq!(outcome, EventOutcome::Merged);
        assert!(r.records().is_empty());
        assert!(r.pending("g1").is_none());
    }

    #[test]
    fn test_touch_requeues_cached_record() {
        let mut r = reconciler();
        r.on_change_event(insert_event(record("s1", json!({"status": "running"}))));
        assert!(r.touch("s1", t0()));
        assert!(matches!(
            r.take_write("s1").unwrap().op,
            WriteOp::Upsert(_)
        ));
        assert!(!r.touch("missing", t0()));
    }

    #[test]
    fn test_touch_leaves_failed_mutation_alone() {
        let mut r = reconciler();
        r.apply_optimistic(Mutation::Insert(record("s1", json!({"status": "running"}))), t0())
            .unwrap();
        let err = StoreError::Transport("offline".to_string());
        for _ in 0..3 {
            r.record_write_failure("s1", &err);
        }

        assert!(!r.touch("s1", t0() + secs(30)));
        let pending = r.pending("s1").unwrap();
        assert_eq!(pending.state, MutationState::Failed);
        assert_eq!(pending.attempts, 3);
        assert!(r.take_write("s1").is_none());
    }

    fn session_record(id: &str, kind: &str, status: &str) -> EntityRecord {
        record(id, json!({"kind": kind, "status": status}))
    }

    #[test]
    fn test_running_session_guard_rejects_second_in_group() {
        let mut r = reconciler().with_guard(Box::new(RunningSessionGuard));
        r.apply_optimistic(
            Mutation::Insert(session_record("s1", "focus", "running")),
            t0(),
        )
        .unwrap();

        let second = r.apply_optimistic(
            Mutation::Insert(session_record("s2", "break", "running")),
            t0(),
        );
        assert!(matches!(second, Err(SyncError::Rejected(_))));

        let running: Vec<_> = r
            .records()
            .into_iter()
            .filter(|rec| rec.get_str("status") == Some("running"))
            .collect();
        assert_eq!(running.len(), 1);
        assert!(!r.cache().contains("s2"));

        // Other groups and updates of the running session itself pass.
        r.apply_optimistic(
            Mutation::Insert(session_record("l1", "leisure", "running")),
            t0(),
        )
        .unwrap();
        r.apply_optimistic(
            Mutation::Insert(session_record("s1", "focus", "running")),
            t0(),
        )
        .unwrap();
    }

    #[test]
    fn test_running_session_guard_allows_after_expiry() {
        let mut r = reconciler().with_guard(Box::new(RunningSessionGuard));
        r.apply_optimistic(
            Mutation::Insert(session_record("s1", "focus", "running")),
            t0(),
        )
        .unwrap();
        let patch = json!({"status": "expired"}).as_object().cloned().unwrap();
        r.apply_optimistic(
            Mutation::Update {
                id: "s1".to_string(),
                patch,
            },
            t0(),
        )
        .unwrap();
        r.apply_optimistic(
            Mutation::Insert(session_record("s2", "break", "running")),
            t0(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_resync_reads_from_store() {
        let store = MemoryStore::new();
        store.seed(&collection(), vec![record("a", json!({})), record("b", json!({}))]);

        let mut r = reconciler();
        let report = r.resync(&store, t0()).await.unwrap();
        assert_eq!(report.records, 2);

        store.set_offline(true);
        assert!(r.resync(&store, t0()).await.is_err());
    }
}
