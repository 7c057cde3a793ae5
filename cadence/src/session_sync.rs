//! Sessions as entity records in the owner's `sessions` collection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::collection_sync::{CheckpointFn, CollectionHandle};
use crate::error::SyncError;
use crate::store::StoreError;
use crate::types::{EntityRecord, KindGroup, Session, SessionStatus};

pub const SESSIONS_COLLECTION: &str = "sessions";

pub fn session_to_record(session: &Session) -> Result<EntityRecord, SyncError> {
    EntityRecord::from_typed(session).map_err(|e| SyncError::Store(StoreError::from(e)))
}

/// Decode a session record; records that do not decode are skipped.
pub fn record_to_session(record: &EntityRecord) -> Option<Session> {
    match record.to_typed::<Session>() {
        Ok(session) => Some(session),
        Err(e) => {
            warn!(record_id = %record.id, error = %e, "skipping malformed session record");
            None
        }
    }
}

/// Most recently updated session of `group`. On a tie (a phase ending and
/// the next starting in one step) the active session wins.
pub fn latest_session(records: &[EntityRecord], group: KindGroup) -> Option<Session> {
    records
        .iter()
        .filter_map(record_to_session)
        .filter(|s| s.group() == group)
        .max_by_key(|s| (s.updated_at, s.status.is_active()))
}

/// Sessions a live loop should offer its timer after the collection
/// changed: the copy of the current session first, then the newest session
/// of the group when that is a different one.
pub fn sessions_to_follow(
    records: &[EntityRecord],
    current_id: Option<&str>,
    group: KindGroup,
) -> Vec<Session> {
    let mut follow: Vec<Session> = current_id
        .and_then(|id| records.iter().find(|r| r.id == id))
        .and_then(record_to_session)
        .into_iter()
        .collect();
    if let Some(latest) = latest_session(records, group) {
        if Some(latest.id.as_str()) != current_id {
            follow.push(latest);
        }
    }
    follow
}

/// Heartbeat hook for a running session: re-anchor the stored remaining
/// time at the checkpoint instant so a reader never has to trust an old
/// anchor. `updated_at` is kept; the session itself did not change. Ends
/// the heartbeat once the session is no longer running.
pub fn session_checkpoint_fn() -> CheckpointFn {
    Arc::new(|record: &EntityRecord, now: DateTime<Utc>| {
        let mut session = record_to_session(record)?;
        if session.status != SessionStatus::Running {
            return None;
        }
        let remaining = session.remaining_at(now);
        if remaining.is_zero() {
            return None;
        }
        session.remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
        session.anchor_timestamp = now;
        session_to_record(&session).ok()
    })
}

/// Persists timer state through a session collection loop.
#[derive(Clone)]
pub struct SessionSync {
    handle: CollectionHandle,
}

impl SessionSync {
    pub fn new(handle: CollectionHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &CollectionHandle {
        &self.handle
    }

    /// Latest persisted session of `group`, after the first full sync.
    pub async fn load_latest(&self, group: KindGroup) -> Result<Option<Session>, SyncError> {
        let view = self.handle.wait_until_synced().await?;
        Ok(latest_session(&view.records, group))
    }

    /// Upsert the session; running sessions get a heartbeat checkpoint.
    pub async fn persist(&self, session: &Session) -> Result<(), SyncError> {
        self.handle.upsert(session_to_record(session)?).await?;
        if session.status == SessionStatus::Running {
            self.handle
                .track_heartbeat(&session.id, Some(session_checkpoint_fn()))
                .await
        } else {
            self.handle.untrack_heartbeat(&session.id).await
        }
    }

    /// Persist sessions a timer replaced, then the current one.
    pub async fn persist_all(
        &self,
        archived: Vec<Session>,
        current: Option<&Session>,
    ) -> Result<(), SyncError> {
        for session in &archived {
            self.persist(session).await?;
        }
        if let Some(session) = current {
            self.persist(session).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::collection_sync::{CollectionSync, SyncOptions};
    use crate::reconciler::RunningSessionGuard;
    use crate::store::MemoryStore;
    use crate::types::{CollectionRef, SessionKind, SyncConfig};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn session(id: &str, kind: SessionKind, status: SessionStatus, minute: i64) -> Session {
        Session {
            id: id.to_string(),
            kind,
            status,
            anchor_timestamp: t0(),
            remaining_ms: 600_000,
            total_ms: 600_000,
            cycle_index: 0,
            activity: Some("violão".to_string()),
            cycle: None,
            updated_at: t0() + ChronoDuration::minutes(minute),
        }
    }

    #[test]
    fn test_record_conversion_keeps_fields() {
        let original = session("s1", SessionKind::Leisure, SessionStatus::Paused, 0);
        let record = session_to_record(&original).unwrap();
        assert_eq!(record.id, "s1");
        assert_eq!(record.get_str("status"), Some("paused"));
        assert_eq!(record_to_session(&record), Some(original));
    }

    #[test]
    fn test_latest_session_filters_by_group() {
        let records: Vec<EntityRecord> = [
            session("a", SessionKind::Focus, SessionStatus::Expired, 1),
            session("b", SessionKind::Break, SessionStatus::Running, 5),
            session("c", SessionKind::Leisure, SessionStatus::Running, 9),
        ]
        .iter()
        .map(|s| session_to_record(s).unwrap())
        .chain(std::iter::once(EntityRecord::with_id("junk", Default::default())))
        .collect();

        assert_eq!(latest_session(&records, KindGroup::Pomodoro).unwrap().id, "b");
        assert_eq!(latest_session(&records, KindGroup::Leisure).unwrap().id, "c");
        assert!(latest_session(&records, KindGroup::Study).is_none());
    }

    #[test]
    fn test_checkpoint_reanchors_running_session() {
        let hook = session_checkpoint_fn();
        let running = session("s1", SessionKind::Leisure, SessionStatus::Running, 0);
        let now = t0() + ChronoDuration::minutes(4);

        let updated = hook(&session_to_record(&running).unwrap(), now).unwrap();
        let updated = record_to_session(&updated).unwrap();
        assert_eq!(updated.anchor_timestamp, now);
        assert_eq!(updated.remaining_ms, 360_000);
        assert_eq!(updated.remaining_at(now), running.remaining_at(now));
        assert_eq!(updated.updated_at, running.updated_at);

        let paused = session("s2", SessionKind::Leisure, SessionStatus::Paused, 0);
        assert!(hook(&session_to_record(&paused).unwrap(), now).is_none());

        let late = t0() + ChronoDuration::minutes(30);
        assert!(hook(&session_to_record(&running).unwrap(), late).is_none());
    }

    #[test]
    fn test_latest_session_prefers_active_on_tie() {
        let records: Vec<EntityRecord> = [
            session("b1", SessionKind::Break, SessionStatus::Running, 4),
            session("f1", SessionKind::Focus, SessionStatus::Expired, 4),
        ]
        .iter()
        .map(|s| session_to_record(s).unwrap())
        .collect();
        assert_eq!(latest_session(&records, KindGroup::Pomodoro).unwrap().id, "b1");
    }

    #[test]
    fn test_sessions_to_follow_puts_current_first() {
        let records: Vec<EntityRecord> = [
            session("f1", SessionKind::Focus, SessionStatus::Expired, 4),
            session("b1", SessionKind::Break, SessionStatus::Running, 4),
            session("l1", SessionKind::Leisure, SessionStatus::Running, 9),
        ]
        .iter()
        .map(|s| session_to_record(s).unwrap())
        .collect();

        let ids = |follow: Vec<Session>| follow.into_iter().map(|s| s.id).collect::<Vec<_>>();
        assert_eq!(
            ids(sessions_to_follow(&records, Some("f1"), KindGroup::Pomodoro)),
            vec!["f1", "b1"]
        );
        assert_eq!(
            ids(sessions_to_follow(&records, Some("b1"), KindGroup::Pomodoro)),
            vec!["b1"]
        );
        assert_eq!(
            ids(sessions_to_follow(&records, None, KindGroup::Leisure)),
            vec!["l1"]
        );
        assert!(sessions_to_follow(&records, Some("gone"), KindGroup::Study).is_empty());
    }

    fn spawn_sessions(store: &Arc<MemoryStore>) -> SessionSync {
        let options = SyncOptions::new(SyncConfig::default(), Arc::new(SystemClock))
            .with_guard(Box::new(RunningSessionGuard));
        SessionSync::new(CollectionSync::spawn(
            store.clone(),
            CollectionRef::new("alice", SESSIONS_COLLECTION),
            options,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_and_load_latest() {
        let store = Arc::new(MemoryStore::new());
        let sync = spawn_sessions(&store);
        assert!(sync.load_latest(KindGroup::Leisure).await.unwrap().is_none());

        let old = session("old", SessionKind::Leisure, SessionStatus::Cancelled, 0);
        let new = session("new", SessionKind::Leisure, SessionStatus::Paused, 3);
        sync.persist_all(vec![old], Some(&new)).await.unwrap();
        sync.handle().flush().await.unwrap();

        assert_eq!(store.write_count(), 2);
        let latest = sync.load_latest(KindGroup::Leisure).await.unwrap().unwrap();
        assert_eq!(latest.id, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_running_session_in_group_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let sync = spawn_sessions(&store);
        sync.handle().wait_until_synced().await.unwrap();

        let focus = session("f1", SessionKind::Focus, SessionStatus::Running, 0);
        sync.persist(&focus).await.unwrap();

        let brk = session("b1", SessionKind::Break, SessionStatus::Running, 1);
        assert!(matches!(
            sync.persist(&brk).await,
            Err(SyncError::Rejected(_))
        ));
        let leisure = session("l1", SessionKind::Leisure, SessionStatus::Running, 1);
        assert!(sync.persist(&leisure).await.is_ok());
    }
}
