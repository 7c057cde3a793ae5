//! Drift-corrected session timer.
//!
//! States: `idle -> running <-> paused`, `running -> expired`,
//! `running/paused -> cancelled`. Remaining time is never decremented per
//! tick: it is stored as of an anchor timestamp and recomputed from the
//! wall clock whenever it is read.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{elapsed_since, SharedClock};
use crate::diagnostics::{data, Diagnostics};
use crate::error::TimerError;
use crate::registry::{SessionLease, SessionRegistry};
use crate::types::{
    CycleProgress, DiagnosticEventType, DiagnosticSource, Session, SessionKind, SessionStatus,
    SessionView,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Start,
    Pause,
    Resume,
    Cancel,
    Restart,
    Restore,
    Complete,
    Skip,
}

impl fmt::Display for TimerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerAction::Start => write!(f, "start"),
            TimerAction::Pause => write!(f, "pause"),
            TimerAction::Resume => write!(f, "resume"),
            TimerAction::Cancel => write!(f, "cancel"),
            TimerAction::Restart => write!(f, "restart"),
            TimerAction::Restore => write!(f, "restore"),
            TimerAction::Complete => write!(f, "complete"),
            TimerAction::Skip => write!(f, "skip"),
        }
    }
}

/// A session ran out.
#[derive(Debug, Clone, PartialEq)]
pub struct Expiry {
    pub session_id: String,
    pub kind: SessionKind,
    /// Wall-clock instant the remaining time reached zero.
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    /// Was running; resumed with the time spent away subtracted.
    Resumed,
    Paused,
    /// Ran out while the process was away.
    Expired(Expiry),
    /// Persisted session was already finished.
    Inactive,
}

/// What to start
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSpec {
    pub kind: SessionKind,
    pub duration: Duration,
    pub activity: Option<String>,
    pub cycle_index: u32,
    pub cycle: Option<CycleProgress>,
}

impl SessionSpec {
    pub fn new(kind: SessionKind, duration: Duration) -> Self {
        Self {
            kind,
            duration,
            activity: None,
            cycle_index: 0,
            cycle: None,
        }
    }

    pub fn with_activity(mut self, activity: Option<String>) -> Self {
        self.activity = activity;
        self
    }

    pub fn with_cycle(mut self, cycle_index: u32, progress: CycleProgress) -> Self {
        self.cycle_index = cycle_index;
        self.cycle = Some(progress);
        self
    }
}

fn to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub struct SessionTimer {
    owner: String,
    clock: SharedClock,
    registry: SessionRegistry,
    session: Option<Session>,
    lease: Option<SessionLease>,
    /// Expiry noticed outside `tick()`, reported by the next `tick()`.
    unreported: Option<Expiry>,
    archived: Vec<Session>,
    diagnostics: Diagnostics,
}

impl SessionTimer {
    pub fn new(owner: impl Into<String>, clock: SharedClock, registry: SessionRegistry) -> Self {
        Self {
            owner: owner.into(),
            clock,
            registry,
            session: None,
            lease: None,
            unreported: None,
            archived: Vec::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn status(&self) -> SessionStatus {
        self.session
            .as_ref()
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// Live remaining time.
    pub fn remaining(&self) -> Duration {
        let now = self.clock.now();
        self.session
            .as_ref()
            .map(|s| s.remaining_at(now))
            .unwrap_or_default()
    }

    pub fn progress_percent(&self) -> f64 {
        let now = self.clock.now();
        self.session
            .as_ref()
            .map(|s| s.progress_percent(now))
            .unwrap_or(0.0)
    }

    pub fn view(&self) -> SessionView {
        let now = self.clock.now();
        self.session
            .as_ref()
            .map(|s| s.view(now))
            .unwrap_or_default()
    }

    /// Sessions replaced by a newer one since the last drain, oldest first.
    pub fn drain_archived(&mut self) -> Vec<Session> {
        std::mem::take(&mut self.archived)
    }

    /// Stamp cycle bookkeeping onto the current session.
    pub fn set_cycle_progress(&mut self, progress: CycleProgress) {
        if let Some(session) = self.session.as_mut() {
            session.cycle = Some(progress);
        }
    }

    fn invalid(&self, action: TimerAction) -> TimerError {
        let from = self.status();
        if cfg!(debug_assertions) {
            error!(%from, %action, owner = %self.owner, "invalid timer transition");
        } else {
            warn!(%from, %action, owner = %self.owner, "invalid timer transition");
        }
        TimerError::InvalidTransition { from, action }
    }

    fn transitioned(&self, from: SessionStatus) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        debug!(
            session_id = %session.id,
            kind = %session.kind,
            %from,
            to = %session.status,
            remaining_ms = session.remaining_ms,
            "timer transition"
        );
        self.diagnostics.log(
            DiagnosticEventType::TimerTransition,
            DiagnosticSource::Timer,
            Some(&session.id),
            data([
                ("from", json!(from.to_string())),
                ("to", json!(session.status.to_string())),
                ("remainingMs", json!(session.remaining_ms)),
            ]),
        );
    }

    fn replace_session(&mut self, session: Session) {
        if let Some(previous) = self.session.replace(session) {
            self.archived.push(previous);
        }
        self.unreported = None;
    }

    pub fn start(&mut self, spec: SessionSpec) -> Result<Session, TimerError> {
        let now = self.clock.now();
        self.start_at(spec, now)
    }

    /// Start a session whose countdown began at `anchor` (which may be in
    /// the past, when a cycle catches up on phases that ended while away).
    /// Valid when idle or after the previous session finished.
    pub fn start_at(&mut self, spec: SessionSpec, anchor: DateTime<Utc>) -> Result<Session, TimerError> {
        if self.status().is_active() {
            return Err(self.invalid(TimerAction::Start));
        }

        let id = Uuid::new_v4().to_string();
        let lease = self.registry.claim(&self.owner, spec.kind.group(), &id)?;
        let from = self.status();
        let total_ms = to_millis(spec.duration);
        let session = Session {
            id,
            kind: spec.kind,
            status: SessionStatus::Running,
            anchor_timestamp: anchor,
            remaining_ms: total_ms,
            total_ms,
            cycle_index: spec.cycle_index,
            activity: spec.activity,
            cycle: spec.cycle,
            updated_at: self.clock.now(),
        };
        self.replace_session(session.clone());
        self.lease = Some(lease);
        info!(session_id = %session.id, kind = %session.kind, total_ms, "session started");
        self.transitioned(from);
        Ok(session)
    }

    /// Freeze the remaining time. A session that already ran out expires
    /// instead; the expiry is reported by the next `tick()`.
    pub fn pause(&mut self) -> Result<Session, TimerError> {
        let now = self.clock.now();
        let remaining = match self.session.as_ref() {
            Some(s) if s.status == SessionStatus::Running => s.remaining_at(now),
            _ => return Err(self.invalid(TimerAction::Pause)),
        };
        if remaining.is_zero() {
            let expiry = self.expire(now);
            self.unreported = expiry;
            return self.current();
        }

        if let Some(session) = self.session.as_mut() {
            session.status = SessionStatus::Paused;
            session.remaining_ms = to_millis(remaining);
            session.anchor_timestamp = now;
            session.updated_at = now;
        }
        self.transitioned(SessionStatus::Running);
        self.current()
    }

    pub fn resume(&mut self) -> Result<Session, TimerError> {
        let now = self.clock.now();
        match self.session.as_mut() {
            Some(session) if session.status == SessionStatus::Paused => {
                session.status = SessionStatus::Running;
                session.anchor_timestamp = now;
                session.updated_at = now;
            }
            _ => return Err(self.invalid(TimerAction::Resume)),
        }
        self.transitioned(SessionStatus::Paused);
        self.current()
    }

    /// Recompute remaining time; expire the session once it reaches zero.
    pub fn tick(&mut self) -> Option<Expiry> {
        if let Some(expiry) = self.unreported.take() {
            return Some(expiry);
        }
        let now = self.clock.now();
        let running = self
            .session
            .as_ref()
            .is_some_and(|s| s.status == SessionStatus::Running && s.remaining_at(now).is_zero());
        if running {
            self.expire(now)
        } else {
            None
        }
    }

    fn expire(&mut self, now: DateTime<Utc>) -> Option<Expiry> {
        let session = self.session.as_mut()?;
        let at = session.ends_at().unwrap_or(now);
        session.status = SessionStatus::Expired;
        session.remaining_ms = 0;
        session.anchor_timestamp = at;
        session.updated_at = now;
        let expiry = Expiry {
            session_id: session.id.clone(),
            kind: session.kind,
            at,
        };
        self.lease = None;
        info!(session_id = %expiry.session_id, kind = %expiry.kind, "session expired");
        self.transitioned(SessionStatus::Running);
        Some(expiry)
    }

    /// Stop a running or paused session. Always wins over in-flight ticks
    /// and remote updates.
    pub fn cancel(&mut self) -> Result<Session, TimerError> {
        let now = self.clock.now();
        let from = self.status();
        match self.session.as_mut() {
            Some(session) if session.status.is_active() => {
                session.remaining_ms = to_millis(session.remaining_at(now));
                session.status = SessionStatus::Cancelled;
                session.anchor_timestamp = now;
                session.updated_at = now;
            }
            _ => return Err(self.invalid(TimerAction::Cancel)),
        }
        self.lease = None;
        self.unreported = None;
        self.transitioned(from);
        self.current()
    }

    /// End a running or paused session right now without it counting as
    /// a natural expiry. The remaining time is kept on the record.
    pub fn skip(&mut self) -> Result<Expiry, TimerError> {
        let now = self.clock.now();
        let from = self.status();
        let expiry = match self.session.as_mut() {
            Some(session) if session.status.is_active() => {
                session.remaining_ms = to_millis(session.remaining_at(now));
                session.status = SessionStatus::Expired;
                session.anchor_timestamp = now;
                session.updated_at = now;
                Expiry {
                    session_id: session.id.clone(),
                    kind: session.kind,
                    at: now,
                }
            }
            _ => return Err(self.invalid(TimerAction::Skip)),
        };
        self.lease = None;
        self.unreported = None;
        info!(session_id = %expiry.session_id, kind = %expiry.kind, "session skipped");
        self.transitioned(from);
        Ok(expiry)
    }

    /// Run the same session again from its full duration.
    pub fn restart(&mut self) -> Result<Session, TimerError> {
        let now = self.clock.now();
        let from = self.status();
        let (id, group) = match self.session.as_ref() {
            Some(s)
                if matches!(
                    s.status,
                    SessionStatus::Running | SessionStatus::Paused | SessionStatus::Expired
                ) =>
            {
                (s.id.clone(), s.group())
            }
            _ => return Err(self.invalid(TimerAction::Restart)),
        };
        if self.lease.is_none() {
            self.lease = Some(self.registry.claim(&self.owner, group, &id)?);
        }
        if let Some(session) = self.session.as_mut() {
            session.status = SessionStatus::Running;
            session.remaining_ms = session.total_ms;
            session.anchor_timestamp = now;
            session.updated_at = now;
        }
        self.unreported = None;
        self.transitioned(from);
        self.current()
    }

    /// Finish an expired session for good (last phase of a cycle).
    pub fn mark_completed(&mut self) -> Result<Session, TimerError> {
        let now = self.clock.now();
        match self.session.as_mut() {
            Some(session) if session.status == SessionStatus::Expired => {
                session.status = SessionStatus::Completed;
                session.updated_at = now;
            }
            _ => return Err(self.invalid(TimerAction::Complete)),
        }
        self.lease = None;
        self.unreported = None;
        self.transitioned(SessionStatus::Expired);
        self.current()
    }

    /// Adopt a persisted session on (re)initialization, correcting for the
    /// wall-clock time that passed while nothing was running.
    pub fn restore(&mut self, persisted: Session) -> Result<RestoreOutcome, TimerError> {
        if self.status().is_active() {
            return Err(self.invalid(TimerAction::Restore));
        }
        let now = self.clock.now();
        let mut session = persisted;

        let outcome = match session.status {
            SessionStatus::Running => {
                let elapsed = elapsed_since(session.anchor_timestamp, now);
                if elapsed >= session.remaining() {
                    let at = session.ends_at().unwrap_or(now);
                    session.status = SessionStatus::Expired;
                    session.remaining_ms = 0;
                    session.anchor_timestamp = at;
                    session.updated_at = now;
                    RestoreOutcome::Expired(Expiry {
                        session_id: session.id.clone(),
                        kind: session.kind,
                        at,
                    })
                } else {
                    self.lease = Some(self.registry.claim(&self.owner, session.group(), &session.id)?);
                    session.remaining_ms = to_millis(session.remaining() - elapsed);
                    session.anchor_timestamp = now;
                    RestoreOutcome::Resumed
                }
            }
            SessionStatus::Paused => {
                self.lease = Some(self.registry.claim(&self.owner, session.group(), &session.id)?);
                RestoreOutcome::Paused
            }
            _ => RestoreOutcome::Inactive,
        };

        info!(session_id = %session.id, status = %session.status, ?outcome, "session restored");
        self.replace_session(session);
        self.diagnostics.log(
            DiagnosticEventType::TimerTransition,
            DiagnosticSource::Timer,
            self.session.as_ref().map(|s| s.id.as_str()),
            data([("restore", json!(format!("{outcome:?}")))]),
        );
        Ok(outcome)
    }

    /// Adopt a newer copy of the current session from the store. A locally
    /// cancelled session ignores it: cancellation wins.
    pub fn apply_remote(&mut self, remote: Session) -> bool {
        let adopt = match self.session.as_ref() {
            None => true,
            Some(local) if local.id != remote.id => !local.status.is_active(),
            Some(local) if local.status == SessionStatus::Cancelled => false,
            Some(local) => remote.updated_at > local.updated_at,
        };
        if !adopt {
            return false;
        }

        let same_session = self.session.as_ref().is_some_and(|s| s.id == remote.id);
        if remote.status.is_active() {
            if self.lease.is_none() {
                match self.registry.claim(&self.owner, remote.group(), &remote.id) {
                    Ok(lease) => self.lease = Some(lease),
                    Err(e) => {
                        warn!(session_id = %remote.id, error = %e, "ignoring remote session");
                        return false;
                    }
                }
            }
        } else {
            self.lease = None;
        }

        let from = self.status();
        if same_session {
            self.session = Some(remote);
            self.unreported = None;
        } else {
            self.replace_session(remote);
        }
        self.transitioned(from);
        true
    }

    fn current(&self) -> Result<Session, TimerError> {
        self.session.clone().ok_or(TimerError::NoSession)
    }
}
