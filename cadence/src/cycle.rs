//! Pomodoro cycle controller: alternates focus and break sessions on one
//! [`SessionTimer`].

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::diagnostics::{data, Diagnostics};
use crate::error::TimerError;
use crate::timer::{Expiry, RestoreOutcome, SessionSpec, SessionTimer};
use crate::types::{
    CycleConfig, CycleProgress, DiagnosticEventType, DiagnosticSource, KindGroup, Session,
    SessionKind, SessionStatus, SessionView,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleEvent {
    FocusStarted { cycle: u32 },
    /// A focus session ran out naturally; `completed` is the new counter.
    FocusCompleted { completed: u32 },
    BreakStarted { long: bool },
    Skipped { kind: SessionKind },
    CycleCompleted,
}

/// How a session changed by another process was taken over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    /// The current phase was paused, resumed, expired or cancelled elsewhere.
    Adopted(SessionStatus),
    /// The cycle moved on to a newer phase elsewhere; catch-up events follow.
    Followed(Vec<CycleEvent>),
}

pub struct CycleController {
    timer: SessionTimer,
    config: CycleConfig,
    staged: Option<CycleConfig>,
    /// 1-based index of the current focus/break pair.
    cycle_index: u32,
    completed_focus: u32,
    activity: Option<String>,
    diagnostics: Diagnostics,
}

impl CycleController {
    pub fn new(timer: SessionTimer, config: CycleConfig) -> Self {
        Self {
            timer,
            config,
            staged: None,
            cycle_index: 0,
            completed_focus: 0,
            activity: None,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    pub fn cycle_index(&self) -> u32 {
        self.cycle_index
    }

    pub fn completed_focus(&self) -> u32 {
        self.completed_focus
    }

    pub fn status(&self) -> SessionStatus {
        self.timer.status()
    }

    pub fn is_finished(&self) -> bool {
        self.timer.status() == SessionStatus::Completed
    }

    pub fn session(&self) -> Option<&Session> {
        self.timer.session()
    }

    pub fn view(&self) -> SessionView {
        self.timer.view()
    }

    pub fn progress_percent(&self) -> f64 {
        self.timer.progress_percent()
    }

    pub fn drain_archived(&mut self) -> Vec<Session> {
        self.timer.drain_archived()
    }

    pub fn progress(&self) -> CycleProgress {
        CycleProgress {
            completed_focus: self.completed_focus,
            config: self.config.clone(),
            staged_config: self.staged.clone(),
        }
    }

    /// Stage a configuration for the next focus session. The running
    /// session keeps its duration.
    pub fn update_config(&mut self, config: CycleConfig) -> Result<(), Vec<String>> {
        config.validate()?;
        self.staged = Some(config);
        self.stamp_progress();
        Ok(())
    }

    pub fn reset_completed(&mut self) {
        self.completed_focus = 0;
        self.stamp_progress();
    }

    /// Start a new cycle at its first focus session.
    pub fn start(&mut self, activity: Option<String>) -> Result<Vec<CycleEvent>, TimerError> {
        if let Some(staged) = self.staged.take() {
            self.config = staged;
        }
        let previous_index = self.cycle_index;
        self.cycle_index = 1;
        self.activity = activity;
        let now = self.timer.now();
        if let Err(e) = self.start_focus(now) {
            self.cycle_index = previous_index;
            return Err(e);
        }
        Ok(vec![CycleEvent::FocusStarted { cycle: 1 }])
    }

    /// Pause the current phase. A phase that already ran out advances first.
    pub fn pause(&mut self) -> Result<Vec<CycleEvent>, TimerError> {
        let events = self.tick();
        self.timer.pause()?;
        Ok(events)
    }

    pub fn resume(&mut self) -> Result<Session, TimerError> {
        self.timer.resume()
    }

    /// Stop the cycle.
    pub fn cancel(&mut self) -> Result<Session, TimerError> {
        self.timer.cancel()
    }

    /// Advance through every phase that has run out by now.
    pub fn tick(&mut self) -> Vec<CycleEvent> {
        let mut events = Vec::new();
        while let Some(expiry) = self.timer.tick() {
            let done = self.advance(&expiry, true, &mut events);
            if done {
                break;
            }
        }
        events
    }

    /// Move to the next phase now. A skipped focus is not counted and is
    /// always followed by a short break.
    pub fn skip_to_next(&mut self) -> Result<Vec<CycleEvent>, TimerError> {
        let expiry = self.timer.skip()?;
        let mut events = vec![CycleEvent::Skipped { kind: expiry.kind }];
        self.advance(&expiry, false, &mut events);
        Ok(events)
    }

    /// Pick up a persisted session, then catch up on every phase that
    /// finished while nothing was running.
    pub fn restore(&mut self, persisted: Session) -> Result<Vec<CycleEvent>, TimerError> {
        if let Some(progress) = persisted.cycle.as_ref() {
            self.completed_focus = progress.completed_focus;
            self.config = progress.config.clone();
            self.staged = progress.staged_config.clone();
        }
        self.cycle_index = persisted.cycle_index.max(1);
        self.activity = persisted.activity.clone();

        let pending_advance = persisted.status == SessionStatus::Expired;
        let outcome = self.timer.restore(persisted)?;

        let mut events = Vec::new();
        let expiry = match outcome {
            RestoreOutcome::Expired(expiry) => Some(expiry),
            RestoreOutcome::Inactive if pending_advance => self.timer.session().map(|s| Expiry {
                session_id: s.id.clone(),
                kind: s.kind,
                at: s.anchor_timestamp,
            }),
            _ => None,
        };
        if let Some(expiry) = expiry {
            if !self.advance(&expiry, true, &mut events) {
                events.extend(self.tick());
            }
        }
        Ok(events)
    }

    /// Take over a pomodoro session another process changed.
    ///
    /// A newer copy of the current phase is adopted as is, so a remote stop
    /// beats the local countdown. A newer phase with a different id is
    /// followed only once the local phase has ended; offer the current
    /// phase's copy first. A locally cancelled or completed cycle ignores
    /// both.
    pub fn apply_remote(&mut self, remote: Session) -> Option<RemoteChange> {
        if remote.group() != KindGroup::Pomodoro {
            return None;
        }
        let (local_id, local_status, local_updated) = match self.timer.session() {
            Some(local) => (Some(local.id.clone()), local.status, Some(local.updated_at)),
            None => (None, SessionStatus::Idle, None),
        };

        if local_id.as_deref() == Some(remote.id.as_str()) {
            if !self.timer.apply_remote(remote) {
                return None;
            }
            let status = self.timer.status();
            info!(%status, "current phase changed elsewhere");
            return Some(RemoteChange::Adopted(status));
        }

        let can_follow = matches!(local_status, SessionStatus::Idle | SessionStatus::Expired)
            && remote.status.is_active()
            && local_updated.map_or(true, |at| remote.updated_at >= at);
        if !can_follow {
            return None;
        }
        match self.restore(remote) {
            Ok(events) => {
                info!(cycle = self.cycle_index, "following phase started elsewhere");
                Some(RemoteChange::Followed(events))
            }
            Err(e) => {
                warn!(error = %e, "could not follow remote phase");
                None
            }
        }
    }

    /// Returns true once nothing further will run.
    fn advance(&mut self, expiry: &Expiry, natural: bool, events: &mut Vec<CycleEvent>) -> bool {
        match expiry.kind {
            SessionKind::Focus => {
                let long = if natural {
                    self.completed_focus += 1;
                    events.push(CycleEvent::FocusCompleted {
                        completed: self.completed_focus,
                    });
                    self.completed_focus % self.config.long_break_every.max(1) == 0
                } else {
                    false
                };
                self.stamp_progress();
                match self.start_break(long, expiry.at) {
                    Ok(()) => {
                        events.push(CycleEvent::BreakStarted { long });
                        false
                    }
                    Err(e) => {
                        warn!(error = %e, "could not start break");
                        true
                    }
                }
            }
            SessionKind::Break => {
                if self.cycle_index + 1 > self.config.cycle_count {
                    if let Err(e) = self.timer.mark_completed() {
                        warn!(error = %e, "could not complete cycle");
                    }
                    info!(completed_focus = self.completed_focus, "pomodoro cycle completed");
                    self.log(expiry, "completed");
                    events.push(CycleEvent::CycleCompleted);
                    return true;
                }
                self.cycle_index += 1;
                if let Some(staged) = self.staged.take() {
                    self.config = staged;
                }
                match self.start_focus(expiry.at) {
                    Ok(()) => {
                        events.push(CycleEvent::FocusStarted {
                            cycle: self.cycle_index,
                        });
                        false
                    }
                    Err(e) => {
                        warn!(error = %e, "could not start focus");
                        true
                    }
                }
            }
            SessionKind::Leisure | SessionKind::Study => true,
        }
    }

    fn start_focus(&mut self, anchor: DateTime<Utc>) -> Result<(), TimerError> {
        let spec = SessionSpec::new(SessionKind::Focus, self.config.focus())
            .with_activity(self.activity.clone())
            .with_cycle(self.cycle_index, self.progress());
        let session = self.timer.start_at(spec, anchor)?;
        info!(cycle = self.cycle_index, session_id = %session.id, "focus started");
        Ok(())
    }

    fn start_break(&mut self, long: bool, anchor: DateTime<Utc>) -> Result<(), TimerError> {
        let duration = if long {
            self.config.long_break()
        } else {
            self.config.short_break()
        };
        let spec = SessionSpec::new(SessionKind::Break, duration)
            .with_activity(self.activity.clone())
            .with_cycle(self.cycle_index, self.progress());
        let session = self.timer.start_at(spec, anchor)?;
        info!(cycle = self.cycle_index, long, session_id = %session.id, "break started");
        Ok(())
    }

    fn stamp_progress(&mut self) {
        let progress = self.progress();
        self.timer.set_cycle_progress(progress);
    }

    fn log(&self, expiry: &Expiry, phase: &str) {
        self.diagnostics.log(
            DiagnosticEventType::TimerTransition,
            DiagnosticSource::Cycle,
            Some(&expiry.session_id),
            data([
                ("phase", json!(phase)),
                ("cycle", json!(self.cycle_index)),
                ("completedFocus", json!(self.completed_focus)),
            ]),
        );
    }
}
