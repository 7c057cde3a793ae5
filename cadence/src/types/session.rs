use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::CycleConfig;
use super::enums::{KindGroup, SessionKind, SessionStatus};
use crate::clock::elapsed_since;

/// Cycle bookkeeping carried on every Pomodoro session so a restored
/// controller can pick up where it left off
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleProgress {
    pub completed_focus: u32,
    pub config: CycleConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_config: Option<CycleConfig>,
}

/// One timer instance.
///
/// `remaining_ms` is the remaining time measured at `anchor_timestamp`. While
/// running, the live remaining time is always derived from the anchor; it is
/// never decremented per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub anchor_timestamp: DateTime<Utc>,
    pub remaining_ms: u64,
    pub total_ms: u64,
    #[serde(default)]
    pub cycle_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<CycleProgress>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn group(&self) -> KindGroup {
        self.kind.group()
    }

    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms)
    }

    /// Remaining time as of the anchor.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.remaining_ms)
    }

    /// Live remaining time at `now`.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        match self.status {
            SessionStatus::Running => self
                .remaining()
                .saturating_sub(elapsed_since(self.anchor_timestamp, now)),
            _ => self.remaining(),
        }
    }

    /// Wall-clock instant a running session runs out.
    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        if self.status != SessionStatus::Running {
            return None;
        }
        chrono::Duration::from_std(self.remaining())
            .ok()
            .map(|remaining| self.anchor_timestamp + remaining)
    }

    /// Percentage of the total duration already spent at `now` (0..=100).
    pub fn progress_percent(&self, now: DateTime<Utc>) -> f64 {
        if self.total_ms == 0 {
            return 100.0;
        }
        let remaining = self.remaining_at(now).as_millis() as f64;
        ((1.0 - remaining / self.total_ms as f64) * 100.0).clamp(0.0, 100.0)
    }

    pub fn view(&self, now: DateTime<Utc>) -> SessionView {
        SessionView {
            id: Some(self.id.clone()),
            kind: Some(self.kind),
            status: self.status,
            remaining: self.remaining_at(now),
            total: self.total(),
            cycle_index: self.cycle_index,
            activity: self.activity.clone(),
        }
    }
}

/// What the presentation layer needs to draw a timer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    pub id: Option<String>,
    pub kind: Option<SessionKind>,
    pub status: SessionStatus,
    pub remaining: Duration,
    pub total: Duration,
    pub cycle_index: u32,
    pub activity: Option<String>,
}

impl SessionView {
    pub fn minutes_remaining(&self) -> u64 {
        self.remaining.as_secs() / 60
    }

    pub fn seconds_remaining(&self) -> u64 {
        self.remaining.as_secs() % 60
    }
}
