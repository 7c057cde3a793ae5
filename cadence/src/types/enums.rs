use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What a session is timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Focus,
    Break,
    Leisure,
    Study,
}

impl SessionKind {
    /// The group this kind competes in for the single running slot.
    ///
    /// Focus and break sessions alternate inside one Pomodoro cycle, so they
    /// share a group.
    pub fn group(self) -> KindGroup {
        match self {
            SessionKind::Focus | SessionKind::Break => KindGroup::Pomodoro,
            SessionKind::Leisure => KindGroup::Leisure,
            SessionKind::Study => KindGroup::Study,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Focus => write!(f, "focus"),
            SessionKind::Break => write!(f, "break"),
            SessionKind::Leisure => write!(f, "leisure"),
            SessionKind::Study => write!(f, "study"),
        }
    }
}

impl FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "focus" => Ok(SessionKind::Focus),
            "break" => Ok(SessionKind::Break),
            "leisure" => Ok(SessionKind::Leisure),
            "study" => Ok(SessionKind::Study),
            _ => Err(format!(
                "Unknown session kind: '{s}'. Expected: focus, break, leisure, study"
            )),
        }
    }
}

/// At most one session per (owner, group) may be running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindGroup {
    Pomodoro,
    Leisure,
    Study,
}

impl fmt::Display for KindGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KindGroup::Pomodoro => write!(f, "pomodoro"),
            KindGroup::Leisure => write!(f, "leisure"),
            KindGroup::Study => write!(f, "study"),
        }
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Expired,
    Completed,
    Cancelled,
}

impl SessionStatus {
    /// Returns true once the session can no longer change on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Expired | SessionStatus::Completed | SessionStatus::Cancelled
        )
    }

    /// Running or paused: the session still owns its group slot.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Paused)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Expired => write!(f, "expired"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(SessionStatus::Idle),
            "running" => Ok(SessionStatus::Running),
            "paused" => Ok(SessionStatus::Paused),
            "expired" => Ok(SessionStatus::Expired),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            _ => Err(format!("Unknown session status: '{s}'")),
        }
    }
}

/// Lifecycle of a local optimistic write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    /// Applied to the cache, not yet handed to the store.
    Queued,
    /// Written to the store, waiting for the matching change event.
    Applied,
    /// Matched by a change event. Transient: the mutation is dropped.
    Confirmed,
    /// Write retries exhausted; needs user-visible reconciliation.
    Failed,
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationState::Queued => write!(f, "queued"),
            MutationState::Applied => write!(f, "applied"),
            MutationState::Confirmed => write!(f, "confirmed"),
            MutationState::Failed => write!(f, "failed"),
        }
    }
}

/// Connection/sync indicator shown to the presentation layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Syncing,
    Synced,
    Disconnected,
    /// The last full sync failed for a reason a reconnect will not fix.
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Disconnected => write!(f, "disconnected"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

/// Diagnostic event types for sync drift diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticEventType {
    MutationQueued,
    MutationConfirmed,
    EventMerged,
    WriteFlushed,
    WriteFailed,
    MutationFailed,
    Resync,
    StaleDiscarded,
    ChannelStatus,
    TimerTransition,
    HeartbeatCheckpoint,
}

/// Component that emitted a diagnostic event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSource {
    Reconciler,
    Scheduler,
    Channel,
    Timer,
    Cycle,
}

/// How much the diagnostics log captures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticVerbosity {
    Minimal,
    #[default]
    Normal,
    Verbose,
}

impl FromStr for DiagnosticVerbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minimal" => Ok(DiagnosticVerbosity::Minimal),
            "normal" => Ok(DiagnosticVerbosity::Normal),
            "verbose" => Ok(DiagnosticVerbosity::Verbose),
            _ => Err(format!(
                "Unknown verbosity: '{s}'. Expected: minimal, normal, verbose"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focus_and_break_share_a_group() {
        assert_eq!(SessionKind::Focus.group(), SessionKind::Break.group());
        assert_ne!(SessionKind::Focus.group(), SessionKind::Leisure.group());
        assert_eq!(SessionKind::Study.group(), KindGroup::Study);
    }

    #[test]
    fn test_session_kind_from_str() {
        assert_eq!("Focus".parse::<SessionKind>(), Ok(SessionKind::Focus));
        assert_eq!("leisure".parse::<SessionKind>(), Ok(SessionKind::Leisure));
        assert!("nap".parse::<SessionKind>().is_err());
    }

    #[test]
    fn test_session_status_terminal_and_active() {
        assert!(SessionStatus::Expired.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Idle.is_terminal());

        assert!(SessionStatus::Running.is_active());
        assert!(SessionStatus::Paused.is_active());
        assert!(!SessionStatus::Idle.is_active());
    }

    #[test]
    fn test_session_status_serde_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let parsed: SessionStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, SessionStatus::Cancelled);
    }

    #[test]
    fn test_diagnostic_verbosity_from_str() {
        assert_eq!(
            "VERBOSE".parse::<DiagnosticVerbosity>(),
            Ok(DiagnosticVerbosity::Verbose)
        );
        assert!("loud".parse::<DiagnosticVerbosity>().is_err());
    }
}
