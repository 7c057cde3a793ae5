//! Error taxonomy of the sync engine.
//!
//! Nothing here is fatal to the process: transport and write failures
//! degrade to "state will reconcile on the next successful sync".

use thiserror::Error;

use crate::store::StoreError;
use crate::timer::TimerAction;
use crate::types::{KindGroup, SessionStatus};

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The change channel is disconnected; a resync follows the reconnect.
    #[error("Change channel disconnected: {0}")]
    Transport(String),
    /// A persistence write exhausted its retry budget.
    #[error("Write for record {record_id} failed after {attempts} attempt(s)")]
    WriteFailure { record_id: String, attempts: u32 },
    /// A pending mutation outlived the staleness threshold at resync time.
    #[error("Pending mutation for record {record_id} is stale and was discarded")]
    StaleMutation { record_id: String },
    /// A mutation guard refused the change before any local effect.
    #[error("Mutation rejected: {0}")]
    Rejected(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Collection engine has shut down")]
    EngineClosed,
}

impl SyncError {
    /// Transport-class errors are retried by reconnecting, never surfaced.
    pub fn is_transport(&self) -> bool {
        match self {
            SyncError::Transport(_) => true,
            SyncError::Store(err) => err.is_transport(),
            _ => false,
        }
    }
}

/// Errors from the session timer layer.
///
/// All are reported as a no-op: the timer's state is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("Cannot {action} a timer that is {from}")]
    InvalidTransition {
        from: SessionStatus,
        action: TimerAction,
    },
    #[error("A {group} session is already running")]
    GroupBusy { group: KindGroup },
    #[error("No timer session")]
    NoSession,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::WriteFailure {
            record_id: "r1".to_string(),
            attempts: 5,
        };
        assert_eq!(err.to_string(), "Write for record r1 failed after 5 attempt(s)");

        let err = SyncError::Rejected("a pomodoro session is already running".to_string());
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_is_transport() {
        assert!(SyncError::Transport("offline".to_string()).is_transport());
        assert!(SyncError::Store(StoreError::Disconnected).is_transport());
        assert!(!SyncError::Store(StoreError::Rejected("quota".to_string())).is_transport());
        assert!(!SyncError::EngineClosed.is_transport());
    }

    #[test]
    fn test_timer_error_display() {
        let err = TimerError::InvalidTransition {
            from: SessionStatus::Idle,
            action: TimerAction::Pause,
        };
        assert_eq!(err.to_string(), "Cannot pause a timer that is idle");

        let err = TimerError::GroupBusy {
            group: KindGroup::Pomodoro,
        };
        assert_eq!(err.to_string(), "A pomodoro session is already running");
        assert_eq!(TimerError::NoSession.to_string(), "No timer session");
    }
}
