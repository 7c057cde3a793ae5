use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::enums::{DiagnosticEventType, DiagnosticSource, DiagnosticVerbosity};

/// A single diagnostics entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: DiagnosticEventType,
    pub source: DiagnosticSource,
    #[serde(rename = "recordId", default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub data: HashMap<String, serde_json::Value>,
}

/// Runtime settings of one diagnostics log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSettings {
    pub enabled: bool,
    pub verbosity: DiagnosticVerbosity,
    pub log_to_file: bool,
    pub echo_to_stderr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            verbosity: DiagnosticVerbosity::Normal,
            log_to_file: false,
            echo_to_stderr: false,
            session_id: None,
        }
    }
}

/// Event types captured at each verbosity level.
pub fn verbosity_event_types(verbosity: DiagnosticVerbosity) -> &'static [DiagnosticEventType] {
    match verbosity {
        DiagnosticVerbosity::Minimal => &[
            DiagnosticEventType::MutationFailed,
            DiagnosticEventType::StaleDiscarded,
            DiagnosticEventType::Resync,
        ],
        DiagnosticVerbosity::Normal => &[
            DiagnosticEventType::MutationFailed,
            DiagnosticEventType::StaleDiscarded,
            DiagnosticEventType::Resync,
            DiagnosticEventType::WriteFailed,
            DiagnosticEventType::ChannelStatus,
            DiagnosticEventType::TimerTransition,
        ],
        DiagnosticVerbosity::Verbose => &[
            DiagnosticEventType::MutationQueued,
            DiagnosticEventType::MutationConfirmed,
            DiagnosticEventType::EventMerged,
            DiagnosticEventType::WriteFlushed,
            DiagnosticEventType::WriteFailed,
            DiagnosticEventType::MutationFailed,
            DiagnosticEventType::Resync,
            DiagnosticEventType::StaleDiscarded,
            DiagnosticEventType::ChannelStatus,
            DiagnosticEventType::TimerTransition,
            DiagnosticEventType::HeartbeatCheckpoint,
        ],
    }
}
