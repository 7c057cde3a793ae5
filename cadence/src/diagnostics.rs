//! Sync drift diagnostics log.
//!
//! An owned log handle (cheap to clone) that:
//! - Keeps a ring buffer of recent events for the presentation layer
//! - Optionally appends to `<data_dir>/diagnostics/debug-{sessionId}.log`
//! - Optionally echoes to stderr with colour-coded event types

use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use colored::Colorize;
use serde_json::Value;

use crate::types::diagnostics::{verbosity_event_types, DiagnosticEvent, DiagnosticsSettings};
use crate::types::enums::{DiagnosticEventType, DiagnosticSource};
use crate::types::DiagnosticsConfig;

/// Maximum events to keep in ring buffer.
const RING_BUFFER_SIZE: usize = 100;

/// Short labels for event types (for compact console output).
fn event_label(event_type: DiagnosticEventType) -> &'static str {
    match event_type {
        DiagnosticEventType::MutationQueued => "mutation:queued",
        DiagnosticEventType::MutationConfirmed => "mutation:confirmed",
        DiagnosticEventType::EventMerged => "event:merged",
        DiagnosticEventType::WriteFlushed => "write:flushed",
        DiagnosticEventType::WriteFailed => "write:failed",
        DiagnosticEventType::MutationFailed => "mutation:failed",
        DiagnosticEventType::Resync => "resync",
        DiagnosticEventType::StaleDiscarded => "stale:discarded",
        DiagnosticEventType::ChannelStatus => "channel:status",
        DiagnosticEventType::TimerTransition => "timer:transition",
        DiagnosticEventType::HeartbeatCheckpoint => "heartbeat",
    }
}

fn color_label(event_type: DiagnosticEventType, label: &str) -> String {
    match event_type {
        DiagnosticEventType::MutationQueued => label.cyan().to_string(),
        DiagnosticEventType::MutationConfirmed => label.green().to_string(),
        DiagnosticEventType::EventMerged => label.blue().to_string(),
        DiagnosticEventType::WriteFlushed => label.bright_green().to_string(),
        DiagnosticEventType::WriteFailed => label.yellow().to_string(),
        DiagnosticEventType::MutationFailed => label.red().to_string(),
        DiagnosticEventType::Resync => label.magenta().to_string(),
        DiagnosticEventType::StaleDiscarded => label.bright_red().to_string(),
        DiagnosticEventType::ChannelStatus => label.bright_blue().to_string(),
        DiagnosticEventType::TimerTransition => label.white().to_string(),
        DiagnosticEventType::HeartbeatCheckpoint => label.dimmed().to_string(),
    }
}

/// Build an event data map from key/value pairs.
pub fn data<const N: usize>(pairs: [(&str, Value); N]) -> HashMap<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

struct DiagnosticsLog {
    settings: DiagnosticsSettings,
    ring_buffer: VecDeque<DiagnosticEvent>,
    log_file_path: Option<PathBuf>,
}

impl DiagnosticsLog {
    fn should_log(&self, event_type: DiagnosticEventType) -> bool {
        if !self.settings.enabled {
            return false;
        }
        verbosity_event_types(self.settings.verbosity).contains(&event_type)
    }

    fn log_event(&mut self, event: DiagnosticEvent) {
        self.ring_buffer.push_back(event.clone());
        if self.ring_buffer.len() > RING_BUFFER_SIZE {
            self.ring_buffer.pop_front();
        }

        if self.settings.log_to_file {
            self.write_to_file(&event);
        }
        if self.settings.echo_to_stderr {
            eprintln!("{}", format_for_console(&event));
        }
    }

    fn write_to_file(&self, event: &DiagnosticEvent) {
        let Some(ref path) = self.log_file_path else {
            return;
        };
        let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) else {
            return;
        };
        let _ = file.write_all(format_for_file(event).as_bytes());
    }
}

fn format_for_file(event: &DiagnosticEvent) -> String {
    let time = event
        .timestamp
        .split('T')
        .nth(1)
        .unwrap_or(&event.timestamp)
        .trim_end_matches('Z');
    let source = format!("{:?}", event.source).to_lowercase();
    let record_part = event
        .record_id
        .as_ref()
        .map(|id| format!(" [{id}]"))
        .unwrap_or_default();
    let data_str = if event.data.is_empty() {
        String::new()
    } else {
        format!(" {}", serde_json::to_string(&event.data).unwrap_or_default())
    };

    format!(
        "[DIAG {time}] {} ({source}){record_part}{data_str}\n",
        event_label(event.event_type)
    )
}

fn format_for_console(event: &DiagnosticEvent) -> String {
    let time = event
        .timestamp
        .split('T')
        .nth(1)
        .unwrap_or(&event.timestamp);
    // HH:mm:ss.SSS
    let time = &time[..time.len().min(12)];

    let label = format!("{:<20}", event_label(event.event_type));
    let colored_label = color_label(event.event_type, &label);

    let record_part = event
        .record_id
        .as_ref()
        .map(|id| format!("{} ", format!("[{id}]").white()))
        .unwrap_or_default();

    let mut data_parts: Vec<String> = event
        .data
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(key, value)| {
            let value_str = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{key}={value_str}")
        })
        .collect();
    data_parts.sort();

    format!(
        "{} {colored_label} {record_part}{}",
        format!("[DIAG {time}]").dimmed(),
        data_parts.join(" ").dimmed()
    )
}

/// Handle to one diagnostics log. Clones share the same buffer.
#[derive(Clone)]
pub struct Diagnostics {
    inner: Arc<Mutex<DiagnosticsLog>>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DiagnosticsSettings::default(), None)
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Diagnostics {
    /// Create a log. When `log_dir` is given and file logging is enabled, a
    /// `debug-{sessionId}.log` file is created there.
    pub fn new(mut settings: DiagnosticsSettings, log_dir: Option<&Path>) -> Self {
        let session_id = settings
            .session_id
            .get_or_insert_with(|| format!("{:x}", Utc::now().timestamp_millis()))
            .clone();

        let log_file_path = match log_dir {
            Some(dir) if settings.enabled && settings.log_to_file => {
                if !dir.exists() {
                    let _ = fs::create_dir_all(dir);
                }
                Some(dir.join(format!("debug-{session_id}.log")))
            }
            _ => None,
        };

        Self {
            inner: Arc::new(Mutex::new(DiagnosticsLog {
                settings,
                ring_buffer: VecDeque::with_capacity(RING_BUFFER_SIZE),
                log_file_path,
            })),
        }
    }

    /// Build from the config file section. Files go to `<data_dir>/diagnostics`.
    pub fn from_config(config: &DiagnosticsConfig, data_dir: &Path, echo_to_stderr: bool) -> Self {
        let settings = DiagnosticsSettings {
            enabled: config.enabled,
            verbosity: config.verbosity,
            log_to_file: config.log_to_file,
            echo_to_stderr,
            session_id: None,
        };
        Self::new(settings, Some(&data_dir.join("diagnostics")))
    }

    pub fn is_enabled(&self) -> bool {
        self.inner
            .lock()
            .map(|guard| guard.settings.enabled)
            .unwrap_or(false)
    }

    /// Record an event. Types outside the configured verbosity are dropped.
    pub fn log(
        &self,
        event_type: DiagnosticEventType,
        source: DiagnosticSource,
        record_id: Option<&str>,
        data: HashMap<String, Value>,
    ) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        if !guard.should_log(event_type) {
            return;
        }
        guard.log_event(DiagnosticEvent {
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            event_type,
            source,
            record_id: record_id.map(str::to_string),
            data,
        });
    }

    /// Up to `count` most recent events, oldest first.
    pub fn recent(&self, count: usize) -> Vec<DiagnosticEvent> {
        let Ok(guard) = self.inner.lock() else {
            return Vec::new();
        };
        let start = guard.ring_buffer.len().saturating_sub(count);
        guard.ring_buffer.iter().skip(start).cloned().collect()
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.inner
            .lock()
            .ok()
            .and_then(|guard| guard.log_file_path.clone())
    }
}
