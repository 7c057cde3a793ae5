use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::enums::DiagnosticVerbosity;

/// Focus/break cycle settings.
///
/// Immutable for a running cycle controller; replacements are staged and
/// only picked up when the next cycle begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleConfig {
    pub focus_ms: u64,
    pub short_break_ms: u64,
    pub long_break_ms: u64,
    pub cycle_count: u32,
    pub long_break_every: u32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            focus_ms: 25 * 60 * 1000,
            short_break_ms: 5 * 60 * 1000,
            long_break_ms: 15 * 60 * 1000,
            cycle_count: 4,
            long_break_every: 4,
        }
    }
}

impl CycleConfig {
    pub fn focus(&self) -> Duration {
        Duration::from_millis(self.focus_ms)
    }

    pub fn short_break(&self) -> Duration {
        Duration::from_millis(self.short_break_ms)
    }

    pub fn long_break(&self) -> Duration {
        Duration::from_millis(self.long_break_ms)
    }

    /// Collect every problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.focus_ms == 0 {
            errors.push("focus duration must be greater than zero".to_string());
        }
        if self.short_break_ms == 0 {
            errors.push("short break duration must be greater than zero".to_string());
        }
        if self.long_break_ms == 0 {
            errors.push("long break duration must be greater than zero".to_string());
        }
        if self.cycle_count == 0 {
            errors.push("cycle count must be at least 1".to_string());
        }
        if self.long_break_every == 0 {
            errors.push("long break interval must be at least 1".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Debounce, heartbeat, and retry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_reconnect_backoff_max_ms")]
    pub reconnect_backoff_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            staleness_secs: default_staleness_secs(),
            max_write_attempts: default_max_write_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            reconnect_backoff_max_ms: default_reconnect_backoff_max_ms(),
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }
}

/// Pomodoro settings as written in the config file (minutes)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PomodoroConfig {
    #[serde(default = "default_focus_minutes")]
    pub focus_minutes: u64,
    #[serde(default = "default_short_break_minutes")]
    pub short_break_minutes: u64,
    #[serde(default = "default_long_break_minutes")]
    pub long_break_minutes: u64,
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    #[serde(default = "default_cycles")]
    pub long_break_every: u32,
}

impl Default for PomodoroConfig {
    fn default() -> Self {
        Self {
            focus_minutes: default_focus_minutes(),
            short_break_minutes: default_short_break_minutes(),
            long_break_minutes: default_long_break_minutes(),
            cycles: default_cycles(),
            long_break_every: default_cycles(),
        }
    }
}

impl PomodoroConfig {
    pub fn to_cycle_config(&self) -> CycleConfig {
        CycleConfig {
            focus_ms: self.focus_minutes * 60 * 1000,
            short_break_ms: self.short_break_minutes * 60 * 1000,
            long_break_ms: self.long_break_minutes * 60 * 1000,
            cycle_count: self.cycles,
            long_break_every: self.long_break_every,
        }
    }
}

/// Leisure countdown settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeisureConfig {
    #[serde(default = "default_leisure_minutes")]
    pub default_minutes: u64,
}

impl Default for LeisureConfig {
    fn default() -> Self {
        Self {
            default_minutes: default_leisure_minutes(),
        }
    }
}

/// Diagnostics log settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub verbosity: DiagnosticVerbosity,
    #[serde(default)]
    pub log_to_file: bool,
}

/// Top-level configuration (`cadence.config.yaml`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub pomodoro: PomodoroConfig,
    #[serde(default)]
    pub leisure: LeisureConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            data_dir: default_data_dir(),
            sync: SyncConfig::default(),
            pomodoro: PomodoroConfig::default(),
            leisure: LeisureConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

fn default_owner() -> String {
    std::env::var("USER")
        .ok()
        .filter(|user| !user.trim().is_empty())
        .unwrap_or_else(|| "local".to_string())
}

fn default_data_dir() -> String {
    ".cadence".to_string()
}

fn default_debounce_ms() -> u64 {
    3000
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_staleness_secs() -> u64 {
    120
}

fn default_max_write_attempts() -> u32 {
    5
}

fn default_reconnect_backoff_ms() -> u64 {
    1000
}

fn default_reconnect_backoff_max_ms() -> u64 {
    30_000
}

fn default_focus_minutes() -> u64 {
    25
}

fn default_short_break_minutes() -> u64 {
    5
}

fn default_long_break_minutes() -> u64 {
    15
}

fn default_cycles() -> u32 {
    4
}

fn default_leisure_minutes() -> u64 {
    15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_config_defaults() {
        let config = CycleConfig::default();
        assert_eq!(config.focus(), Duration::from_secs(25 * 60));
        assert_eq!(config.short_break(), Duration::from_secs(5 * 60));
        assert_eq!(config.long_break(), Duration::from_secs(15 * 60));
        assert_eq!(config.cycle_count, 4);
        assert_eq!(config.long_break_every, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cycle_config_validate_collects_all_errors() {
        let config = CycleConfig {
            focus_ms: 0,
            short_break_ms: 0,
            long_break_ms: 1,
            cycle_count: 0,
            long_break_every: 0,
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_pomodoro_config_to_cycle_config() {
        let pomodoro = PomodoroConfig {
            focus_minutes: 50,
            short_break_minutes: 10,
            long_break_minutes: 30,
            cycles: 2,
            long_break_every: 2,
        };
        let cycle = pomodoro.to_cycle_config();
        assert_eq!(cycle.focus(), Duration::from_secs(50 * 60));
        assert_eq!(cycle.long_break(), Duration::from_secs(30 * 60));
        assert_eq!(cycle.cycle_count, 2);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "owner: alice\nsync:\n  debounce_ms: 500\n";
        let config: CadenceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.owner, "alice");
        assert_eq!(config.sync.debounce(), Duration::from_millis(500));
        assert_eq!(config.sync.heartbeat(), Duration::from_secs(30));
        assert_eq!(config.pomodoro.focus_minutes, 25);
        assert_eq!(config.leisure.default_minutes, 15);
        assert!(!config.diagnostics.enabled);
    }
}
