use std::env;
use std::fs;
use std::path::Path;

use tracing::debug;

use super::error::ConfigError;
use crate::types::CadenceConfig;

/// Environment variables that override file settings
pub const ENV_OVERRIDES: [&str; 5] = [
    "CADENCE_OWNER",
    "CADENCE_DATA_DIR",
    "CADENCE_DEBOUNCE_MS",
    "CADENCE_HEARTBEAT_SECS",
    "CADENCE_STALENESS_SECS",
];

/// Read and parse a config file. A missing file yields the defaults.
pub fn read_config(path: &str) -> Result<CadenceConfig, ConfigError> {
    let path = Path::new(path);
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        return Ok(CadenceConfig::default());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(CadenceConfig::default());
    }
    let config: CadenceConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Read a config file, apply environment overrides, and validate.
pub fn read_config_with_env(path: &str) -> Result<CadenceConfig, ConfigError> {
    let mut config = read_config(path)?;
    apply_env_overrides(&mut config, |name| env::var(name).ok())?;
    validate_config(&config)?;
    Ok(config)
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ParseError(format!("{name} must be a number, got '{value}'")))
}

/// Apply overrides looked up through `lookup` (the process environment in
/// production).
pub fn apply_env_overrides<F>(config: &mut CadenceConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(owner) = lookup("CADENCE_OWNER").filter(|v| !v.trim().is_empty()) {
        config.owner = owner;
    }
    if let Some(data_dir) = lookup("CADENCE_DATA_DIR").filter(|v| !v.trim().is_empty()) {
        config.data_dir = data_dir;
    }
    if let Some(value) = lookup("CADENCE_DEBOUNCE_MS") {
        config.sync.debounce_ms = parse_number("CADENCE_DEBOUNCE_MS", &value)?;
    }
    if let Some(value) = lookup("CADENCE_HEARTBEAT_SECS") {
        config.sync.heartbeat_secs = parse_number("CADENCE_HEARTBEAT_SECS", &value)?;
    }
    if let Some(value) = lookup("CADENCE_STALENESS_SECS") {
        config.sync.staleness_secs = parse_number("CADENCE_STALENESS_SECS", &value)?;
    }
    Ok(())
}

/// Check every setting, collecting all problems.
pub fn validate_config(config: &CadenceConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.owner.trim().is_empty() {
        errors.push("owner must not be empty".to_string());
    }
    if config.data_dir.trim().is_empty() {
        errors.push("data_dir must not be empty".to_string());
    }

    let sync = &config.sync;
    if sync.debounce_ms == 0 {
        errors.push("sync.debounce_ms must be greater than zero".to_string());
    }
    if sync.heartbeat_secs == 0 {
        errors.push("sync.heartbeat_secs must be greater than zero".to_string());
    }
    if sync.staleness_secs == 0 {
        errors.push("sync.staleness_secs must be greater than zero".to_string());
    }
    if sync.max_write_attempts == 0 {
        errors.push("sync.max_write_attempts must be at least 1".to_string());
    }
    if sync.reconnect_backoff_ms == 0 {
        errors.push("sync.reconnect_backoff_ms must be greater than zero".to_string());
    }
    if sync.reconnect_backoff_max_ms < sync.reconnect_backoff_ms {
        errors.push("sync.reconnect_backoff_max_ms must not be below reconnect_backoff_ms".to_string());
    }

    if let Err(cycle_errors) = config.pomodoro.to_cycle_config().validate() {
        errors.extend(cycle_errors.into_iter().map(|e| format!("pomodoro: {e}")));
    }
    if config.leisure.default_minutes == 0 {
        errors.push("leisure.default_minutes must be greater than zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors))
    }
}

/// Write a config file, creating parent directories.
pub fn write_config(path: &str, config: &CadenceConfig) -> Result<(), ConfigError> {
    let path = Path::new(path);
    let parent = path
        .parent()
        .ok_or_else(|| ConfigError::InvalidPath(path.display().to_string()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)?;
    }
    let yaml = serde_yaml::to_string(config)?;
    fs::write(path, yaml)?;
    Ok(())
}

pub fn config_exists(path: &str) -> bool {
    Path::new(path).exists()
}
