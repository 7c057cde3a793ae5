use std::env;
use std::path::{Path, PathBuf};

pub const LOCAL_CONFIG_FILE: &str = "cadence.config.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLocationType {
    Local,
    Global,
}

/// Where the active configuration lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLocation {
    pub config_type: ConfigLocationType,
    pub config_path: String,
}

impl ConfigLocation {
    /// Directory relative paths in the config are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        Path::new(&self.config_path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Get the global config directory (~/.config/cadence or $XDG_CONFIG_HOME/cadence)
pub fn get_global_config_dir() -> PathBuf {
    let base = if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg)
    } else if let Some(home) = dirs::home_dir() {
        home.join(".config")
    } else {
        PathBuf::from(".config")
    };
    base.join("cadence")
}

/// Walk up from start_dir looking for cadence.config.yaml
pub fn find_local_config(start_dir: Option<&Path>) -> Option<PathBuf> {
    let start = match start_dir {
        Some(dir) => dir.to_path_buf(),
        None => env::current_dir().ok()?,
    };

    let mut dir = start.as_path();

    loop {
        let config_path = dir.join(LOCAL_CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        match dir.parent() {
            Some(parent) if parent != dir => dir = parent,
            _ => break,
        }
    }

    None
}

/// Priority: local config (walk up tree) > global config
pub fn resolve_paths() -> ConfigLocation {
    resolve_paths_from(None)
}

pub fn resolve_paths_from(start_dir: Option<&Path>) -> ConfigLocation {
    if let Some(local_config) = find_local_config(start_dir) {
        return ConfigLocation {
            config_type: ConfigLocationType::Local,
            config_path: local_config.to_string_lossy().to_string(),
        };
    }

    ConfigLocation {
        config_type: ConfigLocationType::Global,
        config_path: get_global_config_dir()
            .join("config.yaml")
            .to_string_lossy()
            .to_string(),
    }
}

/// Absolute data directory; relative paths are taken from the config
/// file's directory.
pub fn resolve_data_dir(location: &ConfigLocation, data_dir: &str) -> PathBuf {
    let path = Path::new(data_dir);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        location.base_dir().join(path)
    }
}
