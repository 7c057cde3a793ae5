use thiserror::Error;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found at expected path
    #[error("Config file not found: {0}")]
    NotFound(String),
    /// Failed to parse config file (YAML syntax error)
    #[error("Config parse error: {0}")]
    ParseError(String),
    #[error("Config IO error: {0}")]
    IoError(#[from] std::io::Error),
    /// Config validation failed
    #[error("Config validation failed:\n{}", format_errors(.0))]
    ValidationError(Vec<String>),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

fn format_errors(errors: &[String]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}\n"))
        .collect()
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
