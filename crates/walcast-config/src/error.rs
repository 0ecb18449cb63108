use thiserror::Error;

/// Errors that can occur when parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("environment variable '{name}' is not set")]
    UnresolvedVariable { name: String },

    #[error("unterminated variable reference in '{value}'")]
    UnterminatedVariable { value: String },

    #[error("invalid table '{name}': {message}")]
    InvalidTable { name: String, message: String },

    #[error("status_interval_secs must be positive")]
    InvalidStatusInterval,

    #[error("backoff min_delay_ms ({min}) must be positive and not exceed max_delay_ms ({max})")]
    InvalidBackoff { min: u64, max: u64 },

    #[error(transparent)]
    Core(#[from] walcast_core::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
