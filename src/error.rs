//! Structured error types for configuration loading.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Setup conflicts
    DirectoryConflict,
    EnvironmentConflict,

    // Document errors
    ParseError,
    ResolutionError,

    // Runtime errors
    IoError,
    NotReady,
    InvalidKey,
}

/// Errors raised while configuring, loading or querying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "cannot change the config directory once it was set (current: {}, requested: {})",
        .current.display(),
        .requested.display()
    )]
    DirectoryConflict { current: PathBuf, requested: PathBuf },

    #[error("cannot change the environment once it was set (active: {active}, requested: {requested})")]
    EnvironmentConflict { active: String, requested: String },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to resolve `{key_path}` via {protocol}: {reason}")]
    Resolution {
        key_path: String,
        protocol: String,
        reason: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration has not been loaded")]
    NotReady,

    #[error("`{key}` cannot name a configuration group file")]
    InvalidKey { key: String },
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ConfigError::DirectoryConflict { .. } => ErrorCode::DirectoryConflict,
            ConfigError::EnvironmentConflict { .. } => ErrorCode::EnvironmentConflict,
            ConfigError::Parse { .. } => ErrorCode::ParseError,
            ConfigError::Resolution { .. } => ErrorCode::ResolutionError,
            ConfigError::Io { .. } => ErrorCode::IoError,
            ConfigError::NotReady => ErrorCode::NotReady,
            ConfigError::InvalidKey { .. } => ErrorCode::InvalidKey,
        }
    }

    /// True for errors raised before any I/O because of conflicting setup calls.
    pub fn is_setup_conflict(&self) -> bool {
        matches!(
            self,
            ConfigError::DirectoryConflict { .. } | ConfigError::EnvironmentConflict { .. }
        )
    }

    // Convenience constructors

    pub fn parse(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        ConfigError::Parse {
            path: path.into(),
            source,
        }
    }

    pub fn resolution(
        key_path: impl Into<String>,
        protocol: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        ConfigError::Resolution {
            key_path: key_path.into(),
            protocol: protocol.into(),
            reason: reason.to_string(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ConfigError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
