//! BRS-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, BrsError>;

/// Top-level error type for the bitrot sentinel.
#[derive(Debug, Error)]
pub enum BrsError {
    #[error("[BRS-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[BRS-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[BRS-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[BRS-1004] invalid path pattern {pattern:?}: {details}")]
    InvalidPattern { pattern: String, details: String },

    #[error("[BRS-2001] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[BRS-2002] baseline store unavailable after {attempts} attempts: {details}")]
    StoreUnavailable { attempts: u32, details: String },

    #[error("[BRS-2003] duplicate baseline record for {path}")]
    DuplicatePath { path: String },

    #[error("[BRS-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[BRS-3001] permission denied for {path}")]
    PermissionDenied { path: PathBuf },

    #[error("[BRS-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[BRS-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[BRS-3004] cancelled while reading {path}")]
    Cancelled { path: PathBuf },

    #[error("[BRS-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl BrsError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "BRS-1001",
            Self::MissingConfig { .. } => "BRS-1002",
            Self::ConfigParse { .. } => "BRS-1003",
            Self::InvalidPattern { .. } => "BRS-1004",
            Self::Sql { .. } => "BRS-2001",
            Self::StoreUnavailable { .. } => "BRS-2002",
            Self::DuplicatePath { .. } => "BRS-2003",
            Self::Serialization { .. } => "BRS-2101",
            Self::PermissionDenied { .. } => "BRS-3001",
            Self::Io { .. } => "BRS-3002",
            Self::ChannelClosed { .. } => "BRS-3003",
            Self::Cancelled { .. } => "BRS-3004",
            Self::Runtime { .. } => "BRS-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::Sql { .. }
                | Self::StoreUnavailable { .. }
                | Self::Cancelled { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    ///
    /// `PermissionDenied` gets its own variant so callers can report it
    /// without the OS message noise.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return Self::PermissionDenied {
                path: path.as_ref().to_path_buf(),
            };
        }
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<rusqlite::Error> for BrsError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for BrsError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for BrsError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
