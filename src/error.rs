//! Error types for the history storage

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while storing, loading or down sampling history buckets.
///
/// A bucket that has never been written is not an error: lookups return `None`.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// Reading or writing a bucket file failed
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored bucket could not be decoded (corrupt file or schema mismatch)
    #[error("failed to deserialize {path:?}: {message}")]
    Deserialization { path: PathBuf, message: String },

    /// A bucket could not be encoded
    #[error("failed to serialize bucket: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The descriptor (or a timestamp) has no valid mapping
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// A chunk or bucket violates its invariants
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    /// The storage or the configuration is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The down sampling service has already been scheduled
    #[error("down sampling already scheduled")]
    AlreadyScheduled,
}

impl HistoryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HistoryError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn deserialization(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        HistoryError::Deserialization {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Attaches the file to errors that have been created without knowing it
    pub(crate) fn at(self, file: &Path) -> Self {
        match self {
            HistoryError::Io { path, source } if path.as_os_str().is_empty() => HistoryError::Io {
                path: file.to_path_buf(),
                source,
            },
            HistoryError::Deserialization { path, message } if path.as_os_str().is_empty() => {
                HistoryError::Deserialization {
                    path: file.to_path_buf(),
                    message,
                }
            }
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, HistoryError>;
