//! Error types for the ingestion module

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while ingesting dump files
#[derive(Error, Debug)]
pub enum IngestionError {
    /// A line is not valid JSON
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// A line exceeds the configured maximum length
    #[error("Line of {len} bytes exceeds the limit of {max} bytes")]
    LineTooLong { len: usize, max: usize },

    /// A record is missing a required field or has it with the wrong type
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A file could not be opened, read or closed
    #[error("File error on {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The data directory could not be listed
    #[error("Cannot read data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A permit pool was closed while waiting for a permit
    #[error("Permit pool '{0}' is closed")]
    PermitPoolClosed(&'static str),

    /// The intent queue has no receiver left
    #[error("Intent queue closed")]
    QueueClosed,

    /// A pipeline task panicked or was aborted
    #[error("Pipeline task failed: {0}")]
    Task(String),

    /// Invalid loader configuration
    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigError),
}

impl IngestionError {
    /// Create a new invalid record error
    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }

    /// Create a new file error
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }
}
