use crate::config::ConfigError;
use crate::enrichment::EnrichmentError;
use crate::ingestion::IngestionError;
use crate::logging::LoggingError;
use crate::sampler::SamplerError;
use crate::store::StoreError;
use thiserror::Error;

/// Unified error type for the citefold crate.
///
/// Each subsystem keeps its own error enum; this type exists so the binary and
/// callers composing several subsystems can propagate any of them with `?`.
///
/// Only a few of these are ever fatal. Opening the store and loading the
/// configuration are the failures that stop a run before any pipeline starts;
/// everything raised inside the ingestion pipeline is logged and counted where
/// it happens.
#[derive(Error, Debug)]
pub enum CitefoldError {
    /// Errors raised by the document store
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Errors raised while ingesting input files
    #[error("Ingestion error: {0}")]
    Ingestion(#[from] IngestionError),

    /// Errors raised by the weighted sampler
    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    /// Errors raised while calling the evaluation service
    #[error("Enrichment error: {0}")]
    Enrichment(#[from] EnrichmentError),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Logging could not be set up
    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    /// Errors related to IO operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for crate-level operations
pub type CitefoldResult<T> = Result<T, CitefoldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_convert_into_crate_error() {
        let err: CitefoldError = StoreError::Connection("refused".to_string()).into();
        assert!(matches!(err, CitefoldError::Store(_)));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn io_errors_keep_their_message() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing dir");
        let err = CitefoldError::from(io);
        assert_eq!(err.to_string(), "IO error: missing dir");
    }
}
