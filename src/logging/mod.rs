//! # Logging
//!
//! Process-wide logger setup. Everything in the crate logs through the `log`
//! facade; the binary installs `env_logger` once at start-up.

use once_cell::sync::OnceCell;

static INITIALIZED: OnceCell<log::LevelFilter> = OnceCell::new();

/// Logging system errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Logging system already initialized")]
    AlreadyInitialized,
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),
    #[error("Failed to install logger: {0}")]
    Install(#[from] log::SetLoggerError),
}

/// Map a level name to a filter
pub fn parse_level(level: &str) -> Result<log::LevelFilter, LoggingError> {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => Ok(log::LevelFilter::Trace),
        "DEBUG" => Ok(log::LevelFilter::Debug),
        "INFO" => Ok(log::LevelFilter::Info),
        "WARN" => Ok(log::LevelFilter::Warn),
        "ERROR" => Ok(log::LevelFilter::Error),
        "OFF" => Ok(log::LevelFilter::Off),
        _ => Err(LoggingError::InvalidLevel(level.to_string())),
    }
}

/// Install `env_logger` with `level` as the default filter.
///
/// `RUST_LOG`, when set, takes precedence over `level`.
pub fn init(level: &str) -> Result<(), LoggingError> {
    let filter = parse_level(level)?;
    if INITIALIZED.get().is_some() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let mut builder = env_logger::Builder::new();
    builder.filter_level(filter);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    builder.format_timestamp_millis();
    builder.try_init()?;

    INITIALIZED
        .set(filter)
        .map_err(|_| LoggingError::AlreadyInitialized)
}

/// Install the logger with the default `INFO` level, ignoring a second call
pub fn init_default() {
    init("INFO").ok();
}

/// Level the logger was installed with, if any
pub fn installed_level() -> Option<log::LevelFilter> {
    INITIALIZED.get().copied()
}
