//! Configuration for the loader, the store, the sampler and the enrichment runner.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `CITEFOLD_*` environment variables. The binary applies command-line flags
//! on top of the result.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`AppConfig`]
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment variable holds a value of the wrong type
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },

    /// A field is outside its allowed range
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },
}

impl ConfigError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Settings for the bulk ingestion pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Directory holding the newline-delimited JSON dump files
    pub data_dir: PathBuf,
    /// Maximum number of files read at the same time
    pub parallel_files: usize,
    /// Maximum number of records being turned into write intents at the same time
    pub parallel_datasets: usize,
    /// Number of intents per bulk write
    pub batch_size: usize,
    /// Capacity of the outcome channel feeding the progress aggregator
    pub count_buffer: usize,
    /// Number of batch writer workers
    pub workers: usize,
    /// Capacity of the shared intent queue; defaults to `batch_size` when unset
    pub queue_capacity: Option<usize>,
    /// Deadline for one bulk write, in seconds
    pub flush_timeout_secs: u64,
    /// Lines longer than this are rejected
    pub max_line_bytes: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            parallel_files: 50,
            parallel_datasets: 500,
            batch_size: 10_000,
            count_buffer: 100,
            workers: 3,
            queue_capacity: None,
            flush_timeout_secs: 600,
            max_line_bytes: 2_000_000,
        }
    }
}

impl LoaderConfig {
    /// Create a loader config reading from `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_parallel_files(mut self, n: usize) -> Self {
        self.parallel_files = n;
        self
    }

    pub fn with_parallel_datasets(mut self, n: usize) -> Self {
        self.parallel_datasets = n;
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn with_queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = Some(n);
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Effective capacity of the intent queue
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.batch_size).max(1)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel_files == 0 {
            return Err(ConfigError::validation(
                "parallel_files",
                "must be greater than 0",
            ));
        }
        if self.parallel_datasets == 0 {
            return Err(ConfigError::validation(
                "parallel_datasets",
                "must be greater than 0",
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::validation("batch_size", "must be greater than 0"));
        }
        if self.count_buffer == 0 {
            return Err(ConfigError::validation(
                "count_buffer",
                "must be greater than 0",
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::validation("workers", "must be greater than 0"));
        }
        if self.flush_timeout_secs == 0 {
            return Err(ConfigError::validation(
                "flush_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(ConfigError::validation(
                "max_line_bytes",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Where the sled store lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory of the sled database
    pub path: PathBuf,
    /// Name of the dataset collection, used as the sled tree name
    pub collection: String,
    /// Open a throw-away database that is removed on drop
    pub temporary: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./citefold-db"),
            collection: "datacite".to_string(),
            temporary: false,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// A temporary store, used by tests and dry runs
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.is_empty() {
            return Err(ConfigError::validation("collection", "must not be empty"));
        }
        Ok(())
    }
}

/// How the sampler picks a stratum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    /// Uniform over non-empty strata, then uniform within the stratum.
    /// Cheap, but small strata are over-represented.
    #[default]
    Ordinal,
    /// Stratum chosen proportionally to its count, which makes every record
    /// equally likely. Needs every stratum count at the level on each draw.
    Proportional,
}

impl std::str::FromStr for SamplingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ordinal" => Ok(Self::Ordinal),
            "proportional" => Ok(Self::Proportional),
            other => Err(ConfigError::validation(
                "mode",
                format!("unknown sampling mode '{}'", other),
            )),
        }
    }
}

/// Settings for the weighted sampler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Refine prefix strata by publication year
    pub stratify_by_year: bool,
    /// Stratum selection strategy
    pub mode: SamplingMode,
    /// Only documents with this `attributes.types.resourceTypeGeneral` are sampled
    pub resource_type_general: Option<String>,
    /// Fixed RNG seed for reproducible draws
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            stratify_by_year: false,
            mode: SamplingMode::Ordinal,
            resource_type_general: Some("Dataset".to_string()),
            seed: None,
        }
    }
}

/// Settings for the F-UJI evaluation service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Evaluation endpoint
    pub url: String,
    pub username: String,
    pub password: String,
    /// Number of draws evaluated at the same time
    pub concurrency: usize,
    /// Per-request timeout, in seconds
    pub timeout_secs: u64,
    /// Values of the `use_datacite` flag; one evaluation is stored per value
    pub variants: Vec<bool>,
    /// Prefix turning a DOI into the object identifier sent to the service
    pub doi_resolver: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:1071/fuji/api/v1/evaluate".to_string(),
            username: "fuji".to_string(),
            password: "fuji".to_string(),
            concurrency: 6,
            timeout_secs: 300,
            variants: vec![true, false],
            doi_resolver: "https://doi.org/".to_string(),
        }
    }
}

impl EnrichmentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Credentials are reported masked
    pub fn password_masked(&self) -> &'static str {
        if self.password.is_empty() {
            "<not configured>"
        } else {
            "***configured***"
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::validation("url", "must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::validation(
                "concurrency",
                "must be greater than 0",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::validation(
                "timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.variants.is_empty() {
            return Err(ConfigError::validation(
                "variants",
                "at least one variant is required",
            ));
        }
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default log level when `RUST_LOG` is not set
    pub log_level: Option<String>,
    pub loader: LoaderConfig,
    pub store: StoreConfig,
    pub sampler: SamplerConfig,
    pub enrichment: EnrichmentConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from `path` if given, otherwise start from defaults; then apply
    /// environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_vars()?;
        Ok(config)
    }

    /// Apply `CITEFOLD_*` environment variables
    pub fn apply_env_vars(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| env::var(var).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CITEFOLD_LOG_LEVEL") {
            self.log_level = Some(v);
        }
        if let Some(v) = lookup("CITEFOLD_DATA_DIR") {
            self.loader.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CITEFOLD_DB_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CITEFOLD_COLLECTION") {
            self.store.collection = v;
        }
        parse_override(&lookup, "CITEFOLD_PARALLEL_FILES", &mut self.loader.parallel_files)?;
        parse_override(
            &lookup,
            "CITEFOLD_PARALLEL_DATASETS",
            &mut self.loader.parallel_datasets,
        )?;
        parse_override(&lookup, "CITEFOLD_BATCH_SIZE", &mut self.loader.batch_size)?;
        parse_override(&lookup, "CITEFOLD_COUNT_BUFFER", &mut self.loader.count_buffer)?;
        parse_override(&lookup, "CITEFOLD_WORKERS", &mut self.loader.workers)?;
        parse_override(
            &lookup,
            "CITEFOLD_FLUSH_TIMEOUT_SECS",
            &mut self.loader.flush_timeout_secs,
        )?;
        if let Some(v) = lookup("CITEFOLD_FUJI_URL") {
            self.enrichment.url = v;
        }
        if let Some(v) = lookup("CITEFOLD_FUJI_USER") {
            self.enrichment.username = v;
        }
        if let Some(v) = lookup("CITEFOLD_FUJI_PASSWORD") {
            self.enrichment.password = v;
        }
        parse_override(
            &lookup,
            "CITEFOLD_FUJI_CONCURRENCY",
            &mut self.enrichment.concurrency,
        )?;
        if let Some(v) = lookup("CITEFOLD_SAMPLING_MODE") {
            self.sampler.mode = v.parse()?;
        }
        parse_override(
            &lookup,
            "CITEFOLD_STRATIFY_BY_YEAR",
            &mut self.sampler.stratify_by_year,
        )?;
        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.loader.validate()?;
        self.store.validate()?;
        self.enrichment.validate()?;
        Ok(())
    }
}

fn parse_override<F, T>(lookup: &F, var: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = lookup(var) {
        *target = value.parse().map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
        })?;
    }
    Ok(())
}
