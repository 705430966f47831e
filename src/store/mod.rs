//! # Document store
//!
//! The pipeline, the sampler and the enrichment runner talk to storage only
//! through [`DocumentStore`]. Handles are constructed once and passed around
//! as `Arc<dyn DocumentStore>`, so tests can swap in a fake.
//!
//! * `sled_store` - sled-backed implementation used by the binary

pub mod sled_store;

pub use sled_store::SledStore;

use crate::ingestion::WriteIntent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Error code reported for a write that collides with the unique identifier.
///
/// Under the recency filter this means a document at or past the incoming
/// `updated` value is already stored.
pub const DUPLICATE_KEY_CODE: i32 = 11000;

/// Error code for a per-item write that failed inside the storage engine
pub const STORAGE_FAILURE_CODE: i32 = 1;

/// Error code for a per-item write whose document could not be encoded
pub const BAD_VALUE_CODE: i32 = 2;

/// Errors returned by store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be opened
    #[error("Failed to open store: {0}")]
    Connection(String),

    /// The storage engine failed for the whole call
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    /// A stored value could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An insert-only write found an existing key
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The blocking task running the operation died
    #[error("Store task failed: {0}")]
    Task(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Failure of one item inside an unordered bulk write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteError {
    /// Position of the intent in the submitted batch
    pub index: usize,
    pub code: i32,
    pub message: String,
}

impl WriteError {
    pub fn is_duplicate_key(&self) -> bool {
        self.code == DUPLICATE_KEY_CODE
    }
}

/// Aggregate result of an unordered bulk write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    /// Intents that inserted a new document
    pub upserted: u64,
    /// Intents that replaced an older document
    pub modified: u64,
    /// Intents whose filter matched an existing document
    pub matched: u64,
    /// Per-item failures; the other items were still applied
    pub write_errors: Vec<WriteError>,
}

/// Partition level addressed by a stratum query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumLevel {
    /// All identifier prefixes
    Prefix,
    /// Publication years inside one prefix
    Year { prefix: String },
}

/// Precomputed cardinality of one population slice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stratum {
    pub prefix: String,
    pub year: Option<i32>,
    pub count: u64,
}

impl Stratum {
    pub fn prefix(prefix: impl Into<String>, count: u64) -> Self {
        Self {
            prefix: prefix.into(),
            year: None,
            count,
        }
    }

    pub fn year(prefix: impl Into<String>, year: i32, count: u64) -> Self {
        Self {
            prefix: prefix.into(),
            year: Some(year),
            count,
        }
    }
}

/// Which stored documents belong to the sampled population
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulationFilter {
    /// Required `attributes.types.resourceTypeGeneral`
    pub resource_type_general: Option<String>,
}

impl PopulationFilter {
    pub fn resource_type(resource_type_general: impl Into<String>) -> Self {
        Self {
            resource_type_general: Some(resource_type_general.into()),
        }
    }

    /// Whether `document` is part of the population
    pub fn matches(&self, document: &Value) -> bool {
        match &self.resource_type_general {
            Some(expected) => document
                .pointer("/attributes/types/resourceTypeGeneral")
                .and_then(Value::as_str)
                .map(|actual| actual == expected)
                .unwrap_or(false),
            None => true,
        }
    }
}

/// Outcome of a strata refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrataSummary {
    pub documents_scanned: u64,
    pub documents_counted: u64,
    pub prefix_strata: u64,
    pub year_strata: u64,
}

/// Storage operations used by citefold.
///
/// Implementations must apply each upsert atomically per document; no
/// operation spans several documents transactionally.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply `intents` unordered. A failing item never stops the others.
    /// `Err` means the call as a whole failed and nothing is known about the items.
    async fn bulk_upsert(&self, intents: Vec<WriteIntent>) -> StoreResult<BulkWriteResult>;

    /// Number of stored dataset documents
    async fn count_documents(&self) -> StoreResult<u64>;

    /// Make sure the unique identifier index and the stratification indexes exist.
    /// Returns the index names.
    async fn ensure_indexes(&self) -> StoreResult<Vec<String>>;

    /// Stored dataset document by identifier
    async fn get_document(&self, id: &str) -> StoreResult<Option<Value>>;

    /// Number of strata with a non-zero count at `level`
    async fn count_strata(&self, level: &StratumLevel) -> StoreResult<u64>;

    /// The `n`-th stratum with a non-zero count at `level`, in key order
    async fn nth_stratum(&self, level: &StratumLevel, n: u64) -> StoreResult<Option<Stratum>>;

    /// Every stratum with a non-zero count at `level`, in key order
    async fn list_strata(&self, level: &StratumLevel) -> StoreResult<Vec<Stratum>>;

    /// Identifier at `offset` among documents of `stratum` matching `filter`,
    /// ordered by identifier
    async fn nth_identifier(
        &self,
        stratum: &Stratum,
        filter: &PopulationFilter,
        offset: u64,
    ) -> StoreResult<Option<String>>;

    /// Overwrite one precomputed stratum count
    async fn put_stratum(&self, stratum: Stratum) -> StoreResult<()>;

    /// Recompute every stratum count from the stored documents
    async fn refresh_strata(&self, filter: &PopulationFilter) -> StoreResult<StrataSummary>;

    /// Whether any enrichment result exists for `id`
    async fn has_enrichment(&self, id: &str) -> StoreResult<bool>;

    /// Store an enrichment result; fails with `DuplicateKey` if one is
    /// already stored for `(id, variant)`
    async fn put_enrichment(&self, id: &str, variant: bool, result: Value) -> StoreResult<()>;

    async fn get_enrichment(&self, id: &str, variant: bool) -> StoreResult<Option<Value>>;
}

/// Shared store handle
pub type SharedStore = Arc<dyn DocumentStore>;

/// Registrant prefix of a DOI: everything before the first `/`
pub fn identifier_prefix(id: &str) -> Option<&str> {
    match id.split_once('/') {
        Some((prefix, suffix)) if !prefix.is_empty() && !suffix.is_empty() => Some(prefix),
        _ => None,
    }
}

/// `attributes.publicationYear`, given either as a number or a string
pub fn publication_year(document: &Value) -> Option<i32> {
    let year = document.pointer("/attributes/publicationYear")?;
    match year {
        Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
