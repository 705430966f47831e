//! # citefold
//!
//! Converges newline-delimited DataCite metadata dumps into a document store
//! and samples the stored population for enrichment by the F-UJI evaluation
//! service.
//!
//! ## Core Components
//!
//! * `ingestion` - Concurrent bulk-ingestion pipeline with staged shutdown
//! * `store` - Document store interface and its sled implementation
//! * `sampler` - Stratified random sampling over prefixes and years
//! * `enrichment` - Evaluation client and the draw loop feeding it
//! * `config` - Configuration loaded from TOML and `CITEFOLD_*` variables
//! * `logging` - Logger setup
//! * `error` - Error types and handling
//!
//! ## Architecture
//!
//! Every record is written as an upsert guarded by its `attributes.updated`
//! value, so files can be loaded in any order, twice, or interleaved with
//! newer dumps and the store still converges to the newest version of each
//! record. The store handle is created once and shared as an
//! `Arc<dyn DocumentStore>`.

pub mod config;
pub mod enrichment;
pub mod error;
pub mod ingestion;
pub mod logging;
pub mod sampler;
pub mod store;
pub mod testing;

// Re-export main types for convenience
pub use config::{AppConfig, LoaderConfig, SamplerConfig, SamplingMode, StoreConfig};
pub use enrichment::{EnrichmentClient, EnrichmentError, EnrichmentRunner, EnrichmentStats};
pub use error::{CitefoldError, CitefoldResult};
pub use ingestion::{IngestionError, OutcomeCount, Phase, Pipeline, PipelineSummary, WriteIntent};
pub use sampler::{SamplerError, WeightedSampler};
pub use store::{DocumentStore, SharedStore, SledStore, StoreError};
