//! # Ingestion Module
//!
//! Bulk loading of DataCite dump files into the document store.
//!
//! ## Components
//!
//! * `record` - Line decoding and record validation
//! * `write_intent` - Upsert intents guarded by a recency filter
//! * `limiter` - Permit pools bounding open files and in-flight records
//! * `reader` - Sequential reading of one dump file
//! * `writer` - Batch writer workers and their drain protocol
//! * `progress` - Outcome aggregation and progress reporting
//! * `coordinator` - The pipeline and its staged shutdown
//! * `error` - Custom error types for ingestion operations
//!
//! ## Architecture
//!
//! 1. Dump files are listed and opened under the file pool
//! 2. Each line yields records, each dispatched under the record pool
//! 3. Write intents go through one bounded queue shared by the writers
//! 4. Writers flush full batches as bulk upserts and report outcomes
//! 5. The aggregator sums outcomes until the pipeline has drained

pub mod coordinator;
pub mod error;
pub mod limiter;
pub mod progress;
pub mod reader;
pub mod record;
pub mod write_intent;
pub mod writer;

// Public re-exports
pub use coordinator::{Phase, Pipeline, PipelineSummary};
pub use error::IngestionError;
pub use limiter::{Permit, PermitPool};
pub use progress::{OutcomeCount, ProgressAggregator, ProgressHandle};
pub use reader::{list_data_files, read_file, ReadStats, ReaderContext};
pub use record::{extract_records, DatasetRecord, LineOutcome, RecordTimestamp};
pub use write_intent::{RecencyFilter, WriteIntent};
pub use writer::{flush_batch, FlushReport, WorkerStats, WriterPool, WriterSettings};

/// Result type for ingestion operations
pub type IngestionResult<T> = Result<T, IngestionError>;
