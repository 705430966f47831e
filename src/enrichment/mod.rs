//! # Enrichment
//!
//! Sampled identifiers are sent to the F-UJI evaluation service and the
//! returned assessments are stored next to the dataset documents.
//!
//! * `client` - HTTP client for the evaluation endpoint
//! * `runner` - Bounded-concurrency draw loop feeding the client

pub mod client;
pub mod runner;

pub use client::{EnrichmentClient, Evaluator};
pub use runner::{EnrichmentRunner, EnrichmentStats};

use crate::config::ConfigError;
use crate::sampler::SamplerError;
use crate::store::StoreError;
use thiserror::Error;

/// Errors raised while enriching sampled identifiers
#[derive(Error, Debug)]
pub enum EnrichmentError {
    /// The request could not be sent or the response not read
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with anything but 200
    #[error("Evaluation service returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The service answered 200 with something other than a JSON object
    #[error("Invalid evaluation response: {0}")]
    InvalidResponse(String),

    /// The HTTP client could not be built
    #[error("Client error: {0}")]
    Client(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

/// Result type for enrichment operations
pub type EnrichmentResult<T> = Result<T, EnrichmentError>;
