//! # Weighted sampler
//!
//! Draws one stored identifier using the precomputed stratum counts: first a
//! prefix stratum, then optionally a publication year inside it, then an
//! offset inside the chosen stratum.
//!
//! In [`SamplingMode::Ordinal`] each non-empty stratum is equally likely,
//! whatever its size, so records of small prefixes are over-represented.
//! [`SamplingMode::Proportional`] weighs strata by their counts, which makes
//! every record of the population equally likely at the cost of reading all
//! strata of a level on every draw.

use crate::config::{SamplerConfig, SamplingMode};
use crate::store::{PopulationFilter, SharedStore, StoreError, Stratum, StratumLevel};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use thiserror::Error;

/// Errors returned by the sampler
#[derive(Error, Debug)]
pub enum SamplerError {
    /// No identifier could be drawn; the caller retries or gives up
    #[error("No candidate: {0}")]
    NoCandidate(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SamplerError {
    fn no_candidate(msg: impl Into<String>) -> Self {
        Self::NoCandidate(msg.into())
    }

    /// Undecodable store content means there is nothing to draw, not a
    /// store failure
    fn from_store(e: StoreError) -> Self {
        match e {
            StoreError::Serialization(e) => Self::no_candidate(format!("decode error: {}", e)),
            other => Self::Store(other),
        }
    }
}

/// Stratified random sampler over the stored population
pub struct WeightedSampler {
    store: SharedStore,
    config: SamplerConfig,
    filter: PopulationFilter,
    rng: Mutex<StdRng>,
}

impl WeightedSampler {
    pub fn new(store: SharedStore, config: SamplerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let filter = PopulationFilter {
            resource_type_general: config.resource_type_general.clone(),
        };
        Self {
            store,
            config,
            filter,
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Documents eligible for sampling
    pub fn filter(&self) -> &PopulationFilter {
        &self.filter
    }

    /// Uniform integer in `[0, bound)`; `bound` must be positive
    fn draw(&self, bound: u64) -> u64 {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_range(0..bound)
    }

    async fn pick_ordinal(&self, level: &StratumLevel) -> Result<Stratum, SamplerError> {
        let strata = self
            .store
            .count_strata(level)
            .await
            .map_err(SamplerError::from_store)?;
        if strata == 0 {
            return Err(SamplerError::no_candidate(format!(
                "no non-empty strata at {:?}",
                level
            )));
        }
        let n = self.draw(strata);
        self.store
            .nth_stratum(level, n)
            .await
            .map_err(SamplerError::from_store)?
            .ok_or_else(|| SamplerError::no_candidate(format!("stratum {} of {} vanished", n, strata)))
    }

    async fn pick_proportional(&self, level: &StratumLevel) -> Result<Stratum, SamplerError> {
        let strata = self
            .store
            .list_strata(level)
            .await
            .map_err(SamplerError::from_store)?;
        let total: u64 = strata.iter().map(|s| s.count).sum();
        if total == 0 {
            return Err(SamplerError::no_candidate(format!(
                "no non-empty strata at {:?}",
                level
            )));
        }
        let mut remaining = self.draw(total);
        for stratum in strata {
            if remaining < stratum.count {
                return Ok(stratum);
            }
            remaining -= stratum.count;
        }
        Err(SamplerError::no_candidate("cumulative walk overran the strata"))
    }

    /// Pick one non-empty stratum at `level` according to the sampling mode
    pub async fn pick_stratum(&self, level: &StratumLevel) -> Result<Stratum, SamplerError> {
        let stratum = match self.config.mode {
            SamplingMode::Ordinal => self.pick_ordinal(level).await?,
            SamplingMode::Proportional => self.pick_proportional(level).await?,
        };
        if stratum.count == 0 {
            return Err(SamplerError::no_candidate(format!(
                "stratum {} is empty",
                stratum.prefix
            )));
        }
        debug!(
            "Picked stratum {} {:?} ({} documents)",
            stratum.prefix, stratum.year, stratum.count
        );
        Ok(stratum)
    }

    /// The stratum a record is drawn from: a prefix, refined by year if enabled
    pub async fn pick_leaf(&self) -> Result<Stratum, SamplerError> {
        let prefix = self.pick_stratum(&StratumLevel::Prefix).await?;
        if !self.config.stratify_by_year {
            return Ok(prefix);
        }
        self.pick_stratum(&StratumLevel::Year {
            prefix: prefix.prefix,
        })
        .await
    }

    /// Draw one identifier.
    ///
    /// Never falls back to a default: every failure to find a record is
    /// reported as [`SamplerError::NoCandidate`].
    pub async fn sample(&self) -> Result<String, SamplerError> {
        let stratum = self.pick_leaf().await?;
        let offset = self.draw(stratum.count);
        let id = self
            .store
            .nth_identifier(&stratum, &self.filter, offset)
            .await
            .map_err(SamplerError::from_store)?;
        id.ok_or_else(|| {
            SamplerError::no_candidate(format!(
                "no document at offset {} of {} {:?}",
                offset, stratum.prefix, stratum.year
            ))
        })
    }
}
