//! The enrichment loop: draw, skip known identifiers, evaluate, store.

use crate::config::EnrichmentConfig;
use crate::enrichment::{EnrichmentResult, Evaluator};
use crate::ingestion::PermitPool;
use crate::sampler::{SamplerError, WeightedSampler};
use crate::store::{SharedStore, StoreError};
use log::{debug, error, info, warn};
use std::ops::AddAssign;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Outcome counts of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentStats {
    /// Draws whose every variant was evaluated and stored
    pub evaluated: u64,
    /// Draws of identifiers that already had results
    pub skipped: u64,
    /// Draws abandoned after a failed call or store error
    pub failed: u64,
    /// Draws that found no identifier
    pub no_candidate: u64,
}

impl EnrichmentStats {
    pub fn draws(&self) -> u64 {
        self.evaluated + self.skipped + self.failed + self.no_candidate
    }
}

impl AddAssign<DrawOutcome> for EnrichmentStats {
    fn add_assign(&mut self, outcome: DrawOutcome) {
        match outcome {
            DrawOutcome::Evaluated => self.evaluated += 1,
            DrawOutcome::Skipped => self.skipped += 1,
            DrawOutcome::Failed => self.failed += 1,
            DrawOutcome::NoCandidate => self.no_candidate += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    Evaluated,
    Skipped,
    Failed,
    NoCandidate,
}

struct DrawContext {
    sampler: Arc<WeightedSampler>,
    store: SharedStore,
    evaluator: Arc<dyn Evaluator>,
    variants: Vec<bool>,
}

impl DrawContext {
    async fn draw(&self) -> DrawOutcome {
        let doi = match self.sampler.sample().await {
            Ok(doi) => doi,
            Err(SamplerError::NoCandidate(reason)) => {
                debug!("No candidate: {}", reason);
                return DrawOutcome::NoCandidate;
            }
            Err(e) => {
                warn!("Sampling failed: {}", e);
                return DrawOutcome::Failed;
            }
        };

        match self.store.has_enrichment(&doi).await {
            Ok(true) => {
                debug!("{} already evaluated", doi);
                return DrawOutcome::Skipped;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("{}: {}", doi, e);
                return DrawOutcome::Failed;
            }
        }

        for &variant in &self.variants {
            let result = match self.evaluator.evaluate(&doi, variant).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("{} (use_datacite={}): {}", doi, variant, e);
                    return DrawOutcome::Failed;
                }
            };
            match self.store.put_enrichment(&doi, variant, result).await {
                Ok(()) => {}
                // Another draw of the same identifier got there first.
                Err(StoreError::DuplicateKey(key)) => debug!("{} already stored", key),
                Err(e) => {
                    error!("{}: {}", doi, e);
                    return DrawOutcome::Failed;
                }
            }
        }
        debug!("{} evaluated", doi);
        DrawOutcome::Evaluated
    }
}

/// Runs draws with at most `concurrency` in flight
pub struct EnrichmentRunner {
    ctx: Arc<DrawContext>,
    permits: PermitPool,
    stop: watch::Sender<bool>,
}

impl EnrichmentRunner {
    pub fn new(
        sampler: Arc<WeightedSampler>,
        store: SharedStore,
        evaluator: Arc<dyn Evaluator>,
        config: &EnrichmentConfig,
    ) -> EnrichmentResult<Self> {
        config.validate()?;
        let (stop, _) = watch::channel(false);
        Ok(Self {
            ctx: Arc::new(DrawContext {
                sampler,
                store,
                evaluator,
                variants: config.variants.clone(),
            }),
            permits: PermitPool::new("draws", config.concurrency),
            stop,
        })
    }

    pub fn permits(&self) -> &PermitPool {
        &self.permits
    }

    /// Start no further draws; draws in flight still complete
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Run draws until `limit` have been started or [`stop`](Self::stop) is
    /// called, then wait for the ones in flight. `None` runs until stopped.
    pub async fn run(&self, limit: Option<u64>) -> EnrichmentStats {
        let mut stop = self.stop.subscribe();
        let mut draws = JoinSet::new();
        let mut stats = EnrichmentStats::default();
        let mut started = 0u64;

        loop {
            if *stop.borrow_and_update() || limit.is_some_and(|limit| started >= limit) {
                break;
            }
            let permit = tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                permit = self.permits.acquire() => permit,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    warn!("{}", e);
                    break;
                }
            };

            started += 1;
            let ctx = self.ctx.clone();
            draws.spawn(async move {
                let outcome = ctx.draw().await;
                drop(permit);
                outcome
            });
            while let Some(joined) = draws.try_join_next() {
                Self::tally(&mut stats, joined);
            }
        }

        while let Some(joined) = draws.join_next().await {
            Self::tally(&mut stats, joined);
        }
        info!(
            "Enrichment done: {} evaluated, {} skipped, {} failed, {} without candidate",
            stats.evaluated, stats.skipped, stats.failed, stats.no_candidate
        );
        stats
    }

    fn tally(stats: &mut EnrichmentStats, joined: Result<DrawOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => *stats += outcome,
            Err(e) => {
                error!("Draw task failed: {}", e);
                *stats += DrawOutcome::Failed;
            }
        }
    }
}
