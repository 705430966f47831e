//! Pipeline coordination: wires readers, writers and the progress aggregator
//! together and drains them in order.
//!
//! Shutdown is staged. Readers are joined first, then both permit pools must
//! be idle before the intent queue is closed. Writers then receive one drain
//! signal each and flush what is left. The aggregator finishes last, so every
//! flushed batch is in the final totals.

use crate::config::LoaderConfig;
use crate::ingestion::limiter::PermitPool;
use crate::ingestion::progress::{OutcomeCount, ProgressAggregator, ProgressHandle};
use crate::ingestion::reader::{list_data_files, read_file, ReadStats, ReaderContext};
use crate::ingestion::writer::{WorkerStats, WriterPool, WriterSettings};
use crate::ingestion::IngestionError;
use crate::store::SharedStore;
use log::{error, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Lifecycle of one pipeline run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    Running,
    DrainingReaders,
    DrainingWriters,
    DrainingAggregator,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::DrainingReaders => "draining readers",
            Phase::DrainingWriters => "draining writers",
            Phase::DrainingAggregator => "draining aggregator",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// What one run did
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub totals: OutcomeCount,
    pub files_read: u64,
    pub files_failed: u64,
    /// Files never opened because the file pool was closed
    pub files_skipped: u64,
    pub lines_read: u64,
    pub decode_errors: u64,
    pub records_rejected: u64,
    pub records_dispatched: u64,
    pub documents_before: Option<u64>,
    pub documents_after: Option<u64>,
    pub workers: Vec<WorkerStats>,
    pub elapsed: Duration,
}

/// The bulk ingestion pipeline
pub struct Pipeline {
    config: LoaderConfig,
    store: SharedStore,
    files: PermitPool,
    dispatch: PermitPool,
    phase: watch::Sender<Phase>,
}

impl Pipeline {
    pub fn new(config: LoaderConfig, store: SharedStore) -> Result<Self, IngestionError> {
        config.validate()?;
        let files = PermitPool::new("files", config.parallel_files);
        let dispatch = PermitPool::new("datasets", config.parallel_datasets);
        let (phase, _) = watch::channel(Phase::Idle);
        Ok(Self {
            config,
            store,
            files,
            dispatch,
            phase,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Observe phase transitions
    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn file_pool(&self) -> &PermitPool {
        &self.files
    }

    pub fn dispatch_pool(&self) -> &PermitPool {
        &self.dispatch
    }

    /// Stop admitting work. Files not yet opened and records not yet
    /// dispatched are skipped; everything already queued is still written.
    pub fn stop(&self) {
        warn!("Stopping pipeline, remaining input will be skipped");
        self.files.close();
        self.dispatch.close();
    }

    fn set_phase(&self, phase: Phase) {
        info!("Pipeline {}", phase);
        self.phase.send_replace(phase);
    }

    async fn count_documents(&self) -> Option<u64> {
        match self.store.count_documents().await {
            Ok(count) => {
                info!("Count: {}", count);
                Some(count)
            }
            Err(e) => {
                warn!("Could not count documents: {}", e);
                None
            }
        }
    }

    async fn wait_idle(pool: &PermitPool) {
        if pool.is_closed() {
            return;
        }
        if let Err(e) = pool.wait_idle().await {
            warn!("{}", e);
        }
    }

    /// Ingest every file of the configured data directory
    pub async fn run(&self) -> Result<PipelineSummary, IngestionError> {
        let files = list_data_files(&self.config.data_dir).await?;
        info!(
            "Found {} file(s) in {}",
            files.len(),
            self.config.data_dir.display()
        );
        self.run_files(files).await
    }

    /// Ingest `files`, at most `parallel_files` at a time
    pub async fn run_files(&self, files: Vec<PathBuf>) -> Result<PipelineSummary, IngestionError> {
        let started = Instant::now();
        let documents_before = self.count_documents().await;
        self.set_phase(Phase::Running);

        let (intent_tx, intent_rx) = mpsc::channel(self.config.queue_capacity());
        let (count_tx, count_rx) = mpsc::channel(self.config.count_buffer.max(1));
        let progress = ProgressHandle::spawn(ProgressAggregator::default(), count_rx);
        let writers = WriterPool::spawn(
            self.store.clone(),
            intent_rx,
            count_tx,
            &WriterSettings {
                workers: self.config.workers,
                batch_size: self.config.batch_size,
                flush_timeout: self.config.flush_timeout(),
            },
        );

        let ctx = Arc::new(ReaderContext {
            dispatch: self.dispatch.clone(),
            intents: intent_tx,
            max_line_bytes: self.config.max_line_bytes,
            stats: ReadStats::default(),
        });

        let mut readers = JoinSet::new();
        let mut files_skipped = 0;
        for path in files {
            let permit = match self.files.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    files_skipped += 1;
                    continue;
                }
            };
            let ctx = ctx.clone();
            readers.spawn(async move { read_file(&ctx, path, permit).await });
            while let Some(joined) = readers.try_join_next() {
                log_reader_result(joined);
            }
        }

        self.set_phase(Phase::DrainingReaders);
        while let Some(joined) = readers.join_next().await {
            log_reader_result(joined);
        }
        Self::wait_idle(&self.files).await;
        Self::wait_idle(&self.dispatch).await;

        let stats = &ctx.stats;
        let files_read = ReadStats::get(&stats.files_read);
        let files_failed = ReadStats::get(&stats.files_failed);
        let lines_read = ReadStats::get(&stats.lines_read);
        let decode_errors = ReadStats::get(&stats.decode_errors);
        let records_rejected = ReadStats::get(&stats.records_rejected);
        let records_dispatched = ReadStats::get(&stats.records_dispatched);
        // Last sender of the intent queue
        drop(ctx);

        self.set_phase(Phase::DrainingWriters);
        let drained = writers.drain().await;

        self.set_phase(Phase::DrainingAggregator);
        let totals = progress.finish().await?;
        let workers = drained?;

        let documents_after = self.count_documents().await;
        self.set_phase(Phase::Done);

        let summary = PipelineSummary {
            totals,
            files_read,
            files_failed,
            files_skipped,
            lines_read,
            decode_errors,
            records_rejected,
            records_dispatched,
            documents_before,
            documents_after,
            workers,
            elapsed: started.elapsed(),
        };
        info!(
            "Ingested {} file(s) ({} failed) in {:.1}s: {} dispatched, {} rejected, {} undecodable line(s)",
            summary.files_read,
            summary.files_failed,
            summary.elapsed.as_secs_f64(),
            summary.records_dispatched,
            summary.records_rejected,
            summary.decode_errors
        );
        Ok(summary)
    }
}

fn log_reader_result(joined: Result<Result<(), IngestionError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{}", e),
        Err(e) => error!("Reader task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;

    #[test]
    fn test_invalid_config_is_rejected() {
        let store: SharedStore = Arc::new(SledStore::temporary().unwrap());
        let config = LoaderConfig::new("/tmp").with_workers(0);
        assert!(matches!(
            Pipeline::new(config, store),
            Err(IngestionError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_run_reaches_done() {
        let store: SharedStore = Arc::new(SledStore::temporary().unwrap());
        let pipeline = Pipeline::new(LoaderConfig::new("/tmp"), store).unwrap();
        let phases = pipeline.subscribe_phase();
        assert_eq!(pipeline.phase(), Phase::Idle);

        let summary = pipeline.run_files(Vec::new()).await.unwrap();
        assert_eq!(summary.totals, OutcomeCount::default());
        assert_eq!(summary.documents_before, Some(0));
        assert_eq!(summary.documents_after, Some(0));
        assert_eq!(summary.workers.len(), 3);
        assert_eq!(*phases.borrow(), Phase::Done);
    }

    #[tokio::test]
    async fn test_stopped_pipeline_skips_files() {
        let store: SharedStore = Arc::new(SledStore::temporary().unwrap());
        let pipeline = Pipeline::new(LoaderConfig::new("/tmp"), store).unwrap();
        pipeline.stop();
        let summary = pipeline
            .run_files(vec![PathBuf::from("a"), PathBuf::from("b")])
            .await
            .unwrap();
        assert_eq!(summary.files_skipped, 2);
        assert_eq!(summary.files_read, 0);
        assert_eq!(pipeline.phase(), Phase::Done);
    }
}
