//! Batch writer pool.
//!
//! A fixed set of workers share one intent queue. Each worker fills a private
//! batch and flushes it with one unordered bulk write when it is full, or when
//! a drain signal arrives. Every flush reports an [`OutcomeCount`] whose
//! `read` is the batch length, whatever the store answered.

use crate::ingestion::progress::OutcomeCount;
use crate::ingestion::{IngestionError, WriteIntent};
use crate::store::{DocumentStore, SharedStore};
use futures::future::join_all;
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// What one flush did, beyond the counts sent to the aggregator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub outcome: OutcomeCount,
    /// Items rejected as duplicate keys, i.e. already converged
    pub duplicate_conflicts: u64,
    /// Items that failed for any other reason
    pub failed_items: u64,
    /// The whole call failed or timed out
    pub transport_failure: bool,
}

/// Flush `batch` with one unordered bulk write bounded by `deadline`
pub async fn flush_batch(
    store: &dyn DocumentStore,
    batch: Vec<WriteIntent>,
    deadline: Duration,
) -> FlushReport {
    let read = batch.len() as u64;
    let mut report = FlushReport {
        outcome: OutcomeCount::failed(read),
        ..Default::default()
    };

    match timeout(deadline, store.bulk_upsert(batch)).await {
        Ok(Ok(result)) => {
            for write_error in &result.write_errors {
                if write_error.is_duplicate_key() {
                    trace!("Already converged: {}", write_error.message);
                    report.duplicate_conflicts += 1;
                } else {
                    error!("Write error: {}", write_error.message);
                    report.failed_items += 1;
                }
            }
            report.outcome = OutcomeCount::new(result.upserted, result.modified, read);
        }
        Ok(Err(e)) => {
            error!("Bulkwrite error: {}", e);
            report.transport_failure = true;
        }
        Err(_) => {
            error!(
                "Bulkwrite of {} intents timed out after {:?}",
                read, deadline
            );
            report.transport_failure = true;
        }
    }
    report
}

/// Per-worker totals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker: usize,
    pub batches_flushed: u64,
    pub intents_read: u64,
    /// Items kept back by the recency filter
    pub duplicate_conflicts: u64,
    pub failed_items: u64,
    pub transport_failures: u64,
}

/// Settings shared by all workers
#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub flush_timeout: Duration,
}

enum Event {
    Intent(WriteIntent),
    QueueClosed,
    Drain,
}

struct WriterWorker {
    id: usize,
    store: SharedStore,
    queue: Arc<Mutex<mpsc::Receiver<WriteIntent>>>,
    drain: Arc<Mutex<mpsc::Receiver<()>>>,
    counts: mpsc::Sender<OutcomeCount>,
    batch_size: usize,
    flush_timeout: Duration,
    active: Arc<AtomicUsize>,
    stats: WorkerStats,
}

impl WriterWorker {
    async fn next_event(&self, queue_open: bool) -> Event {
        tokio::select! {
            biased;
            intent = async { self.queue.lock().await.recv().await }, if queue_open => match intent {
                Some(intent) => Event::Intent(intent),
                None => Event::QueueClosed,
            },
            _ = async { self.drain.lock().await.recv().await } => Event::Drain,
        }
    }

    async fn flush(&mut self, batch: &mut Vec<WriteIntent>) {
        let intents = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        let report = flush_batch(self.store.as_ref(), intents, self.flush_timeout).await;
        debug!("Writer {} flushed: {:?}", self.id, report);

        self.stats.batches_flushed += 1;
        self.stats.intents_read += report.outcome.read;
        self.stats.duplicate_conflicts += report.duplicate_conflicts;
        self.stats.failed_items += report.failed_items;
        if report.transport_failure {
            self.stats.transport_failures += 1;
        }
        if self.counts.send(report.outcome).await.is_err() {
            warn!("Writer {}: progress aggregator is gone", self.id);
        }
    }

    async fn run(mut self) -> WorkerStats {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut queue_open = true;

        loop {
            match self.next_event(queue_open).await {
                Event::Intent(intent) => {
                    batch.push(intent);
                    if batch.len() >= self.batch_size {
                        self.flush(&mut batch).await;
                    }
                }
                Event::QueueClosed => queue_open = false,
                Event::Drain => break,
            }
        }

        // Producers are finished once drain is signalled; whatever is still
        // queued belongs to whichever worker takes it first.
        loop {
            let next = self.queue.lock().await.try_recv();
            match next {
                Ok(intent) => {
                    batch.push(intent);
                    if batch.len() >= self.batch_size {
                        self.flush(&mut batch).await;
                    }
                }
                Err(_) => break,
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        info!(
            "Writer {} done: {} batches, {} intents",
            self.id, self.stats.batches_flushed, self.stats.intents_read
        );
        self.stats
    }
}

/// The running writer workers
pub struct WriterPool {
    handles: Vec<JoinHandle<WorkerStats>>,
    drain: mpsc::Sender<()>,
    active: Arc<AtomicUsize>,
}

impl WriterPool {
    /// Spawn `settings.workers` workers draining `queue` into `store`
    pub fn spawn(
        store: SharedStore,
        queue: mpsc::Receiver<WriteIntent>,
        counts: mpsc::Sender<OutcomeCount>,
        settings: &WriterSettings,
    ) -> Self {
        let workers = settings.workers.max(1);
        let batch_size = settings.batch_size.max(1);
        let queue = Arc::new(Mutex::new(queue));
        let (drain, drain_rx) = mpsc::channel(workers);
        let drain_rx = Arc::new(Mutex::new(drain_rx));
        let active = Arc::new(AtomicUsize::new(workers));

        let handles = (0..workers)
            .map(|id| {
                let worker = WriterWorker {
                    id,
                    store: store.clone(),
                    queue: queue.clone(),
                    drain: drain_rx.clone(),
                    counts: counts.clone(),
                    batch_size,
                    flush_timeout: settings.flush_timeout,
                    active: active.clone(),
                    stats: WorkerStats {
                        worker: id,
                        ..Default::default()
                    },
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self {
            handles,
            drain,
            active,
        }
    }

    /// Workers that have not finished draining
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Send one drain signal per worker and wait until all of them have
    /// flushed their last batch
    pub async fn drain(self) -> Result<Vec<WorkerStats>, IngestionError> {
        for _ in 0..self.handles.len() {
            self.drain
                .send(())
                .await
                .map_err(|_| IngestionError::Task("writer drain channel closed".to_string()))?;
        }

        let mut stats = Vec::with_capacity(self.handles.len());
        for joined in join_all(self.handles).await {
            match joined {
                Ok(worker) => stats.push(worker),
                Err(e) => error!("Writer task failed: {}", e),
            }
        }

        let remaining = self.active.load(Ordering::SeqCst);
        if remaining != 0 {
            return Err(IngestionError::Task(format!(
                "{} writer(s) did not finish draining",
                remaining
            )));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::record::DatasetRecord;
    use crate::testing::{dataset_document, FaultyStore};

    fn intent(n: usize) -> WriteIntent {
        intent_at(n, "2020-01-01")
    }

    fn intent_at(n: usize, updated: &str) -> WriteIntent {
        let doc = dataset_document(&format!("10.1/{}", n), updated);
        WriteIntent::from_record(DatasetRecord::from_value(doc).unwrap())
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_tolerated() {
        let store = FaultyStore::temporary().unwrap();
        store
            .bulk_upsert(vec![intent_at(1, "2021-01-01")])
            .await
            .unwrap();

        let batch = vec![intent(0), intent(1), intent(2)];
        let report = flush_batch(&store, batch, Duration::from_secs(5)).await;
        assert_eq!(report.outcome, OutcomeCount::new(2, 0, 3));
        assert_eq!(report.duplicate_conflicts, 1);
        assert_eq!(report.failed_items, 0);
        assert!(!report.transport_failure);
    }

    #[tokio::test]
    async fn test_other_item_failures_do_not_abort_the_batch() {
        let store = FaultyStore::temporary().unwrap().with_failing_ids(["10.1/0"]);
        let report = flush_batch(&store, (0..4).map(intent).collect(), Duration::from_secs(5)).await;
        assert_eq!(report.outcome, OutcomeCount::new(3, 0, 4));
        assert_eq!(report.failed_items, 1);
        assert!(store.get_document("10.1/3").await.unwrap().is_some());
        assert!(store.get_document("10.1/0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_still_counts_read() {
        let store = FaultyStore::temporary().unwrap();
        store.set_transport_failure(true);
        let report = flush_batch(&store, (0..5).map(intent).collect(), Duration::from_secs(5)).await;
        assert_eq!(report.outcome, OutcomeCount::failed(5));
        assert!(report.transport_failure);
    }

    #[tokio::test]
    async fn test_timeout_aborts_only_that_flush() {
        let store = FaultyStore::temporary()
            .unwrap()
            .with_delay(Duration::from_secs(5));
        let report =
            flush_batch(&store, (0..2).map(intent).collect(), Duration::from_millis(20)).await;
        assert_eq!(report.outcome, OutcomeCount::failed(2));
        assert!(report.transport_failure);
    }

    #[tokio::test]
    async fn test_pool_flushes_full_batches_and_partial_remainder_on_drain() {
        let store = Arc::new(FaultyStore::temporary().unwrap());
        let (intent_tx, intent_rx) = mpsc::channel(64);
        let (count_tx, mut count_rx) = mpsc::channel(64);
        let pool = WriterPool::spawn(
            store.clone(),
            intent_rx,
            count_tx,
            &WriterSettings {
                workers: 1,
                batch_size: 4,
                flush_timeout: Duration::from_secs(5),
            },
        );

        for n in 0..10 {
            intent_tx.send(intent(n)).await.unwrap();
        }
        drop(intent_tx);
        assert_eq!(pool.active_workers(), 1);

        let stats = pool.drain().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].intents_read, 10);
        assert_eq!(stats[0].batches_flushed, 3);
        assert_eq!(store.batch_sizes(), vec![4, 4, 2]);

        let mut total = OutcomeCount::default();
        while let Ok(count) = count_rx.try_recv() {
            total += count;
        }
        assert_eq!(total, OutcomeCount::new(10, 0, 10));
    }

    #[tokio::test]
    async fn test_drain_empties_queue_across_workers() {
        let store = Arc::new(FaultyStore::temporary().unwrap());
        let (intent_tx, intent_rx) = mpsc::channel(128);
        let (count_tx, mut count_rx) = mpsc::channel(128);
        let pool = WriterPool::spawn(
            store.clone(),
            intent_rx,
            count_tx,
            &WriterSettings {
                workers: 3,
                batch_size: 7,
                flush_timeout: Duration::from_secs(5),
            },
        );

        // Intents still queued when drain arrives must not be lost.
        for n in 0..100 {
            intent_tx.send(intent(n)).await.unwrap();
        }
        let stats = pool.drain().await.unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.iter().map(|s| s.intents_read).sum::<u64>(), 100);
        drop(intent_tx);

        let mut read = 0;
        while let Ok(count) = count_rx.try_recv() {
            read += count.read;
        }
        assert_eq!(read, 100);
        assert!(store.batch_sizes().iter().all(|size| *size <= 7));
        assert_eq!(store.count_documents().await.unwrap(), 100);
    }
}
