//! Progress aggregation.
//!
//! A single task owns the running totals. Writers send one [`OutcomeCount`]
//! per flushed batch; the aggregator sums them and logs whenever a threshold
//! has been crossed since the last report.

use crate::ingestion::IngestionError;
use log::{info, warn};
use std::ops::AddAssign;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Report after this many new upserted or modified documents
pub const WRITE_REPORT_STEP: u64 = 100_000;
/// Report after this many new intents read
pub const READ_REPORT_STEP: u64 = 1_000_000;

/// Outcome of one flushed batch, or a running total of them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCount {
    pub upserted: u64,
    pub modified: u64,
    /// Intents included in the flush, whatever happened to them
    pub read: u64,
}

impl OutcomeCount {
    pub fn new(upserted: u64, modified: u64, read: u64) -> Self {
        Self {
            upserted,
            modified,
            read,
        }
    }

    /// A flush whose writes are unknown: nothing applied, everything consumed
    pub fn failed(read: u64) -> Self {
        Self::new(0, 0, read)
    }
}

impl AddAssign for OutcomeCount {
    fn add_assign(&mut self, rhs: Self) {
        self.upserted += rhs.upserted;
        self.modified += rhs.modified;
        self.read += rhs.read;
    }
}

/// Running totals with threshold-based reporting
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    total: OutcomeCount,
    last_reported: OutcomeCount,
    write_step: u64,
    read_step: u64,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::with_steps(WRITE_REPORT_STEP, READ_REPORT_STEP)
    }
}

impl ProgressAggregator {
    pub fn with_steps(write_step: u64, read_step: u64) -> Self {
        Self {
            total: OutcomeCount::default(),
            last_reported: OutcomeCount::default(),
            write_step,
            read_step,
        }
    }

    pub fn total(&self) -> OutcomeCount {
        self.total
    }

    /// Add one batch outcome; returns whether a progress line was emitted
    pub fn record(&mut self, count: OutcomeCount) -> bool {
        self.total += count;
        let due = self.total.upserted - self.last_reported.upserted >= self.write_step
            || self.total.modified - self.last_reported.modified >= self.write_step
            || self.total.read - self.last_reported.read >= self.read_step;
        if due {
            info!(
                "U: {} M: {} R: {}",
                self.total.upserted, self.total.modified, self.total.read
            );
            self.last_reported = self.total;
        }
        due
    }

    /// Consume counts until `done` fires, then flush anything still queued,
    /// log the summary and return the totals.
    ///
    /// An idle or closed count channel never ends the loop; only `done` does.
    pub async fn run(
        mut self,
        mut counts: mpsc::Receiver<OutcomeCount>,
        mut done: oneshot::Receiver<()>,
    ) -> OutcomeCount {
        let mut counts_open = true;
        loop {
            tokio::select! {
                biased;
                count = counts.recv(), if counts_open => match count {
                    Some(count) => {
                        self.record(count);
                    }
                    None => counts_open = false,
                },
                signal = &mut done => {
                    if signal.is_err() {
                        warn!("Progress completion signal dropped, finishing");
                    }
                    break;
                }
            }
        }

        while let Ok(count) = counts.try_recv() {
            self.record(count);
        }
        info!(
            "Done: U: {} M: {} R: {}",
            self.total.upserted, self.total.modified, self.total.read
        );
        self.total
    }
}

/// Handle on the spawned aggregator task
pub struct ProgressHandle {
    done: oneshot::Sender<()>,
    task: JoinHandle<OutcomeCount>,
}

impl ProgressHandle {
    /// Spawn `aggregator` reading from `counts`
    pub fn spawn(aggregator: ProgressAggregator, counts: mpsc::Receiver<OutcomeCount>) -> Self {
        let (done, done_rx) = oneshot::channel();
        let task = tokio::spawn(aggregator.run(counts, done_rx));
        Self { done, task }
    }

    /// Send the completion signal and wait for the final totals
    pub async fn finish(self) -> Result<OutcomeCount, IngestionError> {
        if self.done.send(()).is_err() {
            warn!("Progress aggregator already stopped");
        }
        self.task
            .await
            .map_err(|e| IngestionError::Task(format!("progress aggregator: {}", e)))
    }
}
