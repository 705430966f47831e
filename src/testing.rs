//! Helpers for tests: a fault-injecting store wrapper and dump-file builders.

use crate::ingestion::{RecordTimestamp, WriteIntent};
use crate::store::{
    BulkWriteResult, DocumentStore, PopulationFilter, SledStore, StoreError, StoreResult,
    Stratum, StratumLevel, StrataSummary, WriteError, STORAGE_FAILURE_CODE,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Wraps a [`SledStore`] and injects failures into bulk writes.
///
/// Every other operation is passed through unchanged.
pub struct FaultyStore {
    inner: SledStore,
    fail_transport: AtomicBool,
    delay: Option<Duration>,
    failing_ids: HashSet<String>,
    batch_sizes: Mutex<Vec<usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: SledStore) -> Self {
        Self {
            inner,
            fail_transport: AtomicBool::new(false),
            delay: None,
            failing_ids: HashSet::new(),
            batch_sizes: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Wrap a fresh temporary sled store
    pub fn temporary() -> StoreResult<Self> {
        Ok(Self::new(SledStore::temporary()?))
    }

    /// Sleep this long inside every bulk write
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Intents for these identifiers fail with a storage error
    pub fn with_failing_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Make whole bulk-write calls fail
    pub fn set_transport_failure(&self, fail: bool) {
        self.fail_transport.store(fail, Ordering::SeqCst);
    }

    /// Sizes of every bulk write received, in call order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .map(|sizes| sizes.clone())
            .unwrap_or_default()
    }

    /// Largest number of bulk writes observed running at once
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &SledStore {
        &self.inner
    }

    async fn write(&self, intents: Vec<WriteIntent>) -> StoreResult<BulkWriteResult> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_transport.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(
                "injected transport failure".to_string(),
            ));
        }

        let mut injected = Vec::new();
        let mut positions = Vec::new();
        let mut passed = Vec::new();
        for (index, intent) in intents.into_iter().enumerate() {
            if self.failing_ids.contains(&intent.id) {
                injected.push(WriteError {
                    index,
                    code: STORAGE_FAILURE_CODE,
                    message: format!("{}: injected write failure", intent.id),
                });
            } else {
                positions.push(index);
                passed.push(intent);
            }
        }

        let mut result = self.inner.bulk_upsert(passed).await?;
        for error in &mut result.write_errors {
            error.index = positions[error.index];
        }
        result.write_errors.extend(injected);
        result.write_errors.sort_by_key(|e| e.index);
        Ok(result)
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    async fn bulk_upsert(&self, intents: Vec<WriteIntent>) -> StoreResult<BulkWriteResult> {
        if let Ok(mut sizes) = self.batch_sizes.lock() {
            sizes.push(intents.len());
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.write(intents).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn count_documents(&self) -> StoreResult<u64> {
        self.inner.count_documents().await
    }

    async fn ensure_indexes(&self) -> StoreResult<Vec<String>> {
        self.inner.ensure_indexes().await
    }

    async fn get_document(&self, id: &str) -> StoreResult<Option<Value>> {
        self.inner.get_document(id).await
    }

    async fn count_strata(&self, level: &StratumLevel) -> StoreResult<u64> {
        self.inner.count_strata(level).await
    }

    async fn nth_stratum(&self, level: &StratumLevel, n: u64) -> StoreResult<Option<Stratum>> {
        self.inner.nth_stratum(level, n).await
    }

    async fn list_strata(&self, level: &StratumLevel) -> StoreResult<Vec<Stratum>> {
        self.inner.list_strata(level).await
    }

    async fn nth_identifier(
        &self,
        stratum: &Stratum,
        filter: &PopulationFilter,
        offset: u64,
    ) -> StoreResult<Option<String>> {
        self.inner.nth_identifier(stratum, filter, offset).await
    }

    async fn put_stratum(&self, stratum: Stratum) -> StoreResult<()> {
        self.inner.put_stratum(stratum).await
    }

    async fn refresh_strata(&self, filter: &PopulationFilter) -> StoreResult<StrataSummary> {
        self.inner.refresh_strata(filter).await
    }

    async fn has_enrichment(&self, id: &str) -> StoreResult<bool> {
        self.inner.has_enrichment(id).await
    }

    async fn put_enrichment(&self, id: &str, variant: bool, result: Value) -> StoreResult<()> {
        self.inner.put_enrichment(id, variant, result).await
    }

    async fn get_enrichment(&self, id: &str, variant: bool) -> StoreResult<Option<Value>> {
        self.inner.get_enrichment(id, variant).await
    }
}

/// A DataCite-shaped dataset document
pub fn dataset_document(id: &str, updated: &str) -> Value {
    json!({
        "id": id,
        "type": "dois",
        "attributes": {
            "doi": id,
            "updated": updated,
            "publicationYear": 2020,
            "types": {"resourceTypeGeneral": "Dataset"}
        }
    })
}

/// Upsert intent for [`dataset_document`]
pub fn dataset_intent(id: &str, updated: &str) -> WriteIntent {
    WriteIntent {
        id: id.to_string(),
        updated: RecordTimestamp::parse(updated),
        replacement: dataset_document(id, updated),
    }
}

/// One dump line holding `documents` in the `data` envelope
pub fn envelope_line(documents: &[Value]) -> String {
    json!({ "data": documents }).to_string()
}

/// Write `lines` to `dir/name`, one per line
pub fn write_dump_file(dir: &Path, name: &str, lines: &[String]) -> std::io::Result<PathBuf> {
    let path = dir.join(name);
    let mut content = lines.join("\n");
    content.push('\n');
    std::fs::write(&path, content)?;
    Ok(path)
}
