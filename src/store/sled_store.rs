use crate::config::StoreConfig;
use crate::ingestion::WriteIntent;
use crate::store::{
    identifier_prefix, publication_year, BulkWriteResult, DocumentStore, PopulationFilter,
    StoreError, StoreResult, Stratum, StratumLevel, StrataSummary, WriteError, BAD_VALUE_CODE,
    DUPLICATE_KEY_CODE, STORAGE_FAILURE_CODE,
};
use async_trait::async_trait;
use log::{debug, info};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::task;

const STRATA_PREFIX_TREE: &str = "strata_prefix";
const STRATA_YEAR_TREE: &str = "strata_year";
const ENRICHMENT_TREE: &str = "enrichment_results";

/// What a single upsert did
enum UpsertOutcome {
    Inserted,
    Replaced,
    Conflict,
}

/// sled-backed [`DocumentStore`].
///
/// Dataset documents live in one tree keyed by identifier, which doubles as
/// the unique identifier index and keeps identifiers in sorted order for the
/// sampler's offset lookups.
#[derive(Clone)]
pub struct SledStore {
    /// The underlying sled database instance
    db: sled::Db,
    /// Cached trees
    pub(crate) datasets_tree: sled::Tree,
    pub(crate) strata_prefix_tree: sled::Tree,
    pub(crate) strata_year_tree: sled::Tree,
    pub(crate) enrichment_tree: sled::Tree,
}

impl SledStore {
    /// Wraps an open sled database, opening every tree the store needs
    pub fn new(db: sled::Db, collection: &str) -> Result<Self, sled::Error> {
        let datasets_tree = db.open_tree(collection)?;
        let strata_prefix_tree = db.open_tree(STRATA_PREFIX_TREE)?;
        let strata_year_tree = db.open_tree(STRATA_YEAR_TREE)?;
        let enrichment_tree = db.open_tree(ENRICHMENT_TREE)?;

        Ok(Self {
            db,
            datasets_tree,
            strata_prefix_tree,
            strata_year_tree,
            enrichment_tree,
        })
    }

    /// Open the store described by `config`.
    ///
    /// This is the one store failure that is fatal to a run.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        let sled_config = if config.temporary {
            sled::Config::new().temporary(true)
        } else {
            sled::Config::new().path(&config.path)
        };
        let db = sled_config.open().map_err(|e| {
            StoreError::Connection(format!("{}: {}", config.path.display(), e))
        })?;
        Self::new(db, &config.collection)
            .map_err(|e| StoreError::Connection(format!("failed to open trees: {}", e)))
    }

    /// A throw-away store that is deleted on drop
    pub fn temporary() -> StoreResult<Self> {
        Self::open(&StoreConfig::temporary())
    }

    /// Gets a reference to the underlying database
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    fn encode<T: Serialize>(item: &T) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(item)?)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn year_key(prefix: &str, year: i32) -> Vec<u8> {
        format!("{}\0{:04}", prefix, year).into_bytes()
    }

    /// Scan prefix for composite keys whose first component is `head`
    fn head_scan_prefix(head: &str) -> Vec<u8> {
        format!("{}\0", head).into_bytes()
    }

    fn enrichment_key(id: &str, variant: bool) -> Vec<u8> {
        let variant = if variant { "datacite" } else { "plain" };
        format!("{}\0{}", id, variant).into_bytes()
    }

    /// Apply one intent with a compare-and-swap loop so a racing writer for
    /// the same identifier is never overwritten blindly
    fn upsert_one(&self, intent: &WriteIntent) -> StoreResult<UpsertOutcome> {
        let key = intent.id.as_bytes();
        let replacement = Self::encode(&intent.replacement)?;
        loop {
            let current = self.datasets_tree.get(key)?;
            let outcome = match &current {
                None => UpsertOutcome::Inserted,
                Some(bytes) => {
                    let stored: Value = Self::decode(bytes)?;
                    if intent.filter().matches(&stored) {
                        UpsertOutcome::Replaced
                    } else {
                        return Ok(UpsertOutcome::Conflict);
                    }
                }
            };
            match self
                .datasets_tree
                .compare_and_swap(key, current, Some(replacement.clone()))?
            {
                Ok(()) => return Ok(outcome),
                Err(_) => debug!("Concurrent write on {}, retrying", intent.id),
            }
        }
    }

    fn bulk_upsert_blocking(&self, intents: &[WriteIntent]) -> StoreResult<BulkWriteResult> {
        let mut result = BulkWriteResult::default();
        for (index, intent) in intents.iter().enumerate() {
            match self.upsert_one(intent) {
                Ok(UpsertOutcome::Inserted) => result.upserted += 1,
                Ok(UpsertOutcome::Replaced) => {
                    result.matched += 1;
                    result.modified += 1;
                }
                Ok(UpsertOutcome::Conflict) => result.write_errors.push(WriteError {
                    index,
                    code: DUPLICATE_KEY_CODE,
                    message: format!(
                        "E11000 duplicate key error: {{ id: \"{}\" }} is already at or past {}",
                        intent.id, intent.updated
                    ),
                }),
                Err(StoreError::Serialization(e)) => result.write_errors.push(WriteError {
                    index,
                    code: BAD_VALUE_CODE,
                    message: format!("{}: {}", intent.id, e),
                }),
                Err(e) => result.write_errors.push(WriteError {
                    index,
                    code: STORAGE_FAILURE_CODE,
                    message: format!("{}: {}", intent.id, e),
                }),
            }
        }
        self.datasets_tree.flush()?;
        Ok(result)
    }

    fn strata_tree(&self, level: &StratumLevel) -> (&sled::Tree, Vec<u8>) {
        match level {
            StratumLevel::Prefix => (&self.strata_prefix_tree, Vec::new()),
            StratumLevel::Year { prefix } => {
                (&self.strata_year_tree, Self::head_scan_prefix(prefix))
            }
        }
    }

    /// Non-empty strata at `level` in key order
    fn non_empty_strata(
        &self,
        level: &StratumLevel,
    ) -> impl Iterator<Item = StoreResult<Stratum>> + '_ {
        let (tree, scan) = self.strata_tree(level);
        tree.scan_prefix(scan)
            .map(|entry| {
                let (_, bytes) = entry?;
                Self::decode::<Stratum>(&bytes)
            })
            .filter(|stratum| !matches!(stratum, Ok(s) if s.count == 0))
    }

    fn nth_identifier_blocking(
        &self,
        stratum: &Stratum,
        filter: &PopulationFilter,
        offset: u64,
    ) -> StoreResult<Option<String>> {
        let scan = format!("{}/", stratum.prefix);
        let mut remaining = offset;
        for entry in self.datasets_tree.scan_prefix(scan.as_bytes()) {
            let (key, bytes) = entry?;
            let document: Value = Self::decode(&bytes)?;
            if !filter.matches(&document) {
                continue;
            }
            if stratum.year.is_some() && publication_year(&document) != stratum.year {
                continue;
            }
            if remaining == 0 {
                return Ok(Some(String::from_utf8_lossy(&key).into_owned()));
            }
            remaining -= 1;
        }
        Ok(None)
    }

    fn put_stratum_blocking(&self, stratum: &Stratum) -> StoreResult<()> {
        let bytes = Self::encode(stratum)?;
        match stratum.year {
            None => self
                .strata_prefix_tree
                .insert(stratum.prefix.as_bytes(), bytes)?,
            Some(year) => self
                .strata_year_tree
                .insert(Self::year_key(&stratum.prefix, year), bytes)?,
        };
        Ok(())
    }

    fn refresh_strata_blocking(&self, filter: &PopulationFilter) -> StoreResult<StrataSummary> {
        let mut summary = StrataSummary::default();
        let mut prefixes: BTreeMap<String, u64> = BTreeMap::new();
        let mut years: BTreeMap<(String, i32), u64> = BTreeMap::new();

        for entry in self.datasets_tree.iter() {
            let (key, bytes) = entry?;
            summary.documents_scanned += 1;
            let document: Value = Self::decode(&bytes)?;
            if !filter.matches(&document) {
                continue;
            }
            let id = String::from_utf8_lossy(&key);
            let Some(prefix) = identifier_prefix(&id) else {
                continue;
            };
            summary.documents_counted += 1;
            *prefixes.entry(prefix.to_string()).or_default() += 1;
            if let Some(year) = publication_year(&document) {
                *years.entry((prefix.to_string(), year)).or_default() += 1;
            }
        }

        self.strata_prefix_tree.clear()?;
        self.strata_year_tree.clear()?;
        for (prefix, count) in prefixes {
            self.put_stratum_blocking(&Stratum::prefix(prefix, count))?;
            summary.prefix_strata += 1;
        }
        for ((prefix, year), count) in years {
            self.put_stratum_blocking(&Stratum::year(prefix, year, count))?;
            summary.year_strata += 1;
        }
        self.db.flush()?;
        Ok(summary)
    }

    fn put_enrichment_blocking(&self, id: &str, variant: bool, mut result: Value) -> StoreResult<()> {
        if let Value::Object(map) = &mut result {
            map.insert("_id".to_string(), Value::String(id.to_string()));
            map.insert("use_datacite".to_string(), Value::Bool(variant));
        }
        let key = Self::enrichment_key(id, variant);
        let bytes = Self::encode(&result)?;
        match self
            .enrichment_tree
            .compare_and_swap(key, None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => {
                self.enrichment_tree.flush()?;
                Ok(())
            }
            Err(_) => Err(StoreError::DuplicateKey(format!(
                "enrichment result for {} (use_datacite={})",
                id, variant
            ))),
        }
    }

    /// Run `f` on the blocking pool with a clone of this handle
    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(SledStore) -> StoreResult<T> + Send + 'static,
    {
        let store = self.clone();
        task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl DocumentStore for SledStore {
    async fn bulk_upsert(&self, intents: Vec<WriteIntent>) -> StoreResult<BulkWriteResult> {
        self.blocking(move |store| store.bulk_upsert_blocking(&intents))
            .await
    }

    async fn count_documents(&self) -> StoreResult<u64> {
        // Tree::len walks the whole tree
        self.blocking(|store| Ok(store.datasets_tree.len() as u64))
            .await
    }

    async fn ensure_indexes(&self) -> StoreResult<Vec<String>> {
        // sled keeps every tree sorted by key: the dataset tree is the unique
        // identifier index, the strata trees are the stratification indexes.
        let names: Vec<String> = [
            &self.datasets_tree,
            &self.strata_prefix_tree,
            &self.strata_year_tree,
        ]
        .iter()
        .map(|tree| String::from_utf8_lossy(&tree.name()).into_owned())
        .collect();
        info!("Indexes: {}", names.join(", "));
        Ok(names)
    }

    async fn get_document(&self, id: &str) -> StoreResult<Option<Value>> {
        let id = id.to_string();
        self.blocking(move |store| match store.datasets_tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        })
        .await
    }

    async fn count_strata(&self, level: &StratumLevel) -> StoreResult<u64> {
        let level = level.clone();
        self.blocking(move |store| {
            let mut count = 0;
            for stratum in store.non_empty_strata(&level) {
                stratum?;
                count += 1;
            }
            Ok(count)
        })
        .await
    }

    async fn nth_stratum(&self, level: &StratumLevel, n: u64) -> StoreResult<Option<Stratum>> {
        let level = level.clone();
        self.blocking(move |store| {
            let n = usize::try_from(n).unwrap_or(usize::MAX);
            let stratum = store.non_empty_strata(&level).nth(n).transpose();
            stratum
        })
        .await
    }

    async fn list_strata(&self, level: &StratumLevel) -> StoreResult<Vec<Stratum>> {
        let level = level.clone();
        self.blocking(move |store| {
            let strata = store.non_empty_strata(&level).collect();
            strata
        })
        .await
    }

    async fn nth_identifier(
        &self,
        stratum: &Stratum,
        filter: &PopulationFilter,
        offset: u64,
    ) -> StoreResult<Option<String>> {
        let stratum = stratum.clone();
        let filter = filter.clone();
        self.blocking(move |store| store.nth_identifier_blocking(&stratum, &filter, offset))
            .await
    }

    async fn put_stratum(&self, stratum: Stratum) -> StoreResult<()> {
        self.blocking(move |store| store.put_stratum_blocking(&stratum))
            .await
    }

    async fn refresh_strata(&self, filter: &PopulationFilter) -> StoreResult<StrataSummary> {
        let filter = filter.clone();
        self.blocking(move |store| store.refresh_strata_blocking(&filter))
            .await
    }

    async fn has_enrichment(&self, id: &str) -> StoreResult<bool> {
        let scan = Self::head_scan_prefix(id);
        self.blocking(move |store| match store.enrichment_tree.scan_prefix(scan).next() {
            Some(entry) => {
                entry?;
                Ok(true)
            }
            None => Ok(false),
        })
        .await
    }

    async fn put_enrichment(&self, id: &str, variant: bool, result: Value) -> StoreResult<()> {
        let id = id.to_string();
        self.blocking(move |store| store.put_enrichment_blocking(&id, variant, result))
            .await
    }

    async fn get_enrichment(&self, id: &str, variant: bool) -> StoreResult<Option<Value>> {
        let key = Self::enrichment_key(id, variant);
        self.blocking(move |store| match store.enrichment_tree.get(key)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        })
        .await
    }
}
