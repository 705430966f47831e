//! Write intents: a replacement document guarded by a recency filter.

use crate::ingestion::record::{DatasetRecord, RecordTimestamp};
use serde_json::Value;

/// Pending upsert of one dataset document.
///
/// The replacement is applied when no document with the identifier exists, or
/// when the stored document is strictly older than `updated`. Applying the
/// same intent twice changes nothing the second time.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteIntent {
    pub id: String,
    pub updated: RecordTimestamp,
    pub replacement: Value,
}

impl WriteIntent {
    /// Build the intent for a validated record
    pub fn from_record(record: DatasetRecord) -> Self {
        Self {
            id: record.id,
            updated: record.updated,
            replacement: record.document,
        }
    }

    pub fn filter(&self) -> RecencyFilter<'_> {
        RecencyFilter {
            id: &self.id,
            updated: &self.updated,
        }
    }
}

impl From<DatasetRecord> for WriteIntent {
    fn from(record: DatasetRecord) -> Self {
        Self::from_record(record)
    }
}

/// `id == intent.id AND stored.updated < intent.updated`
#[derive(Debug, Clone, Copy)]
pub struct RecencyFilter<'a> {
    id: &'a str,
    updated: &'a RecordTimestamp,
}

impl RecencyFilter<'_> {
    /// Whether the stored `document` is replaced by the intent.
    ///
    /// A stored document without a readable `attributes.updated` never matches.
    pub fn matches(&self, document: &Value) -> bool {
        let same_id = document
            .get(crate::ingestion::record::ID_FIELD)
            .and_then(Value::as_str)
            == Some(self.id);
        same_id
            && RecordTimestamp::of(document)
                .map(|stored| stored < *self.updated)
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intent(id: &str, updated: &str) -> WriteIntent {
        let doc = json!({"id": id, "attributes": {"updated": updated}});
        WriteIntent::from_record(DatasetRecord::from_value(doc).unwrap())
    }

    #[test]
    fn test_intent_keeps_the_whole_document() {
        let doc = json!({"id": "10.1/a", "attributes": {"updated": "2020-01-01", "title": "t"}});
        let intent: WriteIntent = DatasetRecord::from_value(doc.clone()).unwrap().into();
        assert_eq!(intent.id, "10.1/a");
        assert_eq!(intent.replacement, doc);
        assert_eq!(intent.updated.as_str(), "2020-01-01");
    }

    #[test]
    fn test_filter_matches_only_older_documents() {
        let newer = intent("10.1/a", "2021-01-01");
        let stored_old = json!({"id": "10.1/a", "attributes": {"updated": "2020-01-01"}});
        let stored_same = json!({"id": "10.1/a", "attributes": {"updated": "2021-01-01T00:00:00Z"}});
        let stored_new = json!({"id": "10.1/a", "attributes": {"updated": "2022-01-01"}});
        assert!(newer.filter().matches(&stored_old));
        assert!(!newer.filter().matches(&stored_same));
        assert!(!newer.filter().matches(&stored_new));
    }

    #[test]
    fn test_filter_requires_same_identifier_and_timestamp() {
        let newer = intent("10.1/a", "2021-01-01");
        let other = json!({"id": "10.1/b", "attributes": {"updated": "2000-01-01"}});
        let undated = json!({"id": "10.1/a", "attributes": {}});
        assert!(!newer.filter().matches(&other));
        assert!(!newer.filter().matches(&undated));
    }
}
