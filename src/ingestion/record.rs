//! Line decoding: one line of a dump file becomes zero or more dataset records.

use crate::ingestion::IngestionError;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Envelope key holding a list of records
pub const COLLECTION_FIELD: &str = "data";
/// Unique identifier of a record
pub const ID_FIELD: &str = "id";

/// The `attributes.updated` value of a record.
///
/// Values that parse as RFC 3339 or as a plain date compare by instant;
/// anything else compares by its raw text.
#[derive(Debug, Clone)]
pub struct RecordTimestamp {
    raw: String,
    key: String,
}

impl RecordTimestamp {
    pub fn parse(raw: &str) -> Self {
        let key = DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
            })
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .unwrap_or_else(|| raw.to_string());
        Self {
            raw: raw.to_string(),
            key,
        }
    }

    /// `attributes.updated` of `document`, if present as a string
    pub fn of(document: &Value) -> Option<Self> {
        document
            .pointer("/attributes/updated")
            .and_then(Value::as_str)
            .map(Self::parse)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for RecordTimestamp {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for RecordTimestamp {}

impl PartialOrd for RecordTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecordTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for RecordTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A validated dataset record
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRecord {
    pub id: String,
    pub updated: RecordTimestamp,
    /// The full document as read, stored unchanged
    pub document: Value,
}

impl DatasetRecord {
    /// Validate `document`, failing closed on a missing or mis-typed
    /// identifier or `attributes.updated`
    pub fn from_value(document: Value) -> Result<Self, IngestionError> {
        let id = match document.get(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::String(_)) => {
                return Err(IngestionError::invalid_record("empty identifier"))
            }
            Some(other) => {
                return Err(IngestionError::invalid_record(format!(
                    "identifier is not a string: {}",
                    other
                )))
            }
            None => return Err(IngestionError::invalid_record("missing identifier")),
        };

        let updated = match document.get("attributes") {
            Some(Value::Object(attributes)) => match attributes.get("updated") {
                Some(Value::String(updated)) => RecordTimestamp::parse(updated),
                Some(_) => {
                    return Err(IngestionError::invalid_record(format!(
                        "{}: attributes.updated is not a string",
                        id
                    )))
                }
                None => {
                    return Err(IngestionError::invalid_record(format!(
                        "{}: missing attributes.updated",
                        id
                    )))
                }
            },
            _ => {
                return Err(IngestionError::invalid_record(format!(
                    "{}: missing attributes",
                    id
                )))
            }
        };

        Ok(Self {
            id,
            updated,
            document,
        })
    }
}

/// Records decoded from one line, and the ones that failed validation
#[derive(Debug, Default)]
pub struct LineOutcome {
    pub records: Vec<DatasetRecord>,
    pub rejected: Vec<IngestionError>,
}

impl LineOutcome {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.rejected.is_empty()
    }
}

/// Decode one line.
///
/// Blank lines yield nothing. `Err` is returned only when the line is not a
/// JSON document at all; single elements that fail validation are collected
/// in [`LineOutcome::rejected`].
pub fn extract_records(line: &[u8]) -> Result<LineOutcome, IngestionError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(LineOutcome::default());
    }

    let parsed: Value = serde_json::from_slice(line)?;
    let mut outcome = LineOutcome::default();

    let Value::Object(mut map) = parsed else {
        return Ok(outcome);
    };

    let candidates = if matches!(map.get(COLLECTION_FIELD), Some(Value::Array(_))) {
        match map.remove(COLLECTION_FIELD) {
            Some(Value::Array(elements)) => elements,
            _ => Vec::new(),
        }
    } else if map.contains_key(ID_FIELD) {
        vec![Value::Object(map)]
    } else {
        Vec::new()
    };

    for candidate in candidates {
        match DatasetRecord::from_value(candidate) {
            Ok(record) => outcome.records.push(record),
            Err(e) => outcome.rejected.push(e),
        }
    }

    Ok(outcome)
}
