#![forbid(unsafe_code)]

//! Replay of hand-written sample records.
//!
//! Two file shapes are accepted, both a JSON array:
//! `{"id", "cf:data": {"timestamp", "value"}}` and the topic-oriented
//! `{"kafka_message_id", "kafka_message_timestamp", "db", "collection", "value"}`.

use std::fs;
use std::path::{Path, PathBuf};

use populator_contracts::envelope::{CORRUPT_DB_OBJECT, SENTINEL_INITIALISATION_VECTOR};
use populator_contracts::key::KeyMaterial;
use populator_contracts::table::MAX_CELL_TIMESTAMP;
use populator_engines::cipher::{EncryptionError, RecordEncryptor};
use populator_engines::payload::unique_address_declaration;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SampleDataError {
    #[error("cannot read sample file {path}: {detail}")]
    Io { path: PathBuf, detail: String },
    #[error("sample data is not a valid record array: {0}")]
    Parse(String),
    #[error("record {id}: timestamp {raw:?} is not a millisecond cell timestamp")]
    InvalidTimestamp { id: String, raw: String },
    #[error("record {index}: id must not be empty")]
    EmptyId { index: usize },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SampleEntryWire {
    CellData {
        id: String,
        #[serde(rename = "cf:data")]
        cell: CellWire,
    },
    Topic {
        kafka_message_id: String,
        kafka_message_timestamp: TimestampWire,
        db: String,
        collection: String,
        value: Value,
    },
}

#[derive(Debug, Deserialize)]
struct CellWire {
    timestamp: TimestampWire,
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TimestampWire {
    Number(u64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub id: String,
    pub timestamp: u64,
    pub db: Option<String>,
    pub collection: Option<String>,
    pub value: Value,
}

impl SampleRecord {
    /// `db`/`collection` from the entry itself, else `value.message`, else `value`.
    pub fn source(&self) -> Option<(String, String)> {
        if let (Some(db), Some(collection)) = (&self.db, &self.collection) {
            return Some((db.clone(), collection.clone()));
        }
        let candidates = [self.value.get("message"), Some(&self.value)];
        candidates.into_iter().flatten().find_map(|object| {
            let db = object.get("db")?.as_str()?;
            let collection = object.get("collection")?.as_str()?;
            Some((db.to_string(), collection.to_string()))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleTreatment {
    Encrypted,
    /// IV replaced by the sentinel; `dbObject` left as supplied.
    Corrupt,
    /// No `dbObject`; written exactly as read.
    Verbatim,
}

pub fn load_sample_file(path: &Path) -> Result<Vec<SampleRecord>, SampleDataError> {
    let raw = fs::read_to_string(path).map_err(|e| SampleDataError::Io {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    parse_sample_data(&raw)
}

pub fn parse_sample_data(raw: &str) -> Result<Vec<SampleRecord>, SampleDataError> {
    let entries: Vec<SampleEntryWire> =
        serde_json::from_str(raw).map_err(|e| SampleDataError::Parse(e.to_string()))?;
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let record = match entry {
                SampleEntryWire::CellData { id, cell } => SampleRecord {
                    timestamp: parse_timestamp(&id, cell.timestamp)?,
                    id,
                    db: None,
                    collection: None,
                    value: cell.value,
                },
                SampleEntryWire::Topic {
                    kafka_message_id,
                    kafka_message_timestamp,
                    db,
                    collection,
                    value,
                } => SampleRecord {
                    timestamp: parse_timestamp(&kafka_message_id, kafka_message_timestamp)?,
                    id: kafka_message_id,
                    db: Some(db),
                    collection: Some(collection),
                    value,
                },
            };
            if record.id.trim().is_empty() {
                return Err(SampleDataError::EmptyId { index });
            }
            Ok(record)
        })
        .collect()
}

fn parse_timestamp(id: &str, raw: TimestampWire) -> Result<u64, SampleDataError> {
    let (parsed, raw) = match raw {
        TimestampWire::Number(ts) => (Some(ts), ts.to_string()),
        TimestampWire::Text(text) => (text.trim().parse::<u64>().ok(), text),
    };
    match parsed {
        Some(ts) if ts <= MAX_CELL_TIMESTAMP => Ok(ts),
        _ => Err(SampleDataError::InvalidTimestamp {
            id: id.to_string(),
            raw,
        }),
    }
}

/// Fills the encryption fields of a sample value in place.
///
/// The `dbObject` may sit on the value itself or on its `message`.
/// A JSON-object `dbObject` is encrypted as given; any other non-corrupt
/// `dbObject` is replaced by a freshly generated entity.
pub fn seal_sample_value(
    value: &mut Value,
    key: &KeyMaterial,
    encryptor: &RecordEncryptor,
) -> Result<SampleTreatment, EncryptionError> {
    let Some(target) = db_object_holder(value) else {
        return Ok(SampleTreatment::Verbatim);
    };
    let mut encryption = match target.remove("encryption") {
        Some(Value::Object(block)) => block,
        _ => Map::new(),
    };
    let treatment = if target.get("dbObject").and_then(Value::as_str) == Some(CORRUPT_DB_OBJECT) {
        encryption.insert(
            "initialisationVector".to_string(),
            Value::String(SENTINEL_INITIALISATION_VECTOR.to_string()),
        );
        SampleTreatment::Corrupt
    } else {
        let plaintext = match target.get("dbObject") {
            Some(object @ Value::Object(_)) => object.clone(),
            _ => unique_address_declaration(),
        };
        let sealed = encryptor.encrypt(key.plaintext_key(), plaintext.to_string().as_bytes())?;
        encryption.insert(
            "initialisationVector".to_string(),
            Value::String(sealed.initialisation_vector),
        );
        encryption.insert(
            "encryptedEncryptionKey".to_string(),
            Value::String(key.wrapped_key().to_string()),
        );
        encryption.insert(
            "keyEncryptionKeyId".to_string(),
            Value::String(key.key_encryption_key_id().to_string()),
        );
        target.insert("dbObject".to_string(), Value::String(sealed.ciphertext));
        SampleTreatment::Encrypted
    };
    target.insert("encryption".to_string(), Value::Object(encryption));
    Ok(treatment)
}

fn db_object_holder(value: &mut Value) -> Option<&mut Map<String, Value>> {
    let object = value.as_object_mut()?;
    if object.contains_key("dbObject") {
        return Some(object);
    }
    object
        .get_mut("message")?
        .as_object_mut()
        .filter(|message| message.contains_key("dbObject"))
}
