#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::validate_token;
use crate::row::LogicalId;
use crate::{ContractViolation, Validate};

/// `dbObject` marker for a deliberately malformed sample record.
pub const CORRUPT_DB_OBJECT: &str = "CORRUPT";
/// IV written in place of a real one for corrupt sample records.
pub const SENTINEL_INITIALISATION_VECTOR: &str = "PHONEYVECTOR";

pub const ENVELOPE_OUTER_TYPE: &str = "V4";
pub const ENVELOPE_INNER_TYPE: &str = "MONGO_INSERT";
pub const ENVELOPE_VERSION: &str = "core-4.master.9790";
pub const ENVELOPE_TIMESTAMP: &str = "2019-07-04T07:27:35.104+0000";
pub const ENVELOPE_LAST_MODIFIED: &str = "2018-12-14T15:01:02.000+0000";

pub fn topic_name(db: &str, collection: &str) -> String {
    format!("db.{db}.{collection}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionBlock {
    #[serde(default)]
    pub encryption_key_id: String,
    #[serde(default)]
    pub encrypted_encryption_key: String,
    #[serde(default)]
    pub initialisation_vector: String,
    #[serde(default)]
    pub key_encryption_key_id: String,
}

impl EncryptionBlock {
    pub fn is_sentinel(&self) -> bool {
        self.initialisation_vector == SENTINEL_INITIALISATION_VECTOR
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMessage {
    pub db: String,
    pub collection: String,
    #[serde(rename = "_id")]
    pub id: Value,
    #[serde(rename = "_timeBasedHash")]
    pub time_based_hash: String,
    #[serde(rename = "@type")]
    pub message_type: String,
    #[serde(rename = "_lastModifiedDateTime")]
    pub last_modified_date_time: String,
    pub encryption: EncryptionBlock,
    #[serde(rename = "dbObject")]
    pub db_object: String,
}

/// Wire-shaped wrapper around one encrypted database entity.
///
/// Built as an empty shell, then filled in place once the payload has been
/// encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeRecord {
    #[serde(rename = "traceId")]
    pub trace_id: String,
    #[serde(rename = "unitOfWorkId")]
    pub unit_of_work_id: String,
    #[serde(rename = "@type")]
    pub envelope_type: String,
    pub message: EnvelopeMessage,
    pub version: String,
    pub timestamp: String,
}

impl EnvelopeRecord {
    pub fn shell(
        logical_id: &LogicalId,
        trace_id: String,
        unit_of_work_id: String,
        db: &str,
        collection: &str,
    ) -> Result<Self, ContractViolation> {
        validate_token("envelope_record.trace_id", &trace_id, 128)?;
        validate_token("envelope_record.unit_of_work_id", &unit_of_work_id, 128)?;
        validate_token("envelope_record.message.db", db, 128)?;
        validate_token("envelope_record.message.collection", collection, 128)?;
        Ok(Self {
            trace_id,
            unit_of_work_id,
            envelope_type: ENVELOPE_OUTER_TYPE.to_string(),
            message: EnvelopeMessage {
                db: db.to_string(),
                collection: collection.to_string(),
                id: logical_id.as_value().clone(),
                time_based_hash: "hash".to_string(),
                message_type: ENVELOPE_INNER_TYPE.to_string(),
                last_modified_date_time: ENVELOPE_LAST_MODIFIED.to_string(),
                encryption: EncryptionBlock::default(),
                db_object: String::new(),
            },
            version: ENVELOPE_VERSION.to_string(),
            timestamp: ENVELOPE_TIMESTAMP.to_string(),
        })
    }

    pub fn seal(
        &mut self,
        initialisation_vector: String,
        ciphertext: String,
        wrapped_key: &str,
        key_encryption_key_id: &str,
    ) {
        let encryption = &mut self.message.encryption;
        encryption.initialisation_vector = initialisation_vector;
        encryption.encrypted_encryption_key = wrapped_key.to_string();
        encryption.key_encryption_key_id = key_encryption_key_id.to_string();
        self.message.db_object = ciphertext;
    }

    pub fn logical_id(&self) -> Result<LogicalId, ContractViolation> {
        LogicalId::v1(self.message.id.clone())
    }

    pub fn topic_name(&self) -> String {
        topic_name(&self.message.db, &self.message.collection)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Validate for EnvelopeRecord {
    /// A record is storable once it carries an IV and ciphertext, or is an
    /// explicit corrupt-record case.
    fn validate(&self) -> Result<(), ContractViolation> {
        let encryption = &self.message.encryption;
        if encryption.is_sentinel() {
            return Ok(());
        }
        if encryption.initialisation_vector.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "envelope_record.message.encryption.initialisation_vector",
                reason: "must be populated before storage",
            });
        }
        if self.message.db_object.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "envelope_record.message.db_object",
                reason: "must hold ciphertext before storage",
            });
        }
        Ok(())
    }
}
