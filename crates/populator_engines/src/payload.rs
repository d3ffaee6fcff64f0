#![forbid(unsafe_code)]

use populator_contracts::envelope::EnvelopeRecord;
use populator_contracts::row::LogicalId;
use populator_contracts::ContractViolation;
use serde_json::{json, Value};
use uuid::Uuid;

/// A generated record before encryption: the envelope shell and the
/// plaintext entity destined for its `dbObject`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticRecord {
    pub logical_id: LogicalId,
    pub envelope: EnvelopeRecord,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordGenerator {
    db: String,
    collection: String,
}

impl RecordGenerator {
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            collection: collection.into(),
        }
    }

    /// Ids are derived from `index` so checksum and identity keys repeat
    /// across runs; trace ids and crypto ids are fresh each call.
    pub fn generate(&self, index: u64) -> Result<SyntheticRecord, ContractViolation> {
        let logical_id = LogicalId::record_index(index);
        let envelope = EnvelopeRecord::shell(
            &logical_id,
            guid(),
            guid(),
            &self.db,
            &self.collection,
        )?;
        let payload = address_declaration(&logical_id);
        Ok(SyntheticRecord {
            logical_id,
            envelope,
            payload,
        })
    }
}

/// An address-declaration entity with unique crypto ids.
pub fn address_declaration(logical_id: &LogicalId) -> Value {
    declaration_with_id(logical_id.as_value().clone())
}

/// Same shape, used for sample records whose `dbObject` carries no plaintext.
pub fn unique_address_declaration() -> Value {
    declaration_with_id(json!({ "declarationId": guid() }))
}

fn declaration_with_id(id: Value) -> Value {
    json!({
        "_id": id,
        "type": "addressDeclaration",
        "contractId": guid(),
        "addressNumber": {
            "type": "AddressLine",
            "cryptoId": guid()
        },
        "addressLine2": null,
        "townCity": {
            "type": "AddressLine",
            "cryptoId": guid()
        },
        "postcode": "SM5 2LE",
        "processId": guid(),
        "effectiveDate": {
            "type": "SPECIFIC_EFFECTIVE_DATE",
            "date": 20150320,
            "knownDate": 20150320
        },
        "paymentEffectiveDate": {
            "type": "SPECIFIC_EFFECTIVE_DATE",
            "date": 20150320,
            "knownDate": 20150320
        },
        "createdDateTime": {
            "$date": "2015-03-20T12:23:25.183Z"
        },
        "_version": 2,
        "_lastModifiedDateTime": {
            "$date": "2018-12-14T15:01:02.000+0000"
        }
    })
}

fn guid() -> String {
    Uuid::new_v4().to_string()
}
