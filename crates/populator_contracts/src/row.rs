#![forbid(unsafe_code)]

use serde_json::Value;

use crate::{ContractViolation, Validate};

pub const CHECKSUM_PREFIX_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    Checksum,
    Salt,
    Identity,
}

impl AddressingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressingMode::Checksum => "checksum",
            AddressingMode::Salt => "salt",
            AddressingMode::Identity => "identity",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "checksum" | "checksum-prefixed" => Some(AddressingMode::Checksum),
            "salt" | "salt-prefixed" => Some(AddressingMode::Salt),
            "identity" | "natural" => Some(AddressingMode::Identity),
            _ => None,
        }
    }

    /// Whether the same logical id always maps to the same row key.
    pub fn is_deterministic(self) -> bool {
        !matches!(self, AddressingMode::Salt)
    }
}

/// The logical identifier of a record: the JSON value of its `_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalId(Value);

impl LogicalId {
    pub fn v1(value: Value) -> Result<Self, ContractViolation> {
        let id = Self(value);
        id.validate()?;
        Ok(id)
    }

    pub fn natural(raw: &str) -> Result<Self, ContractViolation> {
        Self::v1(Value::String(raw.to_string()))
    }

    /// `{"record_id": "<i padded to 5>"}`, the id shape of generated records.
    pub fn record_index(index: u64) -> Self {
        let mut object = serde_json::Map::new();
        object.insert(
            "record_id".to_string(),
            Value::String(format!("{index:05}")),
        );
        Self(Value::Object(object))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Compact JSON with object keys in sorted order.
    pub fn canonical_json(&self) -> String {
        sorted(&self.0).to_string()
    }

    /// The bare string for string ids, canonical JSON otherwise.
    pub fn natural_form(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => sorted(other).to_string(),
        }
    }
}

// Re-inserts object members in key order so the rendering does not depend on
// whether serde_json was built with `preserve_order`.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

impl Validate for LogicalId {
    fn validate(&self) -> Result<(), ContractViolation> {
        let empty = match &self.0 {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Bool(_) | Value::Number(_) => false,
        };
        if empty {
            return Err(ContractViolation::InvalidValue {
                field: "logical_id",
                reason: "must be a non-empty JSON value",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey(Vec<u8>);

impl RowKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ContractViolation> {
        if bytes.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "row_key",
                reason: "must not be empty",
            });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn checksum_prefix(&self) -> Option<u32> {
        let prefix: [u8; CHECKSUM_PREFIX_LEN] =
            self.0.get(..CHECKSUM_PREFIX_LEN)?.try_into().ok()?;
        Some(u32::from_be_bytes(prefix))
    }

    /// Bytes after the first `prefix_len` bytes.
    pub fn logical_part(&self, prefix_len: usize) -> &[u8] {
        self.0.get(prefix_len..).unwrap_or_default()
    }

    /// Printable rendering: printable ASCII kept, every other byte as `\xNN`.
    pub fn display_escaped(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                out.push(b as char);
            } else {
                out.push_str(&format!("\\x{b:02x}"));
            }
        }
        out
    }
}
