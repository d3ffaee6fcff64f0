#![forbid(unsafe_code)]

use std::fmt;

use crate::common::{validate_range, validate_token};
use crate::row::RowKey;
use crate::{ContractViolation, Validate};

pub const DEFAULT_COLUMN_FAMILY: &str = "cf";
pub const TOPIC_COLUMN_FAMILY: &str = "topic";
pub const TOPIC_LIST_COLUMN_FAMILY: &str = "c";
pub const TOPIC_LIST_COLUMN_QUALIFIER: &str = "msg";
pub const RECORD_COLUMN_QUALIFIER: &str = "record";
pub const DATA_COLUMN_QUALIFIER: &str = "data";

/// Retention used by volume runs that want every version kept.
pub const UNBOUNDED_MAX_VERSIONS: u32 = 10_000_000;
/// Cell timestamps are signed 64-bit milliseconds on the store side.
pub const MAX_CELL_TIMESTAMP: u64 = i64::MAX as u64;

/// `database:collection` style table identifier; the namespace part is optional.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn new(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let name = Self(raw.into());
        name.validate()?;
        Ok(name)
    }

    pub fn for_collection(db: &str, collection: &str) -> Result<Self, ContractViolation> {
        Self::new(format!("{db}:{collection}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for TableName {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("table_name", &self.0, 256)?;
        if self.0.matches(':').count() > 1 || self.0.starts_with(':') || self.0.ends_with(':') {
            return Err(ContractViolation::InvalidValue {
                field: "table_name",
                reason: "must be <table> or <namespace>:<table>",
            });
        }
        if self.0.contains(['/', ' ', '*', '?']) {
            return Err(ContractViolation::InvalidValue {
                field: "table_name",
                reason: "must not contain '/', ' ', '*' or '?'",
            });
        }
        Ok(())
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `family:qualifier` column address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnQualifier {
    family: String,
    qualifier: String,
}

impl ColumnQualifier {
    pub fn new(family: &str, qualifier: &str) -> Result<Self, ContractViolation> {
        let column = Self {
            family: family.to_string(),
            qualifier: qualifier.to_string(),
        };
        column.validate()?;
        Ok(column)
    }

    /// Parses `family:qualifier`; the qualifier itself may contain ':'.
    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        let (family, qualifier) =
            raw.split_once(':')
                .ok_or(ContractViolation::InvalidValue {
                    field: "column_qualifier",
                    reason: "must be family:qualifier",
                })?;
        Self::new(family, qualifier)
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }
}

impl Validate for ColumnQualifier {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("column_qualifier.family", &self.family, 64)?;
        if self.family.contains(':') {
            return Err(ContractViolation::InvalidValue {
                field: "column_qualifier.family",
                reason: "must not contain ':'",
            });
        }
        validate_token("column_qualifier.qualifier", &self.qualifier, 512)
    }
}

impl fmt::Display for ColumnQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.qualifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: TableName,
    pub family: String,
    pub max_versions: u32,
}

impl TableSchema {
    pub fn v1(name: TableName, family: &str, max_versions: u32) -> Result<Self, ContractViolation> {
        let schema = Self {
            name,
            family: family.to_string(),
            max_versions,
        };
        schema.validate()?;
        Ok(schema)
    }
}

impl Validate for TableSchema {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.name.validate()?;
        validate_token("table_schema.family", &self.family, 64)?;
        if self.family.contains(':') {
            return Err(ContractViolation::InvalidValue {
                field: "table_schema.family",
                reason: "must not contain ':'",
            });
        }
        validate_range(
            "table_schema.max_versions",
            u64::from(self.max_versions),
            1,
            u64::from(UNBOUNDED_MAX_VERSIONS),
        )
    }
}

/// One queued cell write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub row_key: RowKey,
    pub column: ColumnQualifier,
    pub value: Vec<u8>,
    pub timestamp: Option<u64>,
}

impl BatchEntry {
    pub fn new(
        row_key: RowKey,
        column: ColumnQualifier,
        value: Vec<u8>,
        timestamp: Option<u64>,
    ) -> Self {
        Self {
            row_key,
            column,
            value,
            timestamp,
        }
    }
}

/// One cell version as read back from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCell {
    pub table: TableName,
    pub row_key: RowKey,
    pub column: ColumnQualifier,
    pub timestamp: u64,
    pub value: Vec<u8>,
}
