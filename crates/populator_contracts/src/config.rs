#![forbid(unsafe_code)]

use std::path::PathBuf;

use crate::common::{validate_range, validate_token};
use crate::row::AddressingMode;
use crate::table::{
    ColumnQualifier, TableName, DEFAULT_COLUMN_FAMILY, RECORD_COLUMN_QUALIFIER,
    MAX_CELL_TIMESTAMP, TOPIC_COLUMN_FAMILY, UNBOUNDED_MAX_VERSIONS,
};
use crate::{ContractViolation, Validate};

pub const DEFAULT_DESTINATION_TABLE: &str = "ucdata";
pub const DEFAULT_VERSION_RETENTION: u32 = 10;
pub const DEFAULT_SOURCE_DB: &str = "database";
pub const DEFAULT_SOURCE_COLLECTION: &str = "collection";
pub const DEFAULT_KEY_SERVICE_TIMEOUT_MS: u64 = 10_000;
pub const MAX_RECORD_COUNT: u64 = 100_000_000;
pub const MAX_VERSIONS_PER_RECORD: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutualTls {
    pub client_cert_pem: PathBuf,
    pub client_key_pem: PathBuf,
    pub ca_bundle_pem: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyServiceEndpoint {
    pub url: String,
    pub tls: Option<MutualTls>,
    pub timeout_ms: u64,
}

impl KeyServiceEndpoint {
    pub fn plain(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tls: None,
            timeout_ms: DEFAULT_KEY_SERVICE_TIMEOUT_MS,
        }
    }
}

/// Where the data key comes from. Chosen explicitly, never inferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Service(KeyServiceEndpoint),
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationRouting {
    Static(TableName),
    /// `<db>:<collection>` per record.
    ByTopic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnLayout {
    Fixed(ColumnQualifier),
    /// Family `topic`, qualifier `db.<db>.<collection>`.
    Topic,
}

impl ColumnLayout {
    pub fn family(&self) -> &str {
        match self {
            ColumnLayout::Fixed(column) => column.family(),
            ColumnLayout::Topic => TOPIC_COLUMN_FAMILY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSource {
    Synthetic { count: u64 },
    SampleFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopulatorConfig {
    pub addressing_mode: AddressingMode,
    pub key_source: KeySource,
    pub destination_routing: DestinationRouting,
    pub column_layout: ColumnLayout,
    pub version_retention: u32,
    pub record_source: RecordSource,
    pub source_db: String,
    pub source_collection: String,
    pub versions_per_record: u32,
    pub pinned_timestamp: Option<u64>,
    pub auto_flush_threshold: Option<usize>,
    pub topic_list_table: Option<TableName>,
    pub skip_table_creation: bool,
    pub dump_table_contents: bool,
}

impl PopulatorConfig {
    /// Ten checksum-keyed synthetic records into `ucdata`, `cf:record`, fixed key.
    pub fn ucdata_v1() -> Result<Self, ContractViolation> {
        let config = Self {
            addressing_mode: AddressingMode::Checksum,
            key_source: KeySource::Fixed,
            destination_routing: DestinationRouting::Static(TableName::new(
                DEFAULT_DESTINATION_TABLE,
            )?),
            column_layout: ColumnLayout::Fixed(ColumnQualifier::new(
                DEFAULT_COLUMN_FAMILY,
                RECORD_COLUMN_QUALIFIER,
            )?),
            version_retention: DEFAULT_VERSION_RETENTION,
            record_source: RecordSource::Synthetic { count: 10 },
            source_db: DEFAULT_SOURCE_DB.to_string(),
            source_collection: DEFAULT_SOURCE_COLLECTION.to_string(),
            versions_per_record: 1,
            pinned_timestamp: None,
            auto_flush_threshold: None,
            topic_list_table: None,
            skip_table_creation: false,
            dump_table_contents: false,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Validate for PopulatorConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_range(
            "populator_config.version_retention",
            u64::from(self.version_retention),
            1,
            u64::from(UNBOUNDED_MAX_VERSIONS),
        )?;
        validate_range(
            "populator_config.versions_per_record",
            u64::from(self.versions_per_record),
            1,
            u64::from(MAX_VERSIONS_PER_RECORD),
        )?;
        if self.versions_per_record > 1 && self.pinned_timestamp.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "populator_config.pinned_timestamp",
                reason: "must be set when versions_per_record > 1",
            });
        }
        if let Some(base) = self.pinned_timestamp {
            let last = base.checked_add(u64::from(self.versions_per_record) - 1);
            if !matches!(last, Some(ts) if ts <= MAX_CELL_TIMESTAMP) {
                return Err(ContractViolation::InvalidValue {
                    field: "populator_config.pinned_timestamp",
                    reason: "last version timestamp must fit a signed 64-bit cell timestamp",
                });
            }
        }
        if self.auto_flush_threshold == Some(0) {
            return Err(ContractViolation::InvalidValue {
                field: "populator_config.auto_flush_threshold",
                reason: "must be > 0 when set",
            });
        }
        validate_token("populator_config.source_db", &self.source_db, 128)?;
        validate_token(
            "populator_config.source_collection",
            &self.source_collection,
            128,
        )?;
        match &self.record_source {
            RecordSource::Synthetic { count } => {
                validate_range("populator_config.record_count", *count, 0, MAX_RECORD_COUNT)?
            }
            RecordSource::SampleFile(path) => {
                if path.as_os_str().is_empty() {
                    return Err(ContractViolation::InvalidValue {
                        field: "populator_config.record_source",
                        reason: "sample file path must not be empty",
                    });
                }
            }
        }
        if let KeySource::Service(endpoint) = &self.key_source {
            validate_token("populator_config.key_source.url", &endpoint.url, 2048)?;
            if !endpoint.url.starts_with("http://") && !endpoint.url.starts_with("https://") {
                return Err(ContractViolation::InvalidValue {
                    field: "populator_config.key_source.url",
                    reason: "must be an http(s) url",
                });
            }
            if endpoint.tls.is_some() && !endpoint.url.starts_with("https://") {
                return Err(ContractViolation::InvalidValue {
                    field: "populator_config.key_source.tls",
                    reason: "mutual tls requires an https url",
                });
            }
            if endpoint.timeout_ms == 0 {
                return Err(ContractViolation::InvalidValue {
                    field: "populator_config.key_source.timeout_ms",
                    reason: "must be > 0",
                });
            }
        }
        if let (DestinationRouting::Static(table), Some(topics)) =
            (&self.destination_routing, &self.topic_list_table)
        {
            if table == topics {
                return Err(ContractViolation::InvalidValue {
                    field: "populator_config.topic_list_table",
                    reason: "must differ from the destination table",
                });
            }
        }
        Ok(())
    }
}
