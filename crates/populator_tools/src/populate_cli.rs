#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use populator_contracts::config::{
    ColumnLayout, DestinationRouting, KeyServiceEndpoint, KeySource, MutualTls, PopulatorConfig,
    RecordSource, DEFAULT_DESTINATION_TABLE, DEFAULT_KEY_SERVICE_TIMEOUT_MS,
    DEFAULT_SOURCE_COLLECTION, DEFAULT_SOURCE_DB, DEFAULT_VERSION_RETENTION,
};
use populator_contracts::row::AddressingMode;
use populator_contracts::table::{
    ColumnQualifier, StoredCell, TableName, DATA_COLUMN_QUALIFIER, DEFAULT_COLUMN_FAMILY,
    RECORD_COLUMN_QUALIFIER,
};
use populator_contracts::{ContractViolation, Validate};
use populator_os::completion::{CompletionFlag, CompletionFlagKind};
use populator_os::retry::{Backoff, RetryPolicy, DEFAULT_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS};
use populator_os::IngestionReport;
use populator_storage::rest::DEFAULT_REST_PORT;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    Contract(#[from] ContractViolation),
    #[error("{0}")]
    Usage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AddressingArg {
    Checksum,
    Salt,
    Identity,
}

impl From<AddressingArg> for AddressingMode {
    fn from(arg: AddressingArg) -> Self {
        match arg {
            AddressingArg::Checksum => AddressingMode::Checksum,
            AddressingArg::Salt => AddressingMode::Salt,
            AddressingArg::Identity => AddressingMode::Identity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColumnLayoutArg {
    Fixed,
    Topic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FlagKindArg {
    Dir,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
    /// JSON when stdout is not a terminal.
    Auto,
}

/// Pre-populate an HBase table with encrypted test records.
#[derive(Debug, Parser)]
#[command(name = "hbase-populate", version, about, long_about = None)]
pub struct PopulateArgs {
    /// Store host; the REST gateway is reached at http://<host>:<rest-port>.
    #[arg(short = 'z', long, env = "POPULATOR_ZOOKEEPER_QUORUM", default_value = "hbase")]
    pub zookeeper_quorum: String,

    #[arg(long, env = "POPULATOR_REST_PORT", default_value_t = DEFAULT_REST_PORT)]
    pub rest_port: u16,

    #[arg(
        short = 't',
        long,
        env = "POPULATOR_DESTINATION_TABLE",
        default_value = DEFAULT_DESTINATION_TABLE
    )]
    pub destination_table: String,

    /// Write each record to table <db>:<collection> instead of --destination-table.
    #[arg(long)]
    pub route_by_topic: bool,

    #[arg(long, value_enum, default_value_t = ColumnLayoutArg::Fixed)]
    pub column_layout: ColumnLayoutArg,

    #[arg(long, default_value = DEFAULT_COLUMN_FAMILY)]
    pub column_family: String,

    /// Defaults to `record`, or `data` when replaying a sample file.
    #[arg(long)]
    pub column_qualifier: Option<String>,

    #[arg(long, value_enum, default_value_t = AddressingArg::Checksum)]
    pub addressing: AddressingArg,

    /// Data key service base url. Without it the fixed local key is used.
    #[arg(short = 'k', long, env = "POPULATOR_DATA_KEY_SERVICE")]
    pub data_key_service: Option<String>,

    #[arg(
        long,
        env = "POPULATOR_DKS_CLIENT_CERT",
        requires_all = ["dks_client_key", "dks_ca_bundle"]
    )]
    pub dks_client_cert: Option<PathBuf>,

    #[arg(long, env = "POPULATOR_DKS_CLIENT_KEY", requires = "dks_client_cert")]
    pub dks_client_key: Option<PathBuf>,

    #[arg(long, env = "POPULATOR_DKS_CA_BUNDLE", requires = "dks_client_cert")]
    pub dks_ca_bundle: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_KEY_SERVICE_TIMEOUT_MS)]
    pub dks_timeout_ms: u64,

    #[arg(short = 'r', long, env = "POPULATOR_RECORDS", default_value_t = 10)]
    pub records: u64,

    #[arg(long, default_value_t = 1)]
    pub versions_per_record: u32,

    #[arg(long, default_value_t = DEFAULT_VERSION_RETENTION)]
    pub max_versions: u32,

    /// Write timestamp in epoch millis; versions are written at consecutive values from here.
    #[arg(long)]
    pub pinned_timestamp: Option<u64>,

    #[arg(long)]
    pub topic_list_table: Option<String>,

    #[arg(long, default_value = DEFAULT_SOURCE_DB)]
    pub source_db: String,

    #[arg(long, default_value = DEFAULT_SOURCE_COLLECTION)]
    pub source_collection: String,

    #[arg(short = 's', long)]
    pub skip_table_creation: bool,

    #[arg(short = 'd', long)]
    pub dump_table_contents: bool,

    #[arg(short = 'c', long, env = "POPULATOR_COMPLETED_FLAG")]
    pub completed_flag: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = FlagKindArg::Dir)]
    pub completed_flag_kind: FlagKindArg,

    /// Output file removed before the run starts.
    #[arg(
        short = 'o',
        long,
        visible_alias = "prepare-output-file",
        env = "POPULATOR_REMOVE_OUTPUT_FILE"
    )]
    pub remove_output_file: Option<PathBuf>,

    #[arg(long, env = "POPULATOR_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    #[arg(long, env = "POPULATOR_BACKOFF_MS", default_value_t = DEFAULT_BACKOFF_MS)]
    pub backoff_ms: u64,

    /// Switches to exponential backoff with this growth factor.
    #[arg(long)]
    pub backoff_multiplier: Option<u32>,

    #[arg(long, default_value_t = 60_000)]
    pub backoff_max_ms: u64,

    #[arg(long)]
    pub deadline_secs: Option<u64>,

    #[arg(long)]
    pub auto_flush: Option<usize>,

    #[arg(long, env = "POPULATOR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Auto)]
    pub log_format: LogFormat,

    /// JSON sample data to replay instead of generating records.
    pub sample_data_file: Option<PathBuf>,
}

pub fn populator_config(args: &PopulateArgs) -> Result<PopulatorConfig, CliError> {
    let key_source = match &args.data_key_service {
        None => KeySource::Fixed,
        Some(url) => {
            let tls = match (&args.dks_client_cert, &args.dks_client_key, &args.dks_ca_bundle) {
                (Some(cert), Some(key), Some(ca)) => Some(MutualTls {
                    client_cert_pem: cert.clone(),
                    client_key_pem: key.clone(),
                    ca_bundle_pem: ca.clone(),
                }),
                (None, None, None) => None,
                _ => {
                    return Err(CliError::Usage(
                        "--dks-client-cert, --dks-client-key and --dks-ca-bundle go together"
                            .to_string(),
                    ))
                }
            };
            KeySource::Service(KeyServiceEndpoint {
                url: url.clone(),
                tls,
                timeout_ms: args.dks_timeout_ms,
            })
        }
    };
    let record_source = match &args.sample_data_file {
        Some(path) => RecordSource::SampleFile(path.clone()),
        None => RecordSource::Synthetic {
            count: args.records,
        },
    };
    let qualifier = args.column_qualifier.clone().unwrap_or_else(|| {
        if args.sample_data_file.is_some() {
            DATA_COLUMN_QUALIFIER.to_string()
        } else {
            RECORD_COLUMN_QUALIFIER.to_string()
        }
    });
    let column_layout = match args.column_layout {
        ColumnLayoutArg::Fixed => {
            ColumnLayout::Fixed(ColumnQualifier::new(&args.column_family, &qualifier)?)
        }
        ColumnLayoutArg::Topic => ColumnLayout::Topic,
    };
    let destination_routing = if args.route_by_topic {
        DestinationRouting::ByTopic
    } else {
        DestinationRouting::Static(TableName::new(args.destination_table.as_str())?)
    };
    let config = PopulatorConfig {
        addressing_mode: args.addressing.into(),
        key_source,
        destination_routing,
        column_layout,
        version_retention: args.max_versions,
        record_source,
        source_db: args.source_db.clone(),
        source_collection: args.source_collection.clone(),
        versions_per_record: args.versions_per_record,
        pinned_timestamp: args.pinned_timestamp,
        auto_flush_threshold: args.auto_flush,
        topic_list_table: args
            .topic_list_table
            .as_deref()
            .map(TableName::new)
            .transpose()?,
        skip_table_creation: args.skip_table_creation,
        dump_table_contents: args.dump_table_contents,
    };
    config.validate()?;
    Ok(config)
}

pub fn retry_policy(args: &PopulateArgs) -> RetryPolicy {
    let initial = Duration::from_millis(args.backoff_ms);
    let backoff = match args.backoff_multiplier {
        Some(multiplier) => Backoff::Exponential {
            initial,
            multiplier,
            max: Duration::from_millis(args.backoff_max_ms).max(initial),
        },
        None => Backoff::Fixed(initial),
    };
    RetryPolicy {
        max_attempts: args.max_attempts,
        backoff,
        deadline: args.deadline_secs.map(Duration::from_secs),
    }
}

pub fn completion_flag(args: &PopulateArgs) -> Option<CompletionFlag> {
    let kind = match args.completed_flag_kind {
        FlagKindArg::Dir => CompletionFlagKind::Directory,
        FlagKindArg::File => CompletionFlagKind::File,
    };
    args.completed_flag
        .as_ref()
        .map(|path| CompletionFlag::new(path.clone(), kind))
}

/// One line per stored cell: table, escaped row key, column, timestamp, value.
pub fn render_dump(cells: &[StoredCell]) -> String {
    let mut out = String::new();
    for cell in cells {
        let _ = writeln!(
            out,
            "{} {} {} @{} {}",
            cell.table,
            cell.row_key.display_escaped(),
            cell.column,
            cell.timestamp,
            String::from_utf8_lossy(&cell.value)
        );
    }
    out
}

pub fn render_summary(report: &IngestionReport) -> String {
    let mut out = format!(
        "state={} attempts={} records={} cells={} flushes={}",
        report.final_state.as_str(),
        report.connection_attempts,
        report.records_written,
        report.cells_written,
        report.flushes
    );
    if !report.tables.is_empty() {
        let tables: Vec<&str> = report.tables.iter().map(TableName::as_str).collect();
        let _ = write!(out, " tables={}", tables.join(","));
    }
    if let Some(failure) = &report.failure {
        let _ = write!(out, " error=\"{failure}\"");
    }
    out
}
