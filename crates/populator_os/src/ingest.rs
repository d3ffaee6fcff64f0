#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use populator_contracts::config::{
    ColumnLayout, DestinationRouting, PopulatorConfig, RecordSource,
};
use populator_contracts::envelope::topic_name;
use populator_contracts::key::KeyMaterial;
use populator_contracts::row::{AddressingMode, LogicalId, RowKey};
use populator_contracts::table::{
    ColumnQualifier, StoredCell, TableName, TableSchema, TOPIC_COLUMN_FAMILY,
    TOPIC_LIST_COLUMN_FAMILY, TOPIC_LIST_COLUMN_QUALIFIER,
};
use populator_contracts::{ContractViolation, Validate};
use populator_engines::cipher::{EncryptionError, RecordEncryptor};
use populator_engines::key_provider::{key_provider_for, KeyProvider, KeyServiceError};
use populator_engines::payload::RecordGenerator;
use populator_engines::row_key::derive_row_key;
use populator_storage::{
    BatchWriter, ColumnStore, ProvisioningError, StorageError, StoreConnector, TableProvisioner,
    WriteError,
};
use tracing::{debug, error, info, warn};

use crate::completion::{remove_stale_output, CompletionError, CompletionFlag};
use crate::retry::{
    retry_with_policy, CancellationToken, Clock, RetryError, RetryPolicy, SystemClock,
};
use crate::sample_data::{load_sample_file, seal_sample_value, SampleDataError, SampleTreatment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionState {
    Disconnected,
    Connecting,
    Provisioning,
    KeyFetch,
    Generating,
    Writing,
    Done,
    Failed,
}

impl IngestionState {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestionState::Disconnected => "disconnected",
            IngestionState::Connecting => "connecting",
            IngestionState::Provisioning => "provisioning",
            IngestionState::KeyFetch => "key_fetch",
            IngestionState::Generating => "generating",
            IngestionState::Writing => "writing",
            IngestionState::Done => "done",
            IngestionState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IngestionState::Done | IngestionState::Failed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("store not reachable after {attempts} connection attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error("data key fetch failed: {0}")]
    KeyService(#[from] KeyServiceError),
    #[error("record encryption failed: {0}")]
    Encryption(#[from] EncryptionError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    SampleData(#[from] SampleDataError),
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),
    #[error("envelope serialisation failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("run cancelled while {} after {attempts} connection attempts", .phase.as_str())]
    Cancelled {
        phase: IngestionState,
        attempts: u32,
    },
}

impl IngestError {
    /// Connection attempts made, for errors raised by the connect loop.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            IngestError::Connection { attempts, .. } | IngestError::Cancelled { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct IngestionReport {
    pub final_state: IngestionState,
    pub transitions: Vec<IngestionState>,
    pub connection_attempts: u32,
    /// Logical records queued and committed; one record may carry several versions.
    pub records_written: u64,
    pub cells_written: u64,
    pub tables: Vec<TableName>,
    pub topics: Vec<String>,
    pub flushes: u64,
    pub dumped: Vec<StoredCell>,
    pub failure: Option<IngestError>,
}

impl IngestionReport {
    fn new() -> Self {
        Self {
            final_state: IngestionState::Disconnected,
            transitions: vec![IngestionState::Disconnected],
            connection_attempts: 0,
            records_written: 0,
            cells_written: 0,
            tables: Vec::new(),
            topics: Vec::new(),
            flushes: 0,
            dumped: Vec::new(),
            failure: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.final_state == IngestionState::Done
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }
}

/// One ingestion run: connect, provision, fetch a key, generate, write.
///
/// `run` consumes the driver, so a finished run can never be resumed.
pub struct IngestionDriver<C: StoreConnector> {
    config: PopulatorConfig,
    connector: C,
    key_provider: Box<dyn KeyProvider>,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    completion: Option<CompletionFlag>,
    stale_output: Option<PathBuf>,
    encryptor: RecordEncryptor,
    state: IngestionState,
    transitions: Vec<IngestionState>,
}

impl<C: StoreConnector> IngestionDriver<C> {
    pub fn new(config: PopulatorConfig, connector: C, key_provider: Box<dyn KeyProvider>) -> Self {
        Self {
            config,
            connector,
            key_provider,
            retry_policy: RetryPolicy::default(),
            clock: Arc::new(SystemClock::new()),
            cancel: CancellationToken::new(),
            completion: None,
            stale_output: None,
            encryptor: RecordEncryptor::new(),
            state: IngestionState::Disconnected,
            transitions: vec![IngestionState::Disconnected],
        }
    }

    /// Picks the key provider the configuration names.
    pub fn from_config(config: PopulatorConfig, connector: C) -> Result<Self, IngestError> {
        config.validate()?;
        let key_provider = key_provider_for(&config.key_source)?;
        Ok(Self::new(config, connector, key_provider))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_completion_flag(mut self, flag: Option<CompletionFlag>) -> Self {
        self.completion = flag;
        self
    }

    /// Output file to delete before connecting, if an earlier run left one.
    pub fn with_stale_output_file(mut self, path: Option<PathBuf>) -> Self {
        self.stale_output = path;
        self
    }

    pub fn state(&self) -> IngestionState {
        self.state
    }

    pub fn run(mut self) -> IngestionReport {
        let mut report = IngestionReport::new();
        match self.execute(&mut report) {
            Ok(()) => {
                self.transition(IngestionState::Done);
                info!(
                    records = report.records_written,
                    cells = report.cells_written,
                    tables = report.tables.len(),
                    attempts = report.connection_attempts,
                    "ingestion finished"
                );
            }
            Err(err) => {
                error!(
                    state = self.state.as_str(),
                    attempts = report.connection_attempts,
                    error = %err,
                    "ingestion failed"
                );
                self.transition(IngestionState::Failed);
                report.failure = Some(err);
            }
        }
        report.final_state = self.state;
        report.transitions = self.transitions;
        report
    }

    fn transition(&mut self, next: IngestionState) {
        if self.state.is_terminal() {
            return;
        }
        info!(from = self.state.as_str(), to = next.as_str(), "ingestion state change");
        self.state = next;
        self.transitions.push(next);
    }

    fn check_cancelled(&self, attempts: u32) -> Result<(), IngestError> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled {
                phase: self.state,
                attempts,
            });
        }
        Ok(())
    }

    fn execute(&mut self, report: &mut IngestionReport) -> Result<(), IngestError> {
        self.config.validate()?;
        self.retry_policy.validate()?;
        if let Some(flag) = &self.completion {
            flag.clear()?;
        }
        if let Some(path) = &self.stale_output {
            remove_stale_output(path)?;
        }

        self.transition(IngestionState::Connecting);
        let store = self.connect(report)?;

        self.transition(IngestionState::Provisioning);
        let mut sink = RoutedWriters::new(&self.config);
        sink.provision_fixed_targets(&store)?;

        self.transition(IngestionState::KeyFetch);
        self.check_cancelled(report.connection_attempts)?;
        info!(provider = %self.key_provider.describe(), "fetching data key");
        let key = self.key_provider.fetch()?;

        self.transition(IngestionState::Generating);
        match self.config.record_source.clone() {
            RecordSource::Synthetic { count } => {
                self.generate_synthetic(count, &key, &store, &mut sink, report)?
            }
            RecordSource::SampleFile(path) => {
                self.replay_sample_file(&path, &key, &store, &mut sink, report)?
            }
        }

        self.transition(IngestionState::Writing);
        sink.finish(&store, report)?;
        if self.config.dump_table_contents {
            report.dumped = dump_tables(&store, &report.tables);
        }
        if let Some(flag) = &self.completion {
            flag.mark()?;
        }
        Ok(())
    }

    fn connect(&mut self, report: &mut IngestionReport) -> Result<C::Store, IngestError> {
        let endpoint = self.connector.endpoint();
        info!(
            endpoint = %endpoint,
            max_attempts = self.retry_policy.max_attempts,
            "connecting to store"
        );
        let connector = &mut self.connector;
        let outcome = retry_with_policy(
            &self.retry_policy,
            Arc::clone(&self.clock),
            &self.cancel,
            StorageError::is_transient,
            |attempt| {
                debug!(attempt, "opening store connection");
                connector.connect()
            },
        );
        match outcome {
            Ok((store, attempts)) => {
                report.connection_attempts = attempts;
                info!(endpoint = %endpoint, attempts, "connected to store");
                Ok(store)
            }
            Err(err) => {
                report.connection_attempts = err.attempts();
                Err(match err {
                    RetryError::Cancelled { attempts } => IngestError::Cancelled {
                        phase: IngestionState::Connecting,
                        attempts,
                    },
                    RetryError::Exhausted { attempts, last }
                    | RetryError::Permanent {
                        attempts,
                        error: last,
                    } => IngestError::Connection {
                        attempts,
                        source: last,
                    },
                    RetryError::DeadlineExceeded {
                        attempts,
                        elapsed,
                        last,
                    } => {
                        warn!(
                            elapsed_ms = elapsed.as_millis() as u64,
                            "connect deadline reached"
                        );
                        IngestError::Connection {
                            attempts,
                            source: last,
                        }
                    }
                })
            }
        }
    }

    fn generate_synthetic<S: ColumnStore>(
        &self,
        count: u64,
        key: &KeyMaterial,
        store: &S,
        sink: &mut RoutedWriters,
        report: &IngestionReport,
    ) -> Result<(), IngestError> {
        let generator = RecordGenerator::new(
            self.config.source_db.as_str(),
            self.config.source_collection.as_str(),
        );
        let versions = u64::from(self.config.versions_per_record);
        info!(
            count,
            versions,
            addressing = self.config.addressing_mode.as_str(),
            "generating synthetic records"
        );
        for index in 0..count {
            self.check_cancelled(report.connection_attempts)?;
            let record = generator.generate(index)?;
            let row_key = derive_row_key(&record.logical_id, self.config.addressing_mode)?;
            let plaintext = record.payload.to_string();
            for version in 0..versions {
                // Fresh IV per version: every cell is its own CTR message.
                let sealed = self
                    .encryptor
                    .encrypt(key.plaintext_key(), plaintext.as_bytes())?;
                let mut envelope = record.envelope.clone();
                envelope.seal(
                    sealed.initialisation_vector,
                    sealed.ciphertext,
                    key.wrapped_key(),
                    key.key_encryption_key_id(),
                );
                envelope.validate()?;
                let timestamp = match self.config.pinned_timestamp {
                    Some(base) if versions > 1 => Some(base.checked_add(version).ok_or(
                        ContractViolation::InvalidValue {
                            field: "populator_config.pinned_timestamp",
                            reason: "version timestamp overflows",
                        },
                    )?),
                    _ => None,
                };
                sink.queue(
                    store,
                    &envelope.message.db,
                    &envelope.message.collection,
                    row_key.clone(),
                    envelope.to_json_bytes()?,
                    timestamp,
                )?;
            }
            sink.records += 1;
            debug!(
                record_id = %record.logical_id.natural_form(),
                row_key = %row_key.display_escaped(),
                "record queued"
            );
        }
        Ok(())
    }

    fn replay_sample_file<S: ColumnStore>(
        &self,
        path: &Path,
        key: &KeyMaterial,
        store: &S,
        sink: &mut RoutedWriters,
        report: &IngestionReport,
    ) -> Result<(), IngestError> {
        let records = load_sample_file(path)?;
        info!(path = %path.display(), records = records.len(), "replaying sample data");
        for record in records {
            self.check_cancelled(report.connection_attempts)?;
            let mut value = record.value.clone();
            let treatment = seal_sample_value(&mut value, key, &self.encryptor)?;
            if treatment == SampleTreatment::Corrupt {
                warn!(record_id = %record.id, "writing deliberately corrupt record");
            }
            let (db, collection) = record.source().unwrap_or_else(|| {
                (
                    self.config.source_db.clone(),
                    self.config.source_collection.clone(),
                )
            });
            let logical_id = LogicalId::natural(&record.id)?;
            let row_key = derive_row_key(&logical_id, AddressingMode::Identity)?;
            sink.queue(
                store,
                &db,
                &collection,
                row_key,
                value.to_string().into_bytes(),
                Some(record.timestamp),
            )?;
            sink.records += 1;
            debug!(
                record_id = %record.id,
                timestamp = record.timestamp,
                treatment = ?treatment,
                "sample record queued"
            );
        }
        Ok(())
    }
}

/// Batch writers keyed by destination table, plus the topics seen so far.
struct RoutedWriters {
    routing: DestinationRouting,
    layout: ColumnLayout,
    version_retention: u32,
    pinned_timestamp: Option<u64>,
    auto_flush_threshold: Option<usize>,
    skip_table_creation: bool,
    topic_list_table: Option<TableName>,
    provisioner: TableProvisioner,
    writers: BTreeMap<TableName, BatchWriter>,
    topics: BTreeSet<String>,
    records: u64,
}

impl RoutedWriters {
    fn new(config: &PopulatorConfig) -> Self {
        Self {
            routing: config.destination_routing.clone(),
            layout: config.column_layout.clone(),
            version_retention: config.version_retention,
            pinned_timestamp: config.pinned_timestamp,
            auto_flush_threshold: config.auto_flush_threshold,
            skip_table_creation: config.skip_table_creation,
            topic_list_table: config.topic_list_table.clone(),
            provisioner: TableProvisioner::new(),
            writers: BTreeMap::new(),
            topics: BTreeSet::new(),
            records: 0,
        }
    }

    fn ensure<S: ColumnStore>(
        &mut self,
        store: &S,
        table: &TableName,
        family: &str,
    ) -> Result<(), IngestError> {
        if self.skip_table_creation {
            self.provisioner.assume_present(table.clone());
            return Ok(());
        }
        let schema = TableSchema::v1(table.clone(), family, self.version_retention)?;
        self.provisioner.ensure_table(store, &schema)?;
        Ok(())
    }

    fn provision_fixed_targets<S: ColumnStore>(&mut self, store: &S) -> Result<(), IngestError> {
        if let DestinationRouting::Static(table) = self.routing.clone() {
            let family = self.layout.family().to_string();
            self.ensure(store, &table, &family)?;
        }
        if let Some(table) = self.topic_list_table.clone() {
            self.ensure(store, &table, TOPIC_LIST_COLUMN_FAMILY)?;
        }
        Ok(())
    }

    fn queue<S: ColumnStore>(
        &mut self,
        store: &S,
        db: &str,
        collection: &str,
        row_key: RowKey,
        value: Vec<u8>,
        timestamp: Option<u64>,
    ) -> Result<(), IngestError> {
        let topic = topic_name(db, collection);
        let table = match &self.routing {
            DestinationRouting::Static(table) => table.clone(),
            DestinationRouting::ByTopic => TableName::for_collection(db, collection)?,
        };
        let column = match &self.layout {
            ColumnLayout::Fixed(column) => column.clone(),
            ColumnLayout::Topic => ColumnQualifier::new(TOPIC_COLUMN_FAMILY, &topic)?,
        };
        if !self.provisioner.is_ensured(&table) {
            let family = self.layout.family().to_string();
            self.ensure(store, &table, &family)?;
        }
        let pinned = self.pinned_timestamp;
        let auto_flush = self.auto_flush_threshold;
        let writer = self.writers.entry(table.clone()).or_insert_with(|| {
            BatchWriter::new(table)
                .with_pinned_timestamp(pinned)
                .with_auto_flush(auto_flush)
        });
        writer.put(store, row_key, column, value, timestamp)?;
        self.topics.insert(topic);
        Ok(())
    }

    /// Commits every open batch, then records topics when a topic list table is configured.
    fn finish<S: ColumnStore>(
        &mut self,
        store: &S,
        report: &mut IngestionReport,
    ) -> Result<(), IngestError> {
        for writer in self.writers.values_mut() {
            writer.commit(store)?;
            report.cells_written += writer.committed();
            report.flushes += writer.flushes();
            report.tables.push(writer.table().clone());
        }
        if let Some(table) = self.topic_list_table.clone() {
            let column =
                ColumnQualifier::new(TOPIC_LIST_COLUMN_FAMILY, TOPIC_LIST_COLUMN_QUALIFIER)?;
            let mut writer = BatchWriter::new(table.clone());
            for topic in &self.topics {
                let row_key = RowKey::from_bytes(topic.as_bytes().to_vec())?;
                writer.put(store, row_key, column.clone(), topic.as_bytes().to_vec(), None)?;
            }
            writer.commit(store)?;
            report.flushes += writer.flushes();
            report.tables.push(table);
            info!(topics = self.topics.len(), "topic list recorded");
        }
        report.records_written = self.records;
        report.topics = self.topics.iter().cloned().collect();
        Ok(())
    }
}

/// Debug scan of written tables. A failed scan is logged and skipped.
fn dump_tables<S: ColumnStore>(store: &S, tables: &[TableName]) -> Vec<StoredCell> {
    let mut cells = Vec::new();
    for table in tables {
        match store.scan(table) {
            Ok(mut scanned) => {
                info!(table = %table, cells = scanned.len(), "table dumped");
                cells.append(&mut scanned);
            }
            Err(err) => warn!(table = %table, error = %err, "table dump failed"),
        }
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use populator_contracts::config::KeySource;
    use populator_engines::key_provider::FixedKeyProvider;
    use populator_storage::{MemoryConnector, MemoryStore};

    use crate::retry::ManualClock;

    fn config(count: u64) -> PopulatorConfig {
        let mut config = PopulatorConfig::ucdata_v1().unwrap();
        config.record_source = RecordSource::Synthetic { count };
        config
    }

    #[test]
    fn at_ingest_01_happy_path_walks_every_state() {
        let store = MemoryStore::new_in_memory();
        let report = IngestionDriver::new(
            config(2),
            MemoryConnector::new(store.clone()),
            Box::new(FixedKeyProvider),
        )
        .with_clock(ManualClock::new())
        .run();
        assert_eq!(
            report.transitions,
            vec![
                IngestionState::Disconnected,
                IngestionState::Connecting,
                IngestionState::Provisioning,
                IngestionState::KeyFetch,
                IngestionState::Generating,
                IngestionState::Writing,
                IngestionState::Done,
            ]
        );
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.records_written, 2);
        assert_eq!(report.topics, vec!["db.database.collection".to_string()]);
    }

    #[test]
    fn at_ingest_02_from_config_uses_fixed_key_source() {
        let config = config(1);
        assert_eq!(config.key_source, KeySource::Fixed);
        let driver =
            IngestionDriver::from_config(config, MemoryConnector::new(MemoryStore::new_in_memory()))
                .unwrap();
        assert_eq!(driver.state(), IngestionState::Disconnected);
    }

    #[test]
    fn at_ingest_03_invalid_config_fails_before_connecting() {
        let mut config = config(1);
        config.versions_per_record = 3;
        let connector = MemoryConnector::new(MemoryStore::new_in_memory());
        let report = IngestionDriver::new(config, connector, Box::new(FixedKeyProvider)).run();
        assert_eq!(report.final_state, IngestionState::Failed);
        assert_eq!(report.connection_attempts, 0);
        assert!(matches!(report.failure, Some(IngestError::Contract(_))));
    }

    #[test]
    fn at_ingest_04_permanent_connect_error_is_not_retried() {
        struct Refusing;
        impl StoreConnector for Refusing {
            type Store = MemoryStore;
            fn endpoint(&self) -> String {
                "refusing".to_string()
            }
            fn connect(&mut self) -> Result<MemoryStore, StorageError> {
                Err(StorageError::Rejected {
                    status: 401,
                    detail: "bad credentials".to_string(),
                })
            }
        }
        let clock = ManualClock::new();
        let report = IngestionDriver::new(config(1), Refusing, Box::new(FixedKeyProvider))
            .with_clock(clock.clone())
            .run();
        assert_eq!(report.connection_attempts, 1);
        assert!(clock.sleeps().is_empty());
        assert!(matches!(
            report.failure,
            Some(IngestError::Connection { attempts: 1, .. })
        ));
    }
}
