#![forbid(unsafe_code)]

use std::fs;
use std::time::Duration;

use populator_contracts::config::{
    ColumnLayout, DestinationRouting, PopulatorConfig, RecordSource,
};
use populator_contracts::envelope::{EnvelopeRecord, SENTINEL_INITIALISATION_VECTOR};
use populator_contracts::key::KeyMaterial;
use populator_contracts::row::{AddressingMode, LogicalId, RowKey};
use populator_contracts::table::{ColumnQualifier, TableName, TableSchema};
use populator_engines::cipher::RecordEncryptor;
use populator_engines::key_provider::{FixedKeyProvider, KeyProvider, KeyServiceError};
use populator_os::completion::{CompletionFlag, CompletionFlagKind};
use populator_os::retry::CancellationToken;
use populator_os::{IngestError, IngestionDriver, IngestionState, ManualClock, RetryPolicy};
use populator_storage::{ColumnStore, MemoryConnector, MemoryStore};

fn synthetic(count: u64) -> PopulatorConfig {
    let mut config = PopulatorConfig::ucdata_v1().unwrap();
    config.record_source = RecordSource::Synthetic { count };
    config
}

fn ucdata() -> TableName {
    TableName::new("ucdata").unwrap()
}

fn record_column() -> ColumnQualifier {
    ColumnQualifier::new("cf", "record").unwrap()
}

fn fixed_key() -> KeyMaterial {
    FixedKeyProvider.fetch().unwrap()
}

struct UnavailableKeys;

impl KeyProvider for UnavailableKeys {
    fn fetch(&self) -> Result<KeyMaterial, KeyServiceError> {
        Err(KeyServiceError::Status {
            status: 503,
            correlation_id: "test".to_string(),
        })
    }

    fn describe(&self) -> String {
        "unavailable".to_string()
    }
}

#[test]
fn at_ingest_db_01_checksum_rows_carry_crc_of_canonical_id() {
    let store = MemoryStore::new_in_memory();
    let report = IngestionDriver::new(
        synthetic(3),
        MemoryConnector::new(store.clone()),
        Box::new(FixedKeyProvider),
    )
    .with_clock(ManualClock::new())
    .run();
    assert_eq!(report.final_state, IngestionState::Done);
    assert_eq!(report.records_written, 3);

    let cells = store.scan(&ucdata()).unwrap();
    assert_eq!(cells.len(), 3);
    for index in 0..3u64 {
        let canonical = LogicalId::record_index(index).canonical_json();
        let mut expected = crc32fast::hash(canonical.as_bytes()).to_be_bytes().to_vec();
        expected.extend_from_slice(canonical.as_bytes());
        let row_key = RowKey::from_bytes(expected).unwrap();
        assert_eq!(store.cell_versions(&ucdata(), &row_key, &record_column()).len(), 1);
    }
}

#[test]
fn at_ingest_db_02_five_refusals_then_connect() {
    let store = MemoryStore::new_in_memory();
    let clock = ManualClock::new();
    let report = IngestionDriver::new(
        synthetic(1),
        MemoryConnector::failing_first(store.clone(), 5),
        Box::new(FixedKeyProvider),
    )
    .with_retry_policy(RetryPolicy::fixed(100, Duration::from_secs(3)))
    .with_clock(clock.clone())
    .run();
    assert_eq!(report.final_state, IngestionState::Done);
    assert_eq!(report.connection_attempts, 6);
    assert_eq!(clock.total_slept(), Duration::from_secs(15));
    assert_eq!(store.row_count(&ucdata()), 1);
}

#[test]
fn at_ingest_db_03_exhausted_retries_fail_with_exit_one() {
    let store = MemoryStore::new_in_memory();
    let clock = ManualClock::new();
    let report = IngestionDriver::new(
        synthetic(1),
        MemoryConnector::failing_first(store.clone(), u32::MAX),
        Box::new(FixedKeyProvider),
    )
    .with_retry_policy(RetryPolicy::fixed(4, Duration::from_secs(3)))
    .with_clock(clock.clone())
    .run();
    assert_eq!(report.final_state, IngestionState::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.connection_attempts, 4);
    assert_eq!(clock.sleeps().len(), 3);
    assert_eq!(
        report.transitions.last().copied(),
        Some(IngestionState::Failed)
    );
    assert!(store.list_tables().unwrap().is_empty());
}

#[test]
fn at_ingest_db_04_corrupt_sample_gets_sentinel_iv() {
    let dir = tempfile::tempdir().unwrap();
    let sample = dir.path().join("sample.json");
    fs::write(
        &sample,
        r#"[
          {"id": "good", "cf:data": {"timestamp": 1000, "value": {"message": {"dbObject": "", "encryption": {}}}}},
          {"id": "bad", "cf:data": {"timestamp": 1001, "value": {"message": {"dbObject": "CORRUPT", "encryption": {}}}}}
        ]"#,
    )
    .unwrap();
    let mut config = PopulatorConfig::ucdata_v1().unwrap();
    config.record_source = RecordSource::SampleFile(sample);
    config.column_layout = ColumnLayout::Fixed(ColumnQualifier::new("cf", "data").unwrap());
    let store = MemoryStore::new_in_memory();
    let report = IngestionDriver::new(
        config,
        MemoryConnector::new(store.clone()),
        Box::new(FixedKeyProvider),
    )
    .run();
    assert_eq!(report.final_state, IngestionState::Done);

    let data = ColumnQualifier::new("cf", "data").unwrap();
    let bad_key = RowKey::from_bytes(b"bad".to_vec()).unwrap();
    let bad = store.cell_versions(&ucdata(), &bad_key, &data);
    assert_eq!(bad.len(), 1);
    assert_eq!(bad[0].0, 1001);
    let bad_value: serde_json::Value = serde_json::from_slice(&bad[0].1).unwrap();
    assert_eq!(
        bad_value["message"]["encryption"]["initialisationVector"],
        SENTINEL_INITIALISATION_VECTOR
    );
    assert_eq!(bad_value["message"]["dbObject"], "CORRUPT");

    let good_key = RowKey::from_bytes(b"good".to_vec()).unwrap();
    let good = store.cell_versions(&ucdata(), &good_key, &data);
    let good_value: serde_json::Value = serde_json::from_slice(&good[0].1).unwrap();
    let iv = good_value["message"]["encryption"]["initialisationVector"]
        .as_str()
        .unwrap();
    assert_ne!(iv, SENTINEL_INITIALISATION_VECTOR);
    assert!(!good_value["message"]["dbObject"].as_str().unwrap().is_empty());
}

#[test]
fn at_ingest_db_05_rerun_leaves_schema_unchanged() {
    let store = MemoryStore::new_in_memory();
    for _ in 0..2 {
        let report = IngestionDriver::new(
            synthetic(2),
            MemoryConnector::new(store.clone()),
            Box::new(FixedKeyProvider),
        )
        .run();
        assert_eq!(report.final_state, IngestionState::Done);
    }
    assert_eq!(
        store.table_schema(&ucdata()),
        Some(TableSchema::v1(ucdata(), "cf", 10).unwrap())
    );
    assert_eq!(store.create_calls(), 1);
    // Checksum keys are deterministic, so the rerun updates the same rows.
    assert_eq!(store.row_count(&ucdata()), 2);
}

#[test]
fn at_ingest_db_06_versions_decrypt_back_to_payload() {
    let mut config = synthetic(2);
    config.versions_per_record = 3;
    config.pinned_timestamp = Some(1_000);
    config.addressing_mode = AddressingMode::Identity;
    let store = MemoryStore::new_in_memory();
    let report = IngestionDriver::new(
        config,
        MemoryConnector::new(store.clone()),
        Box::new(FixedKeyProvider),
    )
    .run();
    assert_eq!(report.final_state, IngestionState::Done);
    assert_eq!(report.cells_written, 6);

    let key = fixed_key();
    let encryptor = RecordEncryptor::new();
    let row_key = RowKey::from_bytes(br#"{"record_id":"00001"}"#.to_vec()).unwrap();
    let versions = store.cell_versions(&ucdata(), &row_key, &record_column());
    assert_eq!(
        versions.iter().map(|(ts, _)| *ts).collect::<Vec<_>>(),
        vec![1_002, 1_001, 1_000]
    );
    let mut ivs = Vec::new();
    for (_, raw) in versions {
        let envelope: EnvelopeRecord = serde_json::from_slice(&raw).unwrap();
        let encryption = &envelope.message.encryption;
        assert_eq!(encryption.encrypted_encryption_key, key.wrapped_key());
        let plain = encryptor
            .decrypt(
                key.plaintext_key(),
                &encryption.initialisation_vector,
                &envelope.message.db_object,
            )
            .unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&plain).unwrap();
        assert_eq!(payload["_id"]["record_id"], "00001");
        ivs.push(encryption.initialisation_vector.clone());
    }
    ivs.sort();
    ivs.dedup();
    assert_eq!(ivs.len(), 3);
}

#[test]
fn at_ingest_db_07_topic_routing_fans_out_and_lists_topics() {
    let dir = tempfile::tempdir().unwrap();
    let sample = dir.path().join("topics.json");
    fs::write(
        &sample,
        r#"[
          {"kafka_message_id": "1", "kafka_message_timestamp": "10", "db": "core", "collection": "addresses", "value": {"dbObject": "x", "encryption": {}}},
          {"kafka_message_id": "2", "kafka_message_timestamp": "11", "db": "core", "collection": "contracts", "value": {"dbObject": "y", "encryption": {}}},
          {"kafka_message_id": "3", "kafka_message_timestamp": "12", "db": "core", "collection": "addresses", "value": {"dbObject": "z", "encryption": {}}}
        ]"#,
    )
    .unwrap();
    let mut config = PopulatorConfig::ucdata_v1().unwrap();
    config.record_source = RecordSource::SampleFile(sample);
    config.destination_routing = DestinationRouting::ByTopic;
    config.column_layout = ColumnLayout::Topic;
    config.topic_list_table = Some(TableName::new("topics").unwrap());
    let store = MemoryStore::new_in_memory();
    let report = IngestionDriver::new(
        config,
        MemoryConnector::new(store.clone()),
        Box::new(FixedKeyProvider),
    )
    .run();
    assert_eq!(report.final_state, IngestionState::Done);
    assert_eq!(
        report.topics,
        vec!["db.core.addresses".to_string(), "db.core.contracts".to_string()]
    );

    let addresses = TableName::for_collection("core", "addresses").unwrap();
    assert_eq!(store.row_count(&addresses), 2);
    assert_eq!(store.table_schema(&addresses).unwrap().family, "topic");
    let topic_rows = store.scan(&TableName::new("topics").unwrap()).unwrap();
    assert_eq!(topic_rows.len(), 2);
    assert!(topic_rows.iter().all(|c| c.column.to_string() == "c:msg"));
}

#[test]
fn at_ingest_db_08_key_service_failure_is_fatal_and_writes_nothing() {
    let store = MemoryStore::new_in_memory();
    let report = IngestionDriver::new(
        synthetic(3),
        MemoryConnector::new(store.clone()),
        Box::new(UnavailableKeys),
    )
    .run();
    assert_eq!(report.final_state, IngestionState::Failed);
    assert!(matches!(report.failure, Some(IngestError::KeyService(_))));
    assert!(!report.transitions.contains(&IngestionState::Generating));
    assert_eq!(store.row_count(&ucdata()), 0);
}

#[test]
fn at_ingest_db_09_cancellation_stops_before_connecting() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = IngestionDriver::new(
        synthetic(1),
        MemoryConnector::new(MemoryStore::new_in_memory()),
        Box::new(FixedKeyProvider),
    )
    .with_cancellation(cancel)
    .run();
    assert_eq!(report.final_state, IngestionState::Failed);
    assert!(matches!(
        report.failure,
        Some(IngestError::Cancelled {
            phase: IngestionState::Connecting,
            attempts: 0
        })
    ));
}

#[test]
fn at_ingest_db_10_completion_flag_cleared_then_marked() {
    let dir = tempfile::tempdir().unwrap();
    let flag_path = dir.path().join("populated");
    fs::write(&flag_path, b"stale").unwrap();
    let flag = CompletionFlag::new(&flag_path, CompletionFlagKind::Directory);

    let failed = IngestionDriver::new(
        synthetic(1),
        MemoryConnector::new(MemoryStore::new_in_memory()),
        Box::new(UnavailableKeys),
    )
    .with_completion_flag(Some(flag.clone()))
    .run();
    assert_eq!(failed.final_state, IngestionState::Failed);
    assert!(!flag_path.exists());

    let done = IngestionDriver::new(
        synthetic(1),
        MemoryConnector::new(MemoryStore::new_in_memory()),
        Box::new(FixedKeyProvider),
    )
    .with_completion_flag(Some(flag))
    .run();
    assert_eq!(done.final_state, IngestionState::Done);
    assert!(flag_path.is_dir());
}

#[test]
fn at_ingest_db_11_dump_returns_written_cells() {
    let mut config = synthetic(4);
    config.dump_table_contents = true;
    config.auto_flush_threshold = Some(3);
    let report = IngestionDriver::new(
        config,
        MemoryConnector::new(MemoryStore::new_in_memory()),
        Box::new(FixedKeyProvider),
    )
    .run();
    assert_eq!(report.final_state, IngestionState::Done);
    assert_eq!(report.flushes, 2);
    assert_eq!(report.dumped.len(), 4);
    assert!(report.dumped.iter().all(|cell| cell.table == ucdata()));
}

#[test]
fn at_ingest_db_12_pinned_timestamp_without_headroom_fails_before_connecting() {
    let mut config = synthetic(1);
    config.versions_per_record = 2;
    config.pinned_timestamp = Some(u64::MAX);
    let store = MemoryStore::new_in_memory();
    let report = IngestionDriver::new(
        config,
        MemoryConnector::new(store.clone()),
        Box::new(FixedKeyProvider),
    )
    .run();
    assert_eq!(report.final_state, IngestionState::Failed);
    assert!(matches!(report.failure, Some(IngestError::Contract(_))));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.connection_attempts, 0);
    assert_eq!(store.row_count(&ucdata()), 0);
}

#[test]
fn at_ingest_db_13_stale_output_file_is_removed_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("populate.out");
    fs::write(&output, b"previous run").unwrap();

    let report = IngestionDriver::new(
        synthetic(1),
        MemoryConnector::failing_first(MemoryStore::new_in_memory(), u32::MAX),
        Box::new(FixedKeyProvider),
    )
    .with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(1)))
    .with_clock(ManualClock::new())
    .with_stale_output_file(Some(output.clone()))
    .run();
    assert_eq!(report.final_state, IngestionState::Failed);
    assert!(!output.exists());
}
