#![forbid(unsafe_code)]

use populator_contracts::row::RowKey;
use populator_contracts::table::{ColumnQualifier, TableName, TableSchema, UNBOUNDED_MAX_VERSIONS};
use populator_storage::{
    BatchWriter, ColumnStore, MemoryConnector, MemoryStore, ProvisionOutcome, StoreConnector,
    TableProvisioner,
};

fn row(raw: &str) -> RowKey {
    RowKey::from_bytes(raw.as_bytes().to_vec()).unwrap()
}

#[test]
fn at_store_db_01_provision_then_write_through_connector() {
    let backing = MemoryStore::new_in_memory();
    let mut connector = MemoryConnector::failing_first(backing.clone(), 1);
    assert!(connector.connect().is_err());
    let store = connector.connect().unwrap();

    let table = TableName::for_collection("db", "coll").unwrap();
    let schema = TableSchema::v1(table.clone(), "topic", UNBOUNDED_MAX_VERSIONS).unwrap();
    let mut provisioner = TableProvisioner::new();
    assert_eq!(
        provisioner.ensure_table(&store, &schema).unwrap(),
        ProvisionOutcome::Created
    );

    let column = ColumnQualifier::new("topic", "db.db.coll").unwrap();
    let mut writer = BatchWriter::new(table.clone());
    for i in 0..4 {
        writer
            .put(&store, row(&format!("id-{i}")), column.clone(), vec![b'v'; i + 1], None)
            .unwrap();
    }
    assert_eq!(writer.commit(&store).unwrap(), 4);

    // Connector clones share state with the backing handle.
    assert_eq!(backing.row_count(&table), 4);
    let cells = backing.scan(&table).unwrap();
    assert_eq!(cells.len(), 4);
    assert!(cells.iter().all(|c| c.column == column));
}

#[test]
fn at_store_db_02_version_cap_applies_across_batches() {
    let store = MemoryStore::new_in_memory();
    let table = TableName::new("ucdata").unwrap();
    TableProvisioner::new()
        .ensure_table(&store, &TableSchema::v1(table.clone(), "cf", 3).unwrap())
        .unwrap();
    let column = ColumnQualifier::new("cf", "record").unwrap();
    let mut writer = BatchWriter::new(table.clone());
    for ts in 1..=5u64 {
        writer
            .put(&store, row("r"), column.clone(), ts.to_le_bytes().to_vec(), Some(ts))
            .unwrap();
        writer.commit(&store).unwrap();
    }
    let versions = store.cell_versions(&table, &row("r"), &column);
    assert_eq!(
        versions.iter().map(|(ts, _)| *ts).collect::<Vec<_>>(),
        vec![5, 4, 3]
    );
    assert_eq!(writer.flushes(), 5);
}

#[test]
fn at_store_db_03_put_to_missing_table_fails() {
    let store = MemoryStore::new_in_memory();
    let mut writer = BatchWriter::new(TableName::new("missing").unwrap());
    writer
        .put(
            &store,
            row("r"),
            ColumnQualifier::new("cf", "data").unwrap(),
            b"x".to_vec(),
            None,
        )
        .unwrap();
    assert!(writer.commit(&store).is_err());
    assert_eq!(writer.pending(), 1);
}
