#![forbid(unsafe_code)]

use std::net::TcpListener;

use mockito::{Matcher, Mock, Server, ServerGuard};
use populator_contracts::row::RowKey;
use populator_contracts::table::{ColumnQualifier, TableName, TableSchema};
use populator_storage::{
    BatchWriter, ColumnStore, ProvisionOutcome, RestConnector, StorageError, StoreConnector,
    TableProvisioner,
};
use serde_json::json;

fn cluster_version(server: &mut ServerGuard) -> Mock {
    server
        .mock("GET", "/version/cluster")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"Cluster":"2.4"}"#)
        .expect(1)
        .create()
}

#[test]
fn at_rest_db_01_provision_and_batch_put_wire_format() {
    let mut server = Server::new();
    let version = cluster_version(&mut server);
    let listing = server
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"table":[{"name":"other"}]}"#)
        .expect(1)
        .create();
    let schema_lookup = server
        .mock("GET", "/ucdata/schema")
        .with_status(404)
        .expect(1)
        .create();
    let schema_create = server
        .mock("PUT", "/ucdata/schema")
        .match_body(Matcher::PartialJson(json!({
            "name": "ucdata",
            "ColumnSchema": [{"name": "cf", "VERSIONS": "10"}]
        })))
        .with_status(201)
        .expect(1)
        .create();
    let batch_put = server
        .mock("PUT", "/ucdata/false-row-key")
        .match_body(Matcher::Json(json!({
            "Row": [{
                "key": "azE=",
                "Cell": [{"column": "Y2Y6cmVjb3Jk", "timestamp": 1_544_799_662_000u64, "$": "e30="}]
            }]
        })))
        .with_status(200)
        .expect(1)
        .create();

    let mut connector = RestConnector::with_base_url(server.url());
    let store = connector.connect().unwrap();
    let table = TableName::new("ucdata").unwrap();
    let outcome = TableProvisioner::new()
        .ensure_table(&store, &TableSchema::v1(table.clone(), "cf", 10).unwrap())
        .unwrap();
    assert_eq!(outcome, ProvisionOutcome::Created);

    let mut writer = BatchWriter::new(table).with_pinned_timestamp(Some(1_544_799_662_000));
    writer
        .put(
            &store,
            RowKey::from_bytes(b"k1".to_vec()).unwrap(),
            ColumnQualifier::new("cf", "record").unwrap(),
            b"{}".to_vec(),
            None,
        )
        .unwrap();
    assert_eq!(writer.commit(&store).unwrap(), 1);

    version.assert();
    listing.assert();
    schema_lookup.assert();
    schema_create.assert();
    batch_put.assert();
}

#[test]
fn at_rest_db_02_existing_schema_reports_table_exists() {
    let mut server = Server::new();
    let version = cluster_version(&mut server);
    let schema_lookup = server
        .mock("GET", "/ucdata/schema")
        .with_status(200)
        .with_body(r#"{"name":"ucdata"}"#)
        .expect(1)
        .create();
    let schema_create = server.mock("PUT", "/ucdata/schema").expect(0).create();

    let store = RestConnector::with_base_url(server.url()).connect().unwrap();
    let schema = TableSchema::v1(TableName::new("ucdata").unwrap(), "cf", 10).unwrap();
    assert!(matches!(
        store.create_table(&schema),
        Err(StorageError::TableExists(_))
    ));
    version.assert();
    schema_lookup.assert();
    schema_create.assert();
}

#[test]
fn at_rest_db_03_scan_decodes_versions() {
    let body = r#"{"Row":[{"key":"azE=","Cell":[{"column":"Y2Y6cmVjb3Jk","timestamp":2,"$":"Yg=="},{"column":"Y2Y6cmVjb3Jk","timestamp":1,"$":"YQ=="}]}]}"#;
    let mut server = Server::new();
    let version = cluster_version(&mut server);
    let scan = server
        .mock("GET", "/ucdata/*")
        .match_query(Matcher::UrlEncoded("v".to_string(), "10000000".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .expect(1)
        .create();

    let store = RestConnector::with_base_url(server.url()).connect().unwrap();
    let cells = store.scan(&TableName::new("ucdata").unwrap()).unwrap();
    assert_eq!(cells.len(), 2);
    assert_eq!(cells[0].timestamp, 2);
    assert_eq!(cells[1].value, b"a".to_vec());
    version.assert();
    scan.assert();
}

#[test]
fn at_rest_db_04_unreachable_gateway_is_transient() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut connector = RestConnector::new("127.0.0.1", port)
        .with_timeout(std::time::Duration::from_millis(300));
    let err = connector.connect().unwrap_err();
    assert!(err.is_transient());
}

#[test]
fn at_rest_db_05_put_to_missing_table_is_not_found() {
    let mut server = Server::new();
    let version = cluster_version(&mut server);
    let batch_put = server
        .mock("PUT", "/ghost/false-row-key")
        .with_status(404)
        .expect(1)
        .create();

    let store = RestConnector::with_base_url(server.url()).connect().unwrap();
    let mut writer = BatchWriter::new(TableName::new("ghost").unwrap());
    writer
        .put(
            &store,
            RowKey::from_bytes(b"k1".to_vec()).unwrap(),
            ColumnQualifier::new("cf", "record").unwrap(),
            b"{}".to_vec(),
            Some(1),
        )
        .unwrap();
    assert!(writer.commit(&store).is_err());
    assert_eq!(writer.pending(), 1);
    version.assert();
    batch_put.assert();
}
