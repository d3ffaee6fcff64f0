#![forbid(unsafe_code)]

use populator_contracts::table::{BatchEntry, StoredCell, TableName, TableSchema};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("store unreachable at {endpoint}: {detail}")]
    Unreachable { endpoint: String, detail: String },
    #[error("table {0} already exists")]
    TableExists(TableName),
    #[error("table {0} not found")]
    TableNotFound(TableName),
    #[error("column family {family} is not defined on table {table}")]
    UnknownFamily { table: TableName, family: String },
    #[error("store rejected request with status {status}: {detail}")]
    Rejected { status: u16, detail: String },
    #[error("store payload could not be decoded: {0}")]
    Codec(String),
}

impl StorageError {
    /// Transport-level failures; the only kind worth reconnecting for.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unreachable { .. })
    }
}

/// Operations the pipeline needs from a wide-column store.
pub trait ColumnStore {
    fn list_tables(&self) -> Result<Vec<TableName>, StorageError>;

    fn create_table(&self, schema: &TableSchema) -> Result<(), StorageError>;

    /// Applies every entry or none of them, as far as the caller can observe.
    fn put_batch(&self, table: &TableName, entries: &[BatchEntry]) -> Result<(), StorageError>;

    /// Every stored cell version, ordered by row key, column, newest first.
    fn scan(&self, table: &TableName) -> Result<Vec<StoredCell>, StorageError>;
}

pub trait StoreConnector {
    type Store: ColumnStore;

    fn endpoint(&self) -> String;

    fn connect(&mut self) -> Result<Self::Store, StorageError>;
}
