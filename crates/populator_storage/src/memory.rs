#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use populator_contracts::row::RowKey;
use populator_contracts::table::{BatchEntry, ColumnQualifier, StoredCell, TableName, TableSchema};

use crate::store::{ColumnStore, StorageError, StoreConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryOp {
    List,
    Create,
    Put,
    Scan,
}

#[derive(Debug, Default)]
struct MemoryTable {
    schema: Option<TableSchema>,
    // row -> column -> timestamp -> value
    rows: BTreeMap<RowKey, BTreeMap<ColumnQualifier, BTreeMap<u64, Vec<u8>>>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<TableName, MemoryTable>,
    racing_creates: BTreeMap<TableName, TableSchema>,
    injected_failures: BTreeMap<MemoryOp, StorageError>,
    last_server_ms: u64,
    batches_committed: u64,
    create_calls: u64,
}

impl MemoryState {
    fn take_failure(&mut self, op: MemoryOp) -> Result<(), StorageError> {
        match self.injected_failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wall-clock milliseconds, forced strictly increasing.
    fn next_server_ms(&mut self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(1);
        self.last_server_ms = wall.max(self.last_server_ms + 1);
        self.last_server_ms
    }
}

/// Shared in-memory wide-column store. Clones see the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next call of `op` fails with `err`.
    pub fn inject_failure(&self, op: MemoryOp, err: StorageError) {
        self.lock().injected_failures.insert(op, err);
    }

    /// Simulates another writer creating `schema` between our list and create.
    pub fn inject_create_race(&self, schema: TableSchema) {
        self.lock()
            .racing_creates
            .insert(schema.name.clone(), schema);
    }

    pub fn table_schema(&self, table: &TableName) -> Option<TableSchema> {
        self.lock()
            .tables
            .get(table)
            .and_then(|t| t.schema.clone())
    }

    pub fn row_count(&self, table: &TableName) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Stored versions of one cell, newest first.
    pub fn cell_versions(
        &self,
        table: &TableName,
        row_key: &RowKey,
        column: &ColumnQualifier,
    ) -> Vec<(u64, Vec<u8>)> {
        let state = self.lock();
        state
            .tables
            .get(table)
            .and_then(|t| t.rows.get(row_key))
            .and_then(|columns| columns.get(column))
            .map(|versions| {
                versions
                    .iter()
                    .rev()
                    .map(|(ts, value)| (*ts, value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn batches_committed(&self) -> u64 {
        self.lock().batches_committed
    }

    pub fn create_calls(&self) -> u64 {
        self.lock().create_calls
    }
}

impl ColumnStore for MemoryStore {
    fn list_tables(&self) -> Result<Vec<TableName>, StorageError> {
        let mut state = self.lock();
        state.take_failure(MemoryOp::List)?;
        Ok(state.tables.keys().cloned().collect())
    }

    fn create_table(&self, schema: &TableSchema) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.take_failure(MemoryOp::Create)?;
        state.create_calls += 1;
        if let Some(raced) = state.racing_creates.remove(&schema.name) {
            state.tables.insert(
                raced.name.clone(),
                MemoryTable {
                    schema: Some(raced),
                    rows: BTreeMap::new(),
                },
            );
            return Err(StorageError::TableExists(schema.name.clone()));
        }
        if state.tables.contains_key(&schema.name) {
            return Err(StorageError::TableExists(schema.name.clone()));
        }
        if schema.family.is_empty() || schema.max_versions == 0 {
            return Err(StorageError::Rejected {
                status: 400,
                detail: format!("malformed schema for {}", schema.name),
            });
        }
        state.tables.insert(
            schema.name.clone(),
            MemoryTable {
                schema: Some(schema.clone()),
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn put_batch(&self, table: &TableName, entries: &[BatchEntry]) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.take_failure(MemoryOp::Put)?;
        let (family, max_versions) = match state.tables.get(table).and_then(|t| t.schema.as_ref()) {
            Some(schema) => (schema.family.clone(), schema.max_versions as usize),
            None => return Err(StorageError::TableNotFound(table.clone())),
        };
        // Validate everything before touching any row.
        if let Some(bad) = entries.iter().find(|e| e.column.family() != family) {
            return Err(StorageError::UnknownFamily {
                table: table.clone(),
                family: bad.column.family().to_string(),
            });
        }
        let stamped: Vec<(u64, &BatchEntry)> = entries
            .iter()
            .map(|e| (e.timestamp.unwrap_or_else(|| state.next_server_ms()), e))
            .collect();
        let Some(target) = state.tables.get_mut(table) else {
            return Err(StorageError::TableNotFound(table.clone()));
        };
        for (ts, entry) in stamped {
            let versions = target
                .rows
                .entry(entry.row_key.clone())
                .or_default()
                .entry(entry.column.clone())
                .or_default();
            versions.insert(ts, entry.value.clone());
            while versions.len() > max_versions {
                versions.pop_first();
            }
        }
        state.batches_committed += 1;
        Ok(())
    }

    fn scan(&self, table: &TableName) -> Result<Vec<StoredCell>, StorageError> {
        let mut state = self.lock();
        state.take_failure(MemoryOp::Scan)?;
        let Some(target) = state.tables.get(table) else {
            return Err(StorageError::TableNotFound(table.clone()));
        };
        let mut out = Vec::new();
        for (row_key, columns) in &target.rows {
            for (column, versions) in columns {
                for (ts, value) in versions.iter().rev() {
                    out.push(StoredCell {
                        table: table.clone(),
                        row_key: row_key.clone(),
                        column: column.clone(),
                        timestamp: *ts,
                        value: value.clone(),
                    });
                }
            }
        }
        Ok(out)
    }
}

/// Hands out `MemoryStore` handles; can be told to refuse the first
/// `failures_before_ready` connection attempts.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
    failures_before_ready: u32,
    attempts: u32,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            failures_before_ready: 0,
            attempts: 0,
        }
    }

    pub fn failing_first(store: MemoryStore, failures_before_ready: u32) -> Self {
        Self {
            store,
            failures_before_ready,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl StoreConnector for MemoryConnector {
    type Store = MemoryStore;

    fn endpoint(&self) -> String {
        "memory".to_string()
    }

    fn connect(&mut self) -> Result<MemoryStore, StorageError> {
        self.attempts += 1;
        if self.attempts <= self.failures_before_ready {
            return Err(StorageError::Unreachable {
                endpoint: self.endpoint(),
                detail: format!("not ready (attempt {})", self.attempts),
            });
        }
        Ok(self.store.clone())
    }
}
