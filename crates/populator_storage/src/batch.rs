#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use populator_contracts::row::RowKey;
use populator_contracts::table::{BatchEntry, ColumnQualifier, TableName};
use tracing::{debug, info};

use crate::store::{ColumnStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("cell {row_key}/{column}@{timestamp:?} queued twice in one batch for {table}")]
    DuplicateCell {
        table: TableName,
        row_key: String,
        column: ColumnQualifier,
        timestamp: Option<u64>,
    },
    #[error("commit of {entries} entries to {table} failed: {source}")]
    Commit {
        table: TableName,
        entries: usize,
        #[source]
        source: StorageError,
    },
}

/// Queue of mutations for one table, flushed with a single `put_batch`.
///
/// Cells are keyed by row, column and effective timestamp; two entries
/// without any timestamp on the same cell count as a duplicate since the
/// store would stamp them with the same server time.
#[derive(Debug)]
pub struct BatchWriter {
    table: TableName,
    pinned_timestamp: Option<u64>,
    auto_flush_threshold: Option<usize>,
    queue: Vec<BatchEntry>,
    queued_cells: BTreeSet<(RowKey, ColumnQualifier, Option<u64>)>,
    flushes: u64,
    committed: u64,
}

impl BatchWriter {
    pub fn new(table: TableName) -> Self {
        Self {
            table,
            pinned_timestamp: None,
            auto_flush_threshold: None,
            queue: Vec::new(),
            queued_cells: BTreeSet::new(),
            flushes: 0,
            committed: 0,
        }
    }

    pub fn with_pinned_timestamp(mut self, timestamp: Option<u64>) -> Self {
        self.pinned_timestamp = timestamp;
        self
    }

    pub fn with_auto_flush(mut self, threshold: Option<usize>) -> Self {
        self.auto_flush_threshold = threshold.filter(|t| *t > 0);
        self
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Queues one cell. Flushes when the auto-flush threshold is reached.
    pub fn put<S: ColumnStore + ?Sized>(
        &mut self,
        store: &S,
        row_key: RowKey,
        column: ColumnQualifier,
        value: Vec<u8>,
        timestamp: Option<u64>,
    ) -> Result<(), WriteError> {
        let effective = timestamp.or(self.pinned_timestamp);
        let cell = (row_key.clone(), column.clone(), effective);
        if self.queued_cells.contains(&cell) {
            return Err(WriteError::DuplicateCell {
                table: self.table.clone(),
                row_key: row_key.display_escaped(),
                column,
                timestamp: effective,
            });
        }
        self.queued_cells.insert(cell);
        self.queue
            .push(BatchEntry::new(row_key, column, value, effective));
        if let Some(threshold) = self.auto_flush_threshold {
            if self.queue.len() >= threshold {
                debug!(table = %self.table, threshold, "auto-flush threshold reached");
                self.commit(store)?;
            }
        }
        Ok(())
    }

    /// Sends every queued entry as one batch. On failure the queue is kept
    /// so the caller can inspect or re-drive it.
    pub fn commit<S: ColumnStore + ?Sized>(&mut self, store: &S) -> Result<usize, WriteError> {
        if self.queue.is_empty() {
            return Ok(0);
        }
        let entries = self.queue.len();
        store
            .put_batch(&self.table, &self.queue)
            .map_err(|source| WriteError::Commit {
                table: self.table.clone(),
                entries,
                source,
            })?;
        self.queue.clear();
        self.queued_cells.clear();
        self.flushes += 1;
        self.committed += entries as u64;
        info!(table = %self.table, entries, flush = self.flushes, "batch committed");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryOp, MemoryStore};
    use populator_contracts::table::TableSchema;

    fn setup(max_versions: u32) -> (MemoryStore, TableName) {
        let store = MemoryStore::new_in_memory();
        let table = TableName::new("ucdata").unwrap();
        store
            .create_table(&TableSchema::v1(table.clone(), "cf", max_versions).unwrap())
            .unwrap();
        (store, table)
    }

    fn row(id: &str) -> RowKey {
        RowKey::from_bytes(id.as_bytes().to_vec()).unwrap()
    }

    fn col() -> ColumnQualifier {
        ColumnQualifier::new("cf", "record").unwrap()
    }

    #[test]
    fn at_batch_01_commit_writes_every_row_once() {
        let (store, table) = setup(10);
        let mut writer = BatchWriter::new(table.clone());
        for i in 0..5 {
            writer
                .put(&store, row(&format!("r{i}")), col(), vec![i], None)
                .unwrap();
        }
        assert_eq!(store.row_count(&table), 0);
        assert_eq!(writer.commit(&store).unwrap(), 5);
        assert_eq!(store.row_count(&table), 5);
        assert_eq!(store.batches_committed(), 1);
        assert_eq!(writer.commit(&store).unwrap(), 0);
        assert_eq!(writer.flushes(), 1);
    }

    #[test]
    fn at_batch_02_distinct_timestamps_become_versions() {
        let (store, table) = setup(10);
        let mut writer = BatchWriter::new(table.clone());
        for ts in [100, 101, 102] {
            writer
                .put(&store, row("same"), col(), ts.to_string().into_bytes(), Some(ts))
                .unwrap();
        }
        writer.commit(&store).unwrap();
        let versions = store.cell_versions(&table, &row("same"), &col());
        let stamps: Vec<u64> = versions.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(stamps, vec![102, 101, 100]);
    }

    #[test]
    fn at_batch_03_duplicate_cell_is_rejected() {
        let (store, table) = setup(10);
        let mut writer = BatchWriter::new(table).with_pinned_timestamp(Some(7));
        writer.put(&store, row("a"), col(), vec![1], None).unwrap();
        let err = writer
            .put(&store, row("a"), col(), vec![2], Some(7))
            .unwrap_err();
        assert!(matches!(
            err,
            WriteError::DuplicateCell {
                timestamp: Some(7),
                ..
            }
        ));
        assert_eq!(writer.pending(), 1);
    }

    #[test]
    fn at_batch_04_auto_flush_bounds_the_queue() {
        let (store, table) = setup(10);
        let mut writer = BatchWriter::new(table.clone()).with_auto_flush(Some(2));
        for i in 0..5u8 {
            writer
                .put(&store, row(&format!("r{i}")), col(), vec![i], None)
                .unwrap();
            assert!(writer.pending() < 2);
        }
        writer.commit(&store).unwrap();
        assert_eq!(writer.flushes(), 3);
        assert_eq!(writer.committed(), 5);
        assert_eq!(store.row_count(&table), 5);
    }

    #[test]
    fn at_batch_05_failed_commit_keeps_queue() {
        let (store, table) = setup(10);
        let mut writer = BatchWriter::new(table.clone());
        writer.put(&store, row("a"), col(), vec![1], None).unwrap();
        store.inject_failure(
            MemoryOp::Put,
            StorageError::Rejected {
                status: 500,
                detail: "region offline".to_string(),
            },
        );
        let err = writer.commit(&store).unwrap_err();
        assert!(matches!(err, WriteError::Commit { entries: 1, .. }));
        assert_eq!(writer.pending(), 1);
        assert_eq!(store.row_count(&table), 0);
    }
}
