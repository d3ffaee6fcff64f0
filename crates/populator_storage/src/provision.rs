#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use populator_contracts::table::{TableName, TableSchema};
use tracing::{info, warn};

use crate::store::{ColumnStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Created,
    AlreadyPresent,
    /// Someone else created the table between our list and our create.
    CreatedConcurrently,
    /// Ensured earlier in this run; the store was not consulted.
    Cached,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to provision table {table}: {source}")]
pub struct ProvisioningError {
    pub table: TableName,
    #[source]
    pub source: StorageError,
}

/// Idempotent table creation with a per-run cache of ensured names.
#[derive(Debug, Default)]
pub struct TableProvisioner {
    ensured: BTreeSet<TableName>,
}

impl TableProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ensured(&self, table: &TableName) -> bool {
        self.ensured.contains(table)
    }

    /// Marks a table as present without asking the store, for runs that skip creation.
    pub fn assume_present(&mut self, table: TableName) {
        self.ensured.insert(table);
    }

    pub fn ensured_tables(&self) -> impl Iterator<Item = &TableName> {
        self.ensured.iter()
    }

    pub fn ensure_table<S: ColumnStore + ?Sized>(
        &mut self,
        store: &S,
        schema: &TableSchema,
    ) -> Result<ProvisionOutcome, ProvisioningError> {
        if self.ensured.contains(&schema.name) {
            return Ok(ProvisionOutcome::Cached);
        }
        let wrap = |source| ProvisioningError {
            table: schema.name.clone(),
            source,
        };
        let existing = store.list_tables().map_err(wrap)?;
        if existing.contains(&schema.name) {
            info!(table = %schema.name, "table already present");
            self.ensured.insert(schema.name.clone());
            return Ok(ProvisionOutcome::AlreadyPresent);
        }
        let outcome = match store.create_table(schema) {
            Ok(()) => {
                info!(
                    table = %schema.name,
                    family = %schema.family,
                    max_versions = schema.max_versions,
                    "table created"
                );
                ProvisionOutcome::Created
            }
            Err(StorageError::TableExists(_)) => {
                warn!(table = %schema.name, "table created concurrently, continuing");
                ProvisionOutcome::CreatedConcurrently
            }
            Err(err) => return Err(wrap(err)),
        };
        self.ensured.insert(schema.name.clone());
        Ok(outcome)
    }
}
