#![forbid(unsafe_code)]

pub mod batch;
pub mod memory;
pub mod provision;
pub mod rest;
pub mod store;

pub use batch::{BatchWriter, WriteError};
pub use memory::{MemoryConnector, MemoryOp, MemoryStore};
pub use provision::{ProvisionOutcome, ProvisioningError, TableProvisioner};
pub use rest::{RestConnector, RestStore};
pub use store::{ColumnStore, StorageError, StoreConnector};
