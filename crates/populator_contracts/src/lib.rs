#![forbid(unsafe_code)]

pub mod common;
pub mod config;
pub mod envelope;
pub mod key;
pub mod row;
pub mod table;

pub use common::{ContractViolation, Validate};
