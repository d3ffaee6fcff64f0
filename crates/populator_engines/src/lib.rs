#![forbid(unsafe_code)]

pub mod cipher;
pub mod key_provider;
pub mod payload;
pub mod row_key;
