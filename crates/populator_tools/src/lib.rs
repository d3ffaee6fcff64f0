#![forbid(unsafe_code)]

pub mod populate_cli;
