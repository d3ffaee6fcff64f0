#![forbid(unsafe_code)]

pub mod completion;
pub mod ingest;
pub mod retry;
pub mod sample_data;

pub use ingest::{IngestError, IngestionDriver, IngestionReport, IngestionState};
pub use retry::{Backoff, CancellationToken, Clock, ManualClock, RetryPolicy, SystemClock};
