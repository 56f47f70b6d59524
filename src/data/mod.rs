//! Measurement record storage.
pub mod storage;

pub use storage::{MemoryRecordSink, RecordSink};
#[cfg(feature = "storage_csv")]
pub use storage::CsvRecordSink;
