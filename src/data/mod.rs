//! Result persistence.

pub mod storage;

pub use storage::{CsvRecord, CsvSink, MemorySink, ResultSink};
