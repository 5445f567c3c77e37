//! Result sinks.
//!
//! A [`ResultSink`] persists rows as they are produced. [`CsvSink`] writes the
//! header when the file is created and flushes after every row, so a run that dies
//! halfway still leaves a readable file with everything recorded so far.

use crate::error::AppResult;
use crate::measurement::{Measurement, ModelRow, ProfileRow};
use std::fs::File;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Append-only destination for result rows.
pub trait ResultSink<R> {
    /// Persist one row immediately.
    fn append(&mut self, row: &R) -> AppResult<()>;

    /// Close the underlying resource.
    fn finalize(&mut self) -> AppResult<()>;
}

/// Row type with a fixed CSV layout.
pub trait CsvRecord {
    /// Column names.
    fn header() -> &'static [&'static str];

    /// Field values in header order.
    fn record(&self) -> Vec<String>;
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl CsvRecord for Measurement {
    fn header() -> &'static [&'static str] {
        &["elapsed_s", "phase", "volt_v", "curr_a"]
    }

    fn record(&self) -> Vec<String> {
        vec![
            format!("{:.3}", self.elapsed.as_secs_f64()),
            self.phase.label().to_string(),
            optional(self.voltage.value()),
            optional(self.current.value()),
        ]
    }
}

impl CsvRecord for ModelRow {
    fn header() -> &'static [&'static str] {
        &["SOC(%)", "volt_v", "esr_ohm"]
    }

    fn record(&self) -> Vec<String> {
        vec![
            format!("{:.2}", self.soc_pct),
            self.volt_v.to_string(),
            self.esr_ohm.to_string(),
        ]
    }
}

impl CsvRecord for ProfileRow {
    fn header() -> &'static [&'static str] {
        &["elapsed_s", "step", "current_set_a", "current_meas_a", "voltage_v"]
    }

    fn record(&self) -> Vec<String> {
        vec![
            format!("{:.3}", self.elapsed.as_secs_f64()),
            self.step.to_string(),
            self.current_set.to_string(),
            optional(self.current.value()),
            optional(self.voltage.value()),
        ]
    }
}

/// CSV file sink, flushed per row.
pub struct CsvSink<R: CsvRecord> {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows: usize,
    _row: PhantomData<fn(&R)>,
}

impl<R: CsvRecord> CsvSink<R> {
    /// Create (or truncate) `path`, creating parent directories, and write the header.
    pub fn create(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)?;
        writer.write_record(R::header())?;
        writer.flush()?;
        log::info!("CSV sink initialized at '{}'.", path.display());

        Ok(Self {
            path,
            writer: Some(writer),
            rows: 0,
            _row: PhantomData,
        })
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far.
    pub fn rows_written(&self) -> usize {
        self.rows
    }
}

impl<R: CsvRecord> ResultSink<R> for CsvSink<R> {
    fn append(&mut self, row: &R) -> AppResult<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "CSV sink already finalized")
        })?;
        writer.write_record(row.record())?;
        writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    fn finalize(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            log::info!(
                "CSV sink '{}' closed after {} row(s).",
                self.path.display(),
                self.rows
            );
        }
        Ok(())
    }
}

/// In-memory sink, for callers that only need the rows back.
#[derive(Debug, Clone, Default)]
pub struct MemorySink<R> {
    rows: Vec<R>,
    finalized: bool,
}

impl<R> MemorySink<R> {
    /// Empty sink.
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            finalized: false,
        }
    }

    /// Rows appended so far.
    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    /// Whether `finalize` was called.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl<R: Clone> ResultSink<R> for MemorySink<R> {
    fn append(&mut self, row: &R) -> AppResult<()> {
        self.rows.push(row.clone());
        Ok(())
    }

    fn finalize(&mut self) -> AppResult<()> {
        self.finalized = true;
        Ok(())
    }
}
