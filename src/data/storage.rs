//! Record sinks for scan data.
//!
//! A sink receives the header once, then one row per [`MeasurementRecord`],
//! then `finish`. Rows are never rewritten.
use crate::error::{AppResult, DaqError};
use crate::measurement_types::MeasurementRecord;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Time format of the first column.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Column titles, with a theta column for circular scans.
pub fn header(with_theta: bool) -> Vec<String> {
    let mut columns = vec!["Time"];
    if with_theta {
        columns.push("theta / rad");
    }
    columns.extend([
        "x / mm",
        "y / mm",
        "z / mm",
        "bx / mT",
        "by / mT",
        "bz / mT",
        "std(bx) / mT",
        "std(by) / mT",
        "std(bz) / mT",
        "T / C",
        "std(T) / C",
    ]);
    columns.into_iter().map(String::from).collect()
}

/// One row matching [`header`]. Positions carry 3 decimals.
pub fn record_row(record: &MeasurementRecord, with_theta: bool) -> Vec<String> {
    let mut row = vec![record.timestamp.format(TIME_FORMAT).to_string()];
    if with_theta {
        row.push(record.theta.map_or_else(String::new, |t| format!("{t:.6}")));
    }
    row.extend(record.position.iter().map(|p| format!("{p:.3}")));
    row.extend(record.field.to_values().iter().map(f64::to_string));
    row
}

/// Append-only destination for measurement records.
#[async_trait]
pub trait RecordSink: Send {
    /// Open the destination and write the header.
    async fn begin(&mut self, with_theta: bool) -> AppResult<()>;

    /// Append one record.
    async fn append(&mut self, record: &MeasurementRecord) -> AppResult<()>;

    /// Flush and close.
    async fn finish(&mut self) -> AppResult<()>;

    /// File written to, if any.
    fn location(&self) -> Option<PathBuf> {
        None
    }
}

/// Writes records to a timestamped CSV file.
#[cfg(feature = "storage_csv")]
pub struct CsvRecordSink {
    dir: PathBuf,
    prefix: String,
    path: Option<PathBuf>,
    with_theta: bool,
    writer: Option<csv::Writer<std::fs::File>>,
}

#[cfg(feature = "storage_csv")]
impl CsvRecordSink {
    /// Sink writing `<dir>/<prefix>_<YYYYmmdd_HHMMSS>.csv`.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            path: None,
            with_theta: false,
            writer: None,
        }
    }

    /// Sink writing to exactly `path`.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            prefix: String::new(),
            path: Some(path),
            with_theta: false,
            writer: None,
        }
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl RecordSink for CsvRecordSink {
    async fn begin(&mut self, with_theta: bool) -> AppResult<()> {
        if !self.dir.as_os_str().is_empty() && !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).map_err(|e| DaqError::Storage(e.to_string()))?;
        }
        let path = match &self.path {
            Some(path) => path.clone(),
            None => {
                let file_name = format!(
                    "{}_{}.csv",
                    self.prefix,
                    chrono::Local::now().format("%Y%m%d_%H%M%S")
                );
                let path = self.dir.join(file_name);
                self.path = Some(path.clone());
                path
            }
        };

        let mut writer = csv::Writer::from_path(&path)
            .map_err(|e| DaqError::Storage(format!("Failed to create CSV file: {e}")))?;
        writer
            .write_record(header(with_theta))
            .map_err(|e| DaqError::Storage(e.to_string()))?;
        writer.flush()?;

        tracing::info!(path = %path.display(), "CSV sink opened");
        self.with_theta = with_theta;
        self.writer = Some(writer);
        Ok(())
    }

    async fn append(&mut self, record: &MeasurementRecord) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Storage("CSV sink used before begin".into()))?;
        writer
            .write_record(record_row(record, self.with_theta))
            .map_err(|e| DaqError::Storage(e.to_string()))?;
        // rows survive an aborted session
        writer.flush()?;
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    fn location(&self) -> Option<PathBuf> {
        self.path.clone()
    }
}

/// Placeholder when CSV storage is compiled out.
#[cfg(not(feature = "storage_csv"))]
pub struct CsvRecordSink;

#[cfg(not(feature = "storage_csv"))]
impl CsvRecordSink {
    /// Sink that refuses to open.
    pub fn new(_dir: impl Into<PathBuf>, _prefix: impl Into<String>) -> Self {
        Self
    }

    /// Sink that refuses to open.
    pub fn at_path(_path: impl Into<PathBuf>) -> Self {
        Self
    }
}

#[cfg(not(feature = "storage_csv"))]
#[async_trait]
impl RecordSink for CsvRecordSink {
    async fn begin(&mut self, _with_theta: bool) -> AppResult<()> {
        Err(DaqError::Storage(
            "CSV storage requires the storage_csv feature".into(),
        ))
    }

    async fn append(&mut self, _record: &MeasurementRecord) -> AppResult<()> {
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    header: Vec<String>,
    records: Vec<MeasurementRecord>,
    finished: bool,
}

/// Keeps records in memory. Clones share the same storage.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecordSink {
    log: Arc<Mutex<MemoryLog>>,
}

impl MemoryRecordSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Header written by `begin`.
    pub fn header(&self) -> Vec<String> {
        self.lock().header.clone()
    }

    /// Records appended so far.
    pub fn records(&self) -> Vec<MeasurementRecord> {
        self.lock().records.clone()
    }

    /// Number of records appended.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// True before the first record.
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Whether `finish` was called.
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn begin(&mut self, with_theta: bool) -> AppResult<()> {
        let mut log = self.lock();
        log.header = header(with_theta);
        log.records.clear();
        log.finished = false;
        Ok(())
    }

    async fn append(&mut self, record: &MeasurementRecord) -> AppResult<()> {
        self.lock().records.push(record.clone());
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        self.lock().finished = true;
        Ok(())
    }
}
