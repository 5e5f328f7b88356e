//! CSV file sink.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{DetailRecord, ReportSink, RunInfo};
use crate::error::{ReconcileError, Result};
use crate::reconcile::ReconciliationSummary;

/// Subdirectory of the output path that receives the reports.
const REPORT_DIR: &str = "ValidationReports";

const HEADER: [&str; 8] = [
    "table_name",
    "key",
    "column_name",
    "source_value",
    "target_value",
    "status",
    "recorded_at",
    "run_id",
];

#[derive(Serialize)]
struct CsvDetailRow<'a> {
    table_name: &'a str,
    key: &'a str,
    column_name: &'a str,
    source_value: &'a str,
    target_value: &'a str,
    status: &'a str,
    recorded_at: String,
    run_id: &'a str,
}

impl<'a> From<&'a DetailRecord> for CsvDetailRow<'a> {
    fn from(r: &'a DetailRecord) -> Self {
        Self {
            table_name: &r.table_name,
            key: &r.key,
            column_name: r.column.as_deref().unwrap_or(""),
            source_value: r.source_value.as_deref().unwrap_or(""),
            target_value: r.target_value.as_deref().unwrap_or(""),
            status: r.status.as_str(),
            recorded_at: r.recorded_at.to_rfc3339(),
            run_id: &r.run_id,
        }
    }
}

/// Writes `<root>/ValidationReports/<table>_<timestamp>.csv` and a
/// `<table>_<timestamp>_summary.json` next to it.
///
/// Each batch is appended whole or not at all, so a retried batch never
/// leaves a partial copy behind.
pub struct CsvFileSink {
    root: PathBuf,
    file: Option<File>,
    csv_path: Option<PathBuf>,
    summary_path: Option<PathBuf>,
}

impl CsvFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file: None,
            csv_path: None,
            summary_path: None,
        }
    }

    /// Path of the current detail file, once `begin` has run.
    pub fn csv_path(&self) -> Option<&Path> {
        self.csv_path.as_deref()
    }

    pub fn summary_path(&self) -> Option<&Path> {
        self.summary_path.as_deref()
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| ReconcileError::sink("csv", "write before begin"))
    }
}

/// Render a batch as CSV lines, without touching the file.
fn encode(records: &[DetailRecord]) -> Result<Vec<u8>> {
    let mut writer = ::csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for record in records {
        writer.serialize(CsvDetailRow::from(record))?;
    }
    writer
        .into_inner()
        .map_err(|e| ReconcileError::sink("csv", e.to_string()))
}

/// Append `bytes`, cutting the file back to its old length if the write fails.
fn append(file: &mut File, bytes: &[u8]) -> Result<()> {
    let len = file.metadata()?.len();
    if let Err(e) = file.write_all(bytes).and_then(|_| file.flush()) {
        if let Err(truncate) = file.set_len(len) {
            warn!("could not roll back partial csv batch: {}", truncate);
        }
        return Err(e.into());
    }
    Ok(())
}

/// Table name usable in a file name.
fn file_stem(table: &str) -> String {
    table
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[async_trait]
impl ReportSink for CsvFileSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn begin(&mut self, run: &RunInfo) -> Result<()> {
        let dir = self.root.join(REPORT_DIR);
        fs::create_dir_all(&dir)?;

        let stem = format!(
            "{}_{}",
            file_stem(&run.source_table),
            run.started_at.format("%Y%m%d_%H%M%S")
        );
        let csv_path = dir.join(format!("{}.csv", stem));
        let summary_path = dir.join(format!("{}_summary.json", stem));

        let mut writer = ::csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&csv_path)?;
        writer.write_record(HEADER)?;
        writer.flush()?;
        drop(writer);

        debug!("csv sink writing {}", csv_path.display());
        self.file = Some(OpenOptions::new().append(true).open(&csv_path)?);
        self.csv_path = Some(csv_path);
        self.summary_path = Some(summary_path);
        Ok(())
    }

    async fn write(&mut self, records: &[DetailRecord]) -> Result<()> {
        let file = self.file()?;
        if records.is_empty() {
            return Ok(());
        }
        let bytes = encode(records)?;
        append(file, &bytes)
    }

    async fn write_summary(&mut self, summary: &ReconciliationSummary) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        let path = self
            .summary_path
            .clone()
            .ok_or_else(|| ReconcileError::sink("csv", "summary before begin"))?;
        let json = serde_json::to_string_pretty(summary)?;
        fs::write(&path, json)?;
        info!("report written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::JobState;
    use crate::report::DetailStatus;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn run() -> RunInfo {
        RunInfo {
            run_id: "r1".into(),
            source_table: "dbo.Orders".into(),
            target_table: "public.orders".into(),
            started_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap(),
        }
    }

    fn summary(run: &RunInfo) -> ReconciliationSummary {
        ReconciliationSummary {
            run_id: run.run_id.clone(),
            source_table: run.source_table.clone(),
            target_table: run.target_table.clone(),
            status: JobState::Completed,
            rows_compared: 1,
            rows_matched: 0,
            rows_mismatched: 1,
            rows_missing_in_target: 0,
            rows_missing_in_source: 0,
            data_errors: 0,
            source_row_estimate: None,
            target_row_estimate: None,
            warnings: vec![],
            failed_sinks: vec![],
            started_at: run.started_at,
            completed_at: Some(run.started_at),
            failure: None,
            incomplete: false,
        }
    }

    #[tokio::test]
    async fn test_writes_header_records_and_summary() {
        let dir = TempDir::new().unwrap();
        let mut sink = CsvFileSink::new(dir.path());
        let run = run();
        sink.begin(&run).await.unwrap();

        let record = DetailRecord {
            run_id: "r1".into(),
            table_name: "dbo.Orders".into(),
            key: "2".into(),
            column: Some("qty".into()),
            source_value: Some("25".into()),
            target_value: Some("a,b".into()),
            status: DetailStatus::Mismatch,
            recorded_at: run.started_at,
        };
        sink.write(&[record]).await.unwrap();
        sink.write_summary(&summary(&run)).await.unwrap();

        let csv_path = sink.csv_path().unwrap().to_path_buf();
        assert!(csv_path.ends_with("ValidationReports/dbo_Orders_20240301_123005.csv"));

        let text = fs::read_to_string(&csv_path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "table_name,key,column_name,source_value,target_value,status,recorded_at,run_id"
        );
        assert_eq!(
            lines.next().unwrap(),
            "dbo.Orders,2,qty,25,\"a,b\",Mismatch,2024-03-01T12:30:05+00:00,r1"
        );

        let json = fs::read_to_string(sink.summary_path().unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["rows_mismatched"], 1);
        assert_eq!(value["status"], "completed");
    }

    fn record(run: &RunInfo, key: &str) -> DetailRecord {
        DetailRecord {
            run_id: "r1".into(),
            table_name: "dbo.Orders".into(),
            key: key.into(),
            column: None,
            source_value: Some("{id: 1}".into()),
            target_value: None,
            status: DetailStatus::MissingInTarget,
            recorded_at: run.started_at,
        }
    }

    #[tokio::test]
    async fn test_batches_append_whole_rows() {
        let dir = TempDir::new().unwrap();
        let mut sink = CsvFileSink::new(dir.path());
        let run = run();
        sink.begin(&run).await.unwrap();

        sink.write(&[record(&run, "1"), record(&run, "2")]).await.unwrap();
        sink.write(&[]).await.unwrap();
        sink.write(&[record(&run, "3")]).await.unwrap();

        let text = fs::read_to_string(sink.csv_path().unwrap()).unwrap();
        let keys: Vec<&str> = text
            .lines()
            .skip(1)
            .map(|l| l.split(',').nth(1).unwrap())
            .collect();
        assert_eq!(keys, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_rejected_batch_leaves_file_unchanged() {
        let dir = TempDir::new().unwrap();
        let mut sink = CsvFileSink::new(dir.path());
        let run = run();
        sink.begin(&run).await.unwrap();
        sink.write(&[record(&run, "1")]).await.unwrap();
        sink.write_summary(&summary(&run)).await.unwrap();

        let path = sink.csv_path().unwrap().to_path_buf();
        let before = fs::read(&path).unwrap();
        assert!(sink.write(&[record(&run, "2")]).await.is_err());
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_encode_keeps_embedded_newlines_in_one_record() {
        let run = run();
        let mut multi = record(&run, "7");
        multi.source_value = Some("line one\nline two".into());
        let bytes = encode(&[multi]).unwrap();

        let mut reader = ::csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(bytes.as_slice());
        let rows: Vec<::csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][3], "line one\nline two");
    }

    #[tokio::test]
    async fn test_write_before_begin_fails() {
        let dir = TempDir::new().unwrap();
        let mut sink = CsvFileSink::new(dir.path());
        assert!(sink.write(&[]).await.is_err());
    }
}
