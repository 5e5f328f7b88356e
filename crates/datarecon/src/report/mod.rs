//! Mismatch reporting.
//!
//! [`MismatchReporter`] keeps the counters of one table comparison and turns
//! non-matching outcomes into [`DetailRecord`]s. Records are buffered in a
//! bounded window and flushed to every configured [`ReportSink`] when the
//! window fills and at [`MismatchReporter::finalize`].
//!
//! Sink calls are retried with backoff. A sink that still fails is marked
//! failed and skipped from then on; the comparison and the other sinks keep
//! going, and the failed sink is named in the summary.
//!
//! - [`csv`]: CSV detail files plus a JSON summary
//! - [`table`]: summary and detail tables in PostgreSQL

pub mod csv;
pub mod table;

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::RetryConfig;
use crate::error::{ReconcileError, Result};
use crate::reconcile::{JobState, OutcomeKind, ProgressUpdate, ReconciliationSummary, RowOutcome, Side};

pub use self::csv::CsvFileSink;
pub use self::table::PgTableSink;

/// Classification carried by a detail record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DetailStatus {
    Mismatch,
    MissingInTarget,
    MissingInSource,
    NullKey,
}

impl DetailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetailStatus::Mismatch => "Mismatch",
            DetailStatus::MissingInTarget => "MissingInTarget",
            DetailStatus::MissingInSource => "MissingInSource",
            DetailStatus::NullKey => "NullKey",
        }
    }
}

/// One reported difference. Mismatched rows produce one record per
/// differing column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailRecord {
    pub run_id: String,
    pub table_name: String,
    /// Canonical key, components joined with `|`.
    pub key: String,
    pub column: Option<String>,
    pub source_value: Option<String>,
    pub target_value: Option<String>,
    pub status: DetailStatus,
    pub recorded_at: DateTime<Utc>,
}

/// Identity of the comparison a sink is about to receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunInfo {
    pub run_id: String,
    pub source_table: String,
    pub target_table: String,
    pub started_at: DateTime<Utc>,
}

/// Destination for detail records and summaries.
#[async_trait]
pub trait ReportSink: Send {
    /// Name used in logs and in `failed_sinks`.
    fn name(&self) -> &str;

    /// Called once before any record of a comparison.
    async fn begin(&mut self, run: &RunInfo) -> Result<()>;

    /// Persist a batch of records. May be called any number of times.
    async fn write(&mut self, records: &[DetailRecord]) -> Result<()>;

    /// Persist the final summary. Called once.
    async fn write_summary(&mut self, summary: &ReconciliationSummary) -> Result<()>;
}

/// Outcome counters of one comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub rows_compared: u64,
    pub rows_matched: u64,
    pub rows_mismatched: u64,
    pub rows_missing_in_target: u64,
    pub rows_missing_in_source: u64,
    pub data_errors: u64,
}

impl Counters {
    pub fn rows_missing(&self) -> u64 {
        self.rows_missing_in_target + self.rows_missing_in_source
    }

    pub fn progress(&self, estimated_total: Option<u64>) -> ProgressUpdate {
        ProgressUpdate {
            rows_compared: self.rows_compared,
            rows_matched: self.rows_matched,
            rows_mismatched: self.rows_mismatched,
            rows_missing: self.rows_missing(),
            estimated_total,
        }
    }
}

struct SinkSlot {
    sink: Box<dyn ReportSink>,
    failed: bool,
}

#[derive(Clone, Copy)]
enum SinkOp<'a> {
    Begin(&'a RunInfo),
    Write(&'a [DetailRecord]),
    Summary(&'a ReconciliationSummary),
}

/// Counts outcomes and feeds detail records to the sinks.
pub struct MismatchReporter {
    window: usize,
    retry: RetryConfig,
    sinks: Vec<SinkSlot>,
    buffer: Vec<DetailRecord>,
    run: Option<RunInfo>,
    counters: Counters,
    warnings: Vec<String>,
    source_estimate: Option<i64>,
    target_estimate: Option<i64>,
}

impl MismatchReporter {
    /// A reporter flushing every `window` records.
    pub fn new(window: usize, retry: RetryConfig) -> Self {
        Self {
            window: window.max(1),
            retry,
            sinks: Vec::new(),
            buffer: Vec::new(),
            run: None,
            counters: Counters::default(),
            warnings: Vec::new(),
            source_estimate: None,
            target_estimate: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ReportSink>) -> Self {
        self.sinks.push(SinkSlot { sink, failed: false });
        self
    }

    /// Start a comparison. Sinks receive `run` before any record.
    pub async fn begin(&mut self, run: RunInfo) {
        dispatch(&mut self.sinks, self.retry, SinkOp::Begin(&run)).await;
        self.run = Some(run);
    }

    /// Count an outcome; non-matching outcomes become detail records.
    pub async fn record_outcome(&mut self, outcome: &RowOutcome) {
        self.counters.rows_compared += 1;
        let record = match &outcome.kind {
            OutcomeKind::Matched => {
                self.counters.rows_matched += 1;
                return;
            }
            OutcomeKind::Mismatched(diffs) => {
                self.counters.rows_mismatched += 1;
                let key = outcome.key.to_string();
                for diff in diffs {
                    let mut record = self.record(key.clone(), DetailStatus::Mismatch);
                    record.column = Some(diff.column.clone());
                    record.source_value = Some(diff.source.to_string());
                    record.target_value = Some(diff.target.to_string());
                    self.buffer.push(record);
                }
                self.flush_if_full().await;
                return;
            }
            OutcomeKind::MissingInTarget(row) => {
                self.counters.rows_missing_in_target += 1;
                let mut record =
                    self.record(outcome.key.to_string(), DetailStatus::MissingInTarget);
                record.source_value = Some(row.to_string());
                record
            }
            OutcomeKind::MissingInSource(row) => {
                self.counters.rows_missing_in_source += 1;
                let mut record =
                    self.record(outcome.key.to_string(), DetailStatus::MissingInSource);
                record.target_value = Some(row.to_string());
                record
            }
        };
        self.buffer.push(record);
        self.flush_if_full().await;
    }

    /// Record a row excluded from the merge because key `column` is null.
    pub async fn record_integrity_error(&mut self, side: Side, column: &str, key: String) {
        self.counters.data_errors += 1;
        let mut record = self.record(key, DetailStatus::NullKey);
        if let Some(run) = &self.run {
            record.table_name = match side {
                Side::Source => run.source_table.clone(),
                Side::Target => run.target_table.clone(),
            };
        }
        record.column = Some(column.to_string());
        self.buffer.push(record);
        self.flush_if_full().await;
    }

    /// Attach a schema or row count warning to the summary.
    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn set_row_estimates(&mut self, source: Option<i64>, target: Option<i64>) {
        self.source_estimate = source;
        self.target_estimate = target;
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Names of sinks that exhausted their retries.
    pub fn failed_sinks(&self) -> Vec<String> {
        self.sinks
            .iter()
            .filter(|s| s.failed)
            .map(|s| s.sink.name().to_string())
            .collect()
    }

    /// Flush pending records, write the summary to every healthy sink and
    /// return it.
    pub async fn finalize(
        &mut self,
        status: JobState,
        failure: Option<String>,
    ) -> ReconciliationSummary {
        self.flush().await;

        let run = self.run.clone().unwrap_or_else(|| RunInfo {
            run_id: String::new(),
            source_table: String::new(),
            target_table: String::new(),
            started_at: Utc::now(),
        });
        let c = self.counters;
        let mut summary = ReconciliationSummary {
            run_id: run.run_id,
            source_table: run.source_table,
            target_table: run.target_table,
            status,
            rows_compared: c.rows_compared,
            rows_matched: c.rows_matched,
            rows_mismatched: c.rows_mismatched,
            rows_missing_in_target: c.rows_missing_in_target,
            rows_missing_in_source: c.rows_missing_in_source,
            data_errors: c.data_errors,
            source_row_estimate: self.source_estimate,
            target_row_estimate: self.target_estimate,
            warnings: self.warnings.clone(),
            failed_sinks: self.failed_sinks(),
            started_at: run.started_at,
            completed_at: Some(Utc::now()),
            failure,
            incomplete: status != JobState::Completed,
        };

        dispatch(&mut self.sinks, self.retry, SinkOp::Summary(&summary)).await;
        summary.failed_sinks = self.failed_sinks();

        info!(
            "{}: {} compared, {} matched, {} mismatched, {} missing in target, {} missing in source, {} data errors ({})",
            summary.source_table,
            summary.rows_compared,
            summary.rows_matched,
            summary.rows_mismatched,
            summary.rows_missing_in_target,
            summary.rows_missing_in_source,
            summary.data_errors,
            summary.status
        );
        summary
    }

    fn record(&self, key: String, status: DetailStatus) -> DetailRecord {
        let (run_id, table_name) = match &self.run {
            Some(run) => (run.run_id.clone(), run.source_table.clone()),
            None => (String::new(), String::new()),
        };
        DetailRecord {
            run_id,
            table_name,
            key,
            column: None,
            source_value: None,
            target_value: None,
            status,
            recorded_at: Utc::now(),
        }
    }

    async fn flush_if_full(&mut self) {
        if self.buffer.len() >= self.window {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let records = std::mem::take(&mut self.buffer);
        dispatch(&mut self.sinks, self.retry, SinkOp::Write(&records)).await;
    }
}

/// Run `op` against every healthy sink, retrying each on its own.
async fn dispatch(sinks: &mut [SinkSlot], retry: RetryConfig, op: SinkOp<'_>) {
    for slot in sinks.iter_mut().filter(|s| !s.failed) {
        let mut attempt = 0;
        loop {
            let result = match op {
                SinkOp::Begin(run) => slot.sink.begin(run).await,
                SinkOp::Write(records) => slot.sink.write(records).await,
                SinkOp::Summary(summary) => slot.sink.write_summary(summary).await,
            };
            match result {
                Ok(()) => break,
                Err(e) if attempt < retry.max_retries => {
                    attempt += 1;
                    let delay = retry.delay_for(attempt);
                    warn!(
                        "sink {}: write failed, retry {}/{} in {:?}: {}",
                        slot.sink.name(),
                        attempt,
                        retry.max_retries,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        "sink {}: giving up after {} retries, disabling it: {}",
                        slot.sink.name(),
                        attempt,
                        e
                    );
                    slot.failed = true;
                    break;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemorySinkState {
    runs: Vec<RunInfo>,
    records: Vec<DetailRecord>,
    flushes: usize,
    summaries: Vec<ReconciliationSummary>,
    failing: bool,
}

/// Sink that keeps everything in memory. Clones share their contents.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    name: String,
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::default(),
        }
    }

    /// A sink whose every call fails.
    pub fn failing(name: impl Into<String>) -> Self {
        let sink = Self::new(name);
        sink.lock().failing = true;
        sink
    }

    pub fn records(&self) -> Vec<DetailRecord> {
        self.lock().records.clone()
    }

    pub fn summaries(&self) -> Vec<ReconciliationSummary> {
        self.lock().summaries.clone()
    }

    pub fn runs(&self) -> Vec<RunInfo> {
        self.lock().runs.clone()
    }

    /// Number of successful `write` calls.
    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }

    fn lock(&self) -> MutexGuard<'_, MemorySinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<()> {
        if self.lock().failing {
            return Err(ReconcileError::sink(&self.name, "sink unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin(&mut self, run: &RunInfo) -> Result<()> {
        self.check()?;
        self.lock().runs.push(run.clone());
        Ok(())
    }

    async fn write(&mut self, records: &[DetailRecord]) -> Result<()> {
        self.check()?;
        let mut state = self.lock();
        state.records.extend_from_slice(records);
        state.flushes += 1;
        Ok(())
    }

    async fn write_summary(&mut self, summary: &ReconciliationSummary) -> Result<()> {
        self.check()?;
        self.lock().summaries.push(summary.clone());
        Ok(())
    }
}
