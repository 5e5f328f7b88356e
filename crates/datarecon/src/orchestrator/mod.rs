//! Run orchestrator - reconciles every configured table.

use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ConnectionConfig, RetryConfig, TableConfig};
use crate::drivers::open_source;
use crate::error::{ReconcileError, Result, EXIT_CANCELLED, EXIT_RUN_FAILED, EXIT_SINK_ERROR};
use crate::fetch::BatchFetcher;
use crate::reconcile::{
    JobState, ProgressUpdate, ReconciliationJob, ReconciliationSummary, Reconciler,
};
use crate::report::{CsvFileSink, MismatchReporter, PgTableSink};

/// Reconciles the tables of one configuration, one after another.
pub struct Orchestrator {
    config: Config,
    progress: bool,
}

/// Outcome of one configured table.
#[derive(Debug, Clone, Serialize)]
pub struct TableResult {
    /// Table as configured.
    pub table: String,

    pub status: JobState,

    /// Present once rows started flowing.
    pub summary: Option<ReconciliationSummary>,

    /// Why the table failed before producing a summary.
    pub error: Option<String>,
}

/// Result of a reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 of the configuration used.
    pub config_hash: String,

    /// Final status: completed, cancelled or failed.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// Tables configured.
    pub tables_total: usize,

    /// Tables that completed without differences.
    pub tables_clean: usize,

    /// Tables that completed with differences or data errors.
    pub tables_with_differences: usize,

    /// Tables that failed.
    pub tables_failed: usize,

    pub rows_compared: u64,
    pub rows_matched: u64,
    pub rows_mismatched: u64,
    pub rows_missing: u64,
    pub data_errors: u64,

    pub failed_tables: Vec<String>,

    /// Sinks that failed for any table.
    pub failed_sinks: Vec<String>,

    pub tables: Vec<TableResult>,
}

impl RunResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Process exit code. Differences in the data are not an error.
    pub fn exit_code(&self) -> u8 {
        match self.status.as_str() {
            "cancelled" => EXIT_CANCELLED,
            "failed" => EXIT_RUN_FAILED,
            _ if !self.failed_sinks.is_empty() => EXIT_SINK_ERROR,
            _ => 0,
        }
    }
}

/// Connectivity of both databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
    pub healthy: bool,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            progress: false,
        }
    }

    /// Print progress updates as JSON lines to stderr.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reconcile every configured table.
    ///
    /// A failing table is recorded and the run moves on. Cancellation ends
    /// the table in progress as Cancelled and skips the rest.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunResult> {
        if self.config.tables.is_empty() {
            return Err(ReconcileError::Config("no tables configured".into()));
        }

        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Starting reconciliation run {} ({} tables)",
            run_id,
            self.config.tables.len()
        );

        let mut tables = Vec::with_capacity(self.config.tables.len());
        for table in &self.config.tables {
            if cancel.is_cancelled() {
                warn!("Cancelled, skipping {}", table.source);
                continue;
            }

            let result = match self.reconcile_table(table, &run_id, &cancel).await {
                Ok(summary) => TableResult {
                    table: table.source.clone(),
                    status: summary.status,
                    summary: Some(summary),
                    error: None,
                },
                Err(e) => {
                    error!("{}: {}", table.source, e);
                    TableResult {
                        table: table.source.clone(),
                        status: JobState::Failed,
                        summary: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            tables.push(result);
        }

        let completed_at = Utc::now();
        let result = build_result(
            run_id,
            self.config.hash(),
            started_at,
            completed_at,
            self.config.tables.len(),
            tables,
            cancel.is_cancelled(),
        );

        info!(
            "Reconciliation {}: {}/{} tables clean, {} rows compared in {:.1}s",
            result.status,
            result.tables_clean,
            result.tables_total,
            result.rows_compared,
            result.duration_seconds
        );
        Ok(result)
    }

    async fn reconcile_table(
        &self,
        table: &TableConfig,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ReconciliationSummary> {
        let job = ReconciliationJob::from_config(&self.config, table, run_id)?;
        let retry = job.retry;

        let source = BatchFetcher::new(open_source(&self.config.source).await?, retry);
        let target = BatchFetcher::new(open_source(&self.config.target).await?, retry);
        let mut reporter = self.reporter(retry)?;

        let table_name = job.source_table.full_name();
        let mut reconciler = Reconciler::new(job).with_cancel(cancel.child_token());
        if self.progress {
            reconciler = reconciler.with_progress(Box::new(move |update: &ProgressUpdate| {
                let line = serde_json::json!({
                    "table": table_name,
                    "rows_compared": update.rows_compared,
                    "rows_matched": update.rows_matched,
                    "rows_mismatched": update.rows_mismatched,
                    "rows_missing": update.rows_missing,
                    "estimated_total": update.estimated_total,
                });
                eprintln!("{}", line);
            }));
        }

        reconciler.run(source, target, &mut reporter).await
    }

    fn reporter(&self, retry: RetryConfig) -> Result<MismatchReporter> {
        let output = &self.config.output;
        let mut reporter = MismatchReporter::new(output.detail_window, retry);
        if output.mode.uses_file() {
            reporter = reporter.with_sink(Box::new(CsvFileSink::new(output.path.clone())));
        }
        if output.mode.uses_table() {
            reporter = reporter.with_sink(Box::new(PgTableSink::new(
                self.config.target.clone(),
                output,
            )?));
        }
        Ok(reporter)
    }

    /// Ping both databases concurrently.
    pub async fn health_check(&self) -> HealthCheckResult {
        let (
            (source_connected, source_latency_ms, source_error),
            (target_connected, target_latency_ms, target_error),
        ) = join(ping(&self.config.source), ping(&self.config.target)).await;

        HealthCheckResult {
            source_connected,
            source_latency_ms,
            source_error,
            target_connected,
            target_latency_ms,
            target_error,
            healthy: source_connected && target_connected,
        }
    }
}

async fn ping(config: &ConnectionConfig) -> (bool, u64, Option<String>) {
    let start = Instant::now();
    let result = async {
        let mut source = open_source(config).await?;
        source.ping().await?;
        source.close().await;
        Ok::<_, ReconcileError>(())
    }
    .await;
    let latency = start.elapsed().as_millis() as u64;

    match result {
        Ok(()) => (true, latency, None),
        Err(e) => {
            warn!("{}: health check failed: {}", config.display_target(), e);
            (false, latency, Some(e.to_string()))
        }
    }
}

fn build_result(
    run_id: String,
    config_hash: String,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    tables_total: usize,
    tables: Vec<TableResult>,
    cancelled: bool,
) -> RunResult {
    let mut result = RunResult {
        run_id,
        config_hash,
        status: String::new(),
        duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
        started_at,
        completed_at,
        tables_total,
        tables_clean: 0,
        tables_with_differences: 0,
        tables_failed: 0,
        rows_compared: 0,
        rows_matched: 0,
        rows_mismatched: 0,
        rows_missing: 0,
        data_errors: 0,
        failed_tables: Vec::new(),
        failed_sinks: Vec::new(),
        tables: Vec::new(),
    };

    for table in &tables {
        if let Some(summary) = &table.summary {
            result.rows_compared += summary.rows_compared;
            result.rows_matched += summary.rows_matched;
            result.rows_mismatched += summary.rows_mismatched;
            result.rows_missing += summary.rows_missing();
            result.data_errors += summary.data_errors;
            for sink in &summary.failed_sinks {
                if !result.failed_sinks.contains(sink) {
                    result.failed_sinks.push(sink.clone());
                }
            }
        }
        match (table.status, &table.summary) {
            (JobState::Failed, _) => {
                result.tables_failed += 1;
                result.failed_tables.push(table.table.clone());
            }
            (JobState::Completed, Some(s)) if s.is_clean() => result.tables_clean += 1,
            (JobState::Completed, _) => result.tables_with_differences += 1,
            _ => {}
        }
    }

    result.status = if result.tables_failed > 0 {
        "failed"
    } else if cancelled || tables.iter().any(|t| t.status == JobState::Cancelled) {
        "cancelled"
    } else {
        "completed"
    }
    .to_string();
    result.tables = tables;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(status: JobState, mismatched: u64, failed_sinks: Vec<String>) -> ReconciliationSummary {
        ReconciliationSummary {
            run_id: "r".into(),
            source_table: "dbo.t".into(),
            target_table: "public.t".into(),
            status,
            rows_compared: 10,
            rows_matched: 10 - mismatched,
            rows_mismatched: mismatched,
            rows_missing_in_target: 0,
            rows_missing_in_source: 0,
            data_errors: 0,
            source_row_estimate: None,
            target_row_estimate: None,
            warnings: vec![],
            failed_sinks,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            failure: None,
            incomplete: status != JobState::Completed,
        }
    }

    fn table(name: &str, summary: ReconciliationSummary) -> TableResult {
        TableResult {
            table: name.into(),
            status: summary.status,
            summary: Some(summary),
            error: None,
        }
    }

    fn result(tables: Vec<TableResult>, cancelled: bool) -> RunResult {
        let now = Utc::now();
        let total = tables.len();
        build_result("r".into(), "h".into(), now, now, total, tables, cancelled)
    }

    #[test]
    fn test_totals_and_clean_tables() {
        let r = result(
            vec![
                table("a", summary(JobState::Completed, 0, vec![])),
                table("b", summary(JobState::Completed, 3, vec![])),
            ],
            false,
        );
        assert_eq!(r.status, "completed");
        assert_eq!(r.tables_clean, 1);
        assert_eq!(r.tables_with_differences, 1);
        assert_eq!(r.rows_compared, 20);
        assert_eq!(r.rows_mismatched, 3);
        assert_eq!(r.exit_code(), 0);
    }

    #[test]
    fn test_failed_table_fails_run() {
        let failed = TableResult {
            table: "b".into(),
            status: JobState::Failed,
            summary: None,
            error: Some("Schema mismatch".into()),
        };
        let r = result(
            vec![table("a", summary(JobState::Completed, 0, vec![])), failed],
            false,
        );
        assert_eq!(r.status, "failed");
        assert_eq!(r.failed_tables, vec!["b".to_string()]);
        assert_eq!(r.exit_code(), EXIT_RUN_FAILED);
    }

    #[test]
    fn test_sink_failure_exit_code() {
        let r = result(
            vec![table("a", summary(JobState::Completed, 0, vec!["csv".into()]))],
            false,
        );
        assert_eq!(r.status, "completed");
        assert_eq!(r.failed_sinks, vec!["csv".to_string()]);
        assert_eq!(r.exit_code(), EXIT_SINK_ERROR);
    }

    #[test]
    fn test_cancelled_run() {
        let r = result(vec![table("a", summary(JobState::Cancelled, 0, vec![]))], true);
        assert_eq!(r.status, "cancelled");
        assert_eq!(r.exit_code(), EXIT_CANCELLED);
        assert!(r.to_json().unwrap().contains("\"status\": \"cancelled\""));
    }
}
