//! Job, outcome and summary types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{Config, RetryConfig, TableConfig};
use crate::core::{SqlValue, TableName};
use crate::error::{ReconcileError, Result};
use crate::normalize::{CanonicalKey, ValueNormalizer};
use crate::typemap::TypeCompatibilityResolver;

/// Lifecycle of a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        }
    }

    /// Completed, Cancelled or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which table a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Target => f.write_str("target"),
        }
    }
}

/// A source key column and the target column it pairs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapping {
    pub source: String,
    pub target: String,
}

/// Everything one table comparison needs.
#[derive(Debug, Clone)]
pub struct ReconciliationJob {
    pub run_id: String,
    pub source_table: TableName,
    pub target_table: TableName,
    /// Empty: the source primary key, looked up by name on the target.
    pub key_columns: Vec<KeyMapping>,
    /// Columns left out of value comparison (matched case-insensitively).
    pub exclude_columns: Vec<String>,
    pub batch_size: usize,
    /// Pages buffered per side between fetcher and merge.
    pub buffer_batches: usize,
    pub normalizer: ValueNormalizer,
    pub resolver: TypeCompatibilityResolver,
    pub retry: RetryConfig,
    /// Rows between progress callbacks.
    pub progress_interval: usize,
    /// Compare catalog row estimates before fetching.
    pub row_count_check: bool,
}

impl ReconciliationJob {
    /// A job with default settings, keyed by the source primary key or,
    /// without one, by every column both tables share.
    pub fn new(source_table: TableName, target_table: TableName) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            source_table,
            target_table,
            key_columns: Vec::new(),
            exclude_columns: Vec::new(),
            batch_size: 10_000,
            buffer_batches: 2,
            normalizer: ValueNormalizer::default(),
            resolver: TypeCompatibilityResolver::default(),
            retry: RetryConfig::default(),
            progress_interval: 10_000,
            row_count_check: true,
        }
    }

    /// Build the job for one configured table.
    pub fn from_config(config: &Config, table: &TableConfig, run_id: &str) -> Result<Self> {
        let (source_table, target_table) = config.resolve_tables(table)?;
        let reconcile = &config.reconcile;

        let target_keys = if table.target_key_columns.is_empty() {
            &table.key_columns
        } else {
            &table.target_key_columns
        };
        let key_columns = table
            .key_columns
            .iter()
            .zip(target_keys)
            .map(|(s, t)| KeyMapping {
                source: s.clone(),
                target: t.clone(),
            })
            .collect();

        Ok(Self {
            run_id: run_id.to_string(),
            source_table,
            target_table,
            key_columns,
            exclude_columns: table.exclude_columns.clone(),
            batch_size: reconcile.get_batch_size(),
            buffer_batches: reconcile.get_buffer_batches(),
            normalizer: ValueNormalizer::from_config(reconcile),
            resolver: TypeCompatibilityResolver::with_rules(&reconcile.type_rules)?,
            retry: reconcile.retry,
            progress_interval: reconcile.get_progress_interval(),
            row_count_check: reconcile.row_count_check,
        })
    }

    pub fn with_key_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_columns = columns
            .into_iter()
            .map(|c| {
                let name = c.into();
                KeyMapping {
                    source: name.clone(),
                    target: name,
                }
            })
            .collect();
        self
    }

    pub fn with_key_mapping(mut self, mapping: Vec<KeyMapping>) -> Self {
        self.key_columns = mapping;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self.progress_interval = batch_size;
        self
    }

    pub fn with_progress_interval(mut self, rows: usize) -> Self {
        self.progress_interval = rows;
        self
    }

    pub fn with_normalizer(mut self, normalizer: ValueNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_exclude_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Pre-run checks that need no database.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ReconcileError::Config("batch size must be at least 1".into()));
        }
        if self.buffer_batches == 0 {
            return Err(ReconcileError::Config(
                "buffer depth must be at least 1".into(),
            ));
        }
        if let Some(k) = self.key_columns.iter().find(|k| {
            self.exclude_columns
                .iter()
                .any(|e| e.eq_ignore_ascii_case(&k.source))
        }) {
            return Err(ReconcileError::Config(format!(
                "key column '{}' cannot be excluded",
                k.source
            )));
        }
        Ok(())
    }
}

/// One differing column of a Mismatched row, with the raw values.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDiff {
    pub column: String,
    pub source: SqlValue<'static>,
    pub target: SqlValue<'static>,
}

/// Column values of a row present on one side only, in table order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowImage(pub Vec<(String, SqlValue<'static>)>);

/// Renders as `{Id: 3, Name: Cara}`.
impl fmt::Display for RowImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        f.write_str("}")
    }
}

/// Classification of one logical row.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Matched,
    Mismatched(Vec<ColumnDiff>),
    /// Carries the source row.
    MissingInTarget(RowImage),
    /// Carries the target row.
    MissingInSource(RowImage),
}

/// A classified row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowOutcome {
    pub key: CanonicalKey,
    pub kind: OutcomeKind,
}

/// Counters passed to the progress callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub rows_compared: u64,
    pub rows_matched: u64,
    pub rows_mismatched: u64,
    /// Missing on either side.
    pub rows_missing: u64,
    /// Larger of the two catalog row estimates, if known.
    pub estimated_total: Option<u64>,
}

/// Result of one table comparison.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationSummary {
    pub run_id: String,
    pub source_table: String,
    pub target_table: String,
    pub status: JobState,
    pub rows_compared: u64,
    pub rows_matched: u64,
    pub rows_mismatched: u64,
    pub rows_missing_in_target: u64,
    pub rows_missing_in_source: u64,
    /// Rows excluded because of a null key component.
    pub data_errors: u64,
    pub source_row_estimate: Option<i64>,
    pub target_row_estimate: Option<i64>,
    pub warnings: Vec<String>,
    pub failed_sinks: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
    /// True unless the run Completed.
    pub incomplete: bool,
}

impl ReconciliationSummary {
    pub fn rows_missing(&self) -> u64 {
        self.rows_missing_in_source + self.rows_missing_in_target
    }

    /// Completed with no differences and no data errors.
    pub fn is_clean(&self) -> bool {
        self.status == JobState::Completed
            && self.rows_mismatched == 0
            && self.rows_missing() == 0
            && self.data_errors == 0
    }

    pub fn duration_seconds(&self) -> f64 {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}
