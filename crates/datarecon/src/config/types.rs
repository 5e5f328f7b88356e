//! Configuration type definitions with auto-tuning based on system resources.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::typemap::TypeEquivalenceRule;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database connection.
    pub source: ConnectionConfig,

    /// Target database connection.
    pub target: ConnectionConfig,

    /// Tables to reconcile.
    #[serde(default)]
    pub tables: Vec<TableConfig>,

    /// Source schema → target schema mapping for tables without an explicit target.
    #[serde(default)]
    pub schema_map: Vec<SchemaMapping>,

    /// Comparison behavior.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Where mismatch details and summaries go.
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.reconcile = self.reconcile.with_auto_tuning(&resources);
        self
    }
}

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseType {
    Mssql,
    Postgres,
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseType::Mssql => f.write_str("mssql"),
            DatabaseType::Postgres => f.write_str("postgres"),
        }
    }
}

/// Connection settings for one side.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database engine.
    pub r#type: DatabaseType,

    /// Database host.
    pub host: String,

    /// Database port (default: 1433 for mssql, 5432 for postgres).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Default schema for unqualified table names (default: dbo / public).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Encrypt the TDS connection (mssql only, default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust the server certificate without validation (mssql only).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// SSL mode (postgres only, default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl ConnectionConfig {
    /// Effective port.
    pub fn get_port(&self) -> u16 {
        self.port.unwrap_or(match self.r#type {
            DatabaseType::Mssql => 1433,
            DatabaseType::Postgres => 5432,
        })
    }

    /// Effective default schema.
    pub fn get_schema(&self) -> &str {
        match (&self.schema, self.r#type) {
            (Some(schema), _) => schema,
            (None, DatabaseType::Mssql) => "dbo",
            (None, DatabaseType::Postgres) => "public",
        }
    }

    /// `host:port/database` for log lines.
    pub fn display_target(&self) -> String {
        format!("{}:{}/{}", self.host, self.get_port(), self.database)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// One table pair to reconcile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Source table, `schema.table` or bare `table`.
    pub source: String,

    /// Target table; derived from `source` and `schema_map` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Source key columns in key order (default: source primary key).
    #[serde(default)]
    pub key_columns: Vec<String>,

    /// Target key columns, positionally paired with `key_columns`
    /// (default: same names).
    #[serde(default)]
    pub target_key_columns: Vec<String>,

    /// Columns left out of value comparison.
    #[serde(default)]
    pub exclude_columns: Vec<String>,
}

/// Source schema → target schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMapping {
    pub source: String,
    pub target: String,
}

/// Comparison behavior configuration.
/// Performance fields use Option<T> to distinguish "not set" (auto-tuned)
/// from "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReconcileConfig {
    /// Rows per fetched page. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Pages buffered per side between fetcher and merge. Auto-tuned if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_batches: Option<usize>,

    /// Compare text case-insensitively (never applied to key columns).
    #[serde(default)]
    pub case_insensitive: bool,

    /// Extra text values treated as NULL (compared case-insensitively).
    #[serde(default)]
    pub null_markers: Vec<String>,

    /// Numeric canonicalization.
    #[serde(default)]
    pub numeric: NumericConfig,

    /// Datetime canonicalization.
    #[serde(default)]
    pub datetime: DateTimeConfig,

    /// Retry policy for page fetches and sink writes.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Rows between progress callbacks (default: batch size).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_interval: Option<usize>,

    /// Additional type aliases and class equivalences.
    #[serde(default)]
    pub type_rules: Vec<TypeEquivalenceRule>,

    /// Compare estimated row counts before reconciling (default: true).
    #[serde(default = "default_true")]
    pub row_count_check: bool,
}

impl ReconcileConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;

        // Batch size: 10K base, +10K per 8GB of RAM, cap at 50K
        if self.batch_size.is_none() {
            let batch = 10_000 + ((ram_gb / 8.0) as usize * 10_000);
            self.batch_size = Some(batch.clamp(10_000, 50_000));
        }

        // Buffer depth: 2 pages, up to 4 with more RAM
        if self.buffer_batches.is_none() {
            let buffers = ((ram_gb / 16.0) as usize).clamp(2, 4);
            self.buffer_batches = Some(buffers);
        }

        info!(
            "Auto-tuned config: batch_size={}, buffer_batches={}",
            self.get_batch_size(),
            self.get_buffer_batches(),
        );

        self
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(10_000)
    }

    pub fn get_buffer_batches(&self) -> usize {
        self.buffer_batches.unwrap_or(2)
    }

    pub fn get_progress_interval(&self) -> usize {
        self.progress_interval
            .unwrap_or_else(|| self.get_batch_size())
            .max(1)
    }
}

/// Numeric canonicalization: values are rounded to `scale` fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericConfig {
    #[serde(default = "default_numeric_scale")]
    pub scale: u32,

    #[serde(default)]
    pub rounding: RoundingMode,
}

impl Default for NumericConfig {
    fn default() -> Self {
        Self {
            scale: default_numeric_scale(),
            rounding: RoundingMode::default(),
        }
    }
}

/// Rounding applied to numbers with more fractional digits than `scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Banker's rounding.
    #[default]
    HalfEven,
    HalfAwayFromZero,
    Truncate,
}

/// Datetime canonicalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateTimeConfig {
    #[serde(default)]
    pub precision: DateTimePrecision,

    #[serde(default)]
    pub mode: DateTimeMode,
}

/// Finest time unit kept after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateTimePrecision {
    Seconds,
    #[default]
    Milliseconds,
    Microseconds,
}

/// How sub-precision digits are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateTimeMode {
    #[default]
    Truncate,
    Round,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms.max(self.base_delay_ms)))
    }
}

/// Output sink selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// CSV detail files plus JSON summaries.
    #[default]
    File,
    /// Summary and detail tables in the target PostgreSQL database.
    Table,
    /// Both sinks.
    Both,
}

impl OutputMode {
    pub fn uses_file(&self) -> bool {
        matches!(self, OutputMode::File | OutputMode::Both)
    }

    pub fn uses_table(&self) -> bool {
        matches!(self, OutputMode::Table | OutputMode::Both)
    }
}

/// Report output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub mode: OutputMode,

    /// Root directory for file output.
    #[serde(default = "default_output_path")]
    pub path: PathBuf,

    /// Detail records buffered before a flush.
    #[serde(default = "default_detail_window")]
    pub detail_window: usize,

    /// Schema holding the summary and detail tables.
    #[serde(default = "default_public_schema")]
    pub table_schema: String,

    #[serde(default = "default_summary_table")]
    pub summary_table: String,

    #[serde(default = "default_details_table")]
    pub details_table: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            mode: OutputMode::default(),
            path: default_output_path(),
            detail_window: default_detail_window(),
            table_schema: default_public_schema(),
            summary_table: default_summary_table(),
            details_table: default_details_table(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_require() -> String {
    "require".to_string()
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_numeric_scale() -> u32 {
    6
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_output_path() -> PathBuf {
    PathBuf::from("./reconcile-output")
}

fn default_detail_window() -> usize {
    1_000
}

fn default_summary_table() -> String {
    "reconcile_summary".to_string()
}

fn default_details_table() -> String {
    "reconcile_details".to_string()
}
