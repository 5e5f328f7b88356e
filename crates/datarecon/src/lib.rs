//! # datarecon
//!
//! Row-level data reconciliation between a source and a target table, which
//! may live in different database engines (SQL Server and PostgreSQL).
//!
//! For every logical row, identified by its primary or composite key, the
//! engine decides whether it exists on both sides with equal values, exists
//! with divergent values, or exists on one side only. Type-equivalent and
//! null-equivalent representations compare equal.
//!
//! - **Keyset paging** in key order on both sides, retried on transient errors
//! - **Ordered merge-join** with bounded buffers, never whole tables in memory
//! - **Data-driven type equivalence** between engine type systems
//! - **Report sinks** for CSV files and PostgreSQL tables
//! - **Cooperative cancellation** and progress callbacks
//!
//! ## Example
//!
//! ```rust,no_run
//! use datarecon::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> datarecon::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let result = Orchestrator::new(config).run(CancellationToken::new()).await?;
//!     println!("Compared {} rows", result.rows_compared);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod fetch;
pub mod normalize;
pub mod orchestrator;
pub mod reconcile;
pub mod report;
pub mod typemap;

// Re-exports for convenient access
pub use config::{Config, OutputMode, ReconcileConfig, RetryConfig};
pub use error::{ReconcileError, Result};
pub use fetch::{BatchFetcher, Cursor, Page};
pub use normalize::{CanonicalKey, ComparableValue, KeyNormalizer, ValueNormalizer};
pub use orchestrator::{HealthCheckResult, Orchestrator, RunResult};
pub use reconcile::{
    JobState, OutcomeKind, ProgressUpdate, ReconciliationJob, ReconciliationSummary, Reconciler,
    RowImage, RowOutcome,
};
pub use report::{CsvFileSink, MemorySink, MismatchReporter, PgTableSink, ReportSink};
pub use typemap::{TypeCompatibilityResolver, TypeEquivalenceRule};
