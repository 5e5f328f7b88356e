//! Error types for the reconciliation library.

use thiserror::Error;

/// Process exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Process exit code for connection and fetch errors.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Process exit code when a reconciliation run ended in the Failed state.
pub const EXIT_RUN_FAILED: u8 = 3;
/// Process exit code when only report sinks failed.
pub const EXIT_SINK_ERROR: u8 = 4;
/// Process exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;
/// Process exit code after cancellation (SIGINT convention).
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for reconciliation operations.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Configuration error (invalid YAML, missing fields, bad job settings).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A table or key column does not exist on one side.
    #[error("Schema mismatch on {table}: {message}")]
    SchemaMismatch { table: String, message: String },

    /// Retryable fetch failure (dropped connection, timeout).
    #[error("Transient fetch error on {table}: {message}")]
    TransientFetch { table: String, message: String },

    /// Fetch failure after the retry ceiling, or a non-retryable one.
    #[error("Fetch failed for {table}: {message}")]
    FatalFetch { table: String, message: String },

    /// A row whose key has a null component.
    #[error("Null key component in {table}.{column}")]
    DataIntegrity { table: String, column: String },

    /// A report sink rejected a write.
    #[error("Sink {sink} write failed: {message}")]
    SinkWrite { sink: String, message: String },

    /// SQL Server driver error
    #[error("SQL Server error: {0}")]
    Mssql(#[from] tiberius::error::Error),

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV writer error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Reconciliation cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Create a SchemaMismatch error.
    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::SchemaMismatch {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a TransientFetch error.
    pub fn transient(table: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::TransientFetch {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a FatalFetch error.
    pub fn fatal(table: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::FatalFetch {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a SinkWrite error.
    pub fn sink(sink: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::SinkWrite {
            sink: sink.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Connection drops and IO timeouts are transient; SQL errors reported
    /// by the server (bad column, permission denied) are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::TransientFetch { .. } => true,
            ReconcileError::Io(_) => true,
            ReconcileError::Mssql(e) => matches!(e, tiberius::error::Error::Io { .. }),
            ReconcileError::Postgres(e) => {
                e.is_closed()
                    || std::error::Error::source(e).map_or(false, |s| s.is::<std::io::Error>())
                    || e.code().map_or(false, |c| is_transient_sqlstate(c.code()))
            }
            _ => false,
        }
    }

    /// Whether this error belongs to the pre-run configuration family.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ReconcileError::Config(_) | ReconcileError::SchemaMismatch { .. } | ReconcileError::Yaml(_)
        )
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ReconcileError::Config(_)
            | ReconcileError::SchemaMismatch { .. }
            | ReconcileError::Yaml(_)
            | ReconcileError::Json(_) => EXIT_CONFIG_ERROR,
            ReconcileError::TransientFetch { .. }
            | ReconcileError::FatalFetch { .. }
            | ReconcileError::DataIntegrity { .. }
            | ReconcileError::Mssql(_)
            | ReconcileError::Postgres(_) => EXIT_CONNECTION_ERROR,
            ReconcileError::SinkWrite { .. } | ReconcileError::Csv(_) => EXIT_SINK_ERROR,
            ReconcileError::Io(_) => EXIT_IO_ERROR,
            ReconcileError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Connection exceptions, operator intervention, resource exhaustion and
/// serialization failures.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || matches!(code, "57P01" | "57P02" | "57P03" | "53300" | "40001" | "40P01")
}

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;
