//! PostgreSQL table sink.
//!
//! Keeps one row per compared table in `<schema>.<summary_table>` and one row
//! per detail record in `<schema>.<details_table>`, linked by `run_id`. Both
//! tables are created on first use.

use async_trait::async_trait;
use tokio_postgres::Client;
use tracing::debug;

use super::{DetailRecord, ReportSink, RunInfo};
use crate::config::{ConnectionConfig, OutputConfig};
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::drivers::postgres::connect;
use crate::error::{ReconcileError, Result};
use crate::reconcile::ReconciliationSummary;

/// Writes reports into PostgreSQL tables.
pub struct PgTableSink {
    connection: ConnectionConfig,
    schema: String,
    summary_table: String,
    details_table: String,
    client: Option<Client>,
}

impl PgTableSink {
    /// Validate the table names; no connection is made until `begin`.
    pub fn new(connection: ConnectionConfig, output: &OutputConfig) -> Result<Self> {
        Ok(Self {
            connection,
            schema: quote_pg(&output.table_schema)?,
            summary_table: qualify_pg(&output.table_schema, &output.summary_table)?,
            details_table: qualify_pg(&output.table_schema, &output.details_table)?,
            client: None,
        })
    }

    fn ddl(&self) -> Vec<String> {
        vec![
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    run_id TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    target_table TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'cancelled', 'failed')),
                    rows_compared BIGINT NOT NULL DEFAULT 0,
                    matched BIGINT NOT NULL DEFAULT 0,
                    mismatched BIGINT NOT NULL DEFAULT 0,
                    missing_in_target BIGINT NOT NULL DEFAULT 0,
                    missing_in_source BIGINT NOT NULL DEFAULT 0,
                    data_errors BIGINT NOT NULL DEFAULT 0,
                    incomplete BOOLEAN NOT NULL DEFAULT TRUE,
                    started_at TIMESTAMPTZ NOT NULL,
                    completed_at TIMESTAMPTZ,
                    failure TEXT,
                    failed_sinks TEXT[] NOT NULL DEFAULT '{{}}',
                    warnings TEXT[] NOT NULL DEFAULT '{{}}',
                    PRIMARY KEY (run_id, table_name)
                )",
                self.summary_table
            ),
            // Summary tables created before these columns existed
            format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS failed_sinks TEXT[] NOT NULL DEFAULT '{{}}'",
                self.summary_table
            ),
            format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS warnings TEXT[] NOT NULL DEFAULT '{{}}'",
                self.summary_table
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    key TEXT NOT NULL,
                    column_name TEXT,
                    source_value TEXT,
                    target_value TEXT,
                    status TEXT NOT NULL,
                    recorded_at TIMESTAMPTZ NOT NULL
                )",
                self.details_table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_reconcile_details_run
                    ON {}(run_id, table_name)",
                self.details_table
            ),
        ]
    }

    fn summary_update(&self) -> String {
        format!(
            "UPDATE {} SET
                status = $3,
                rows_compared = $4,
                matched = $5,
                mismatched = $6,
                missing_in_target = $7,
                missing_in_source = $8,
                data_errors = $9,
                incomplete = $10,
                completed_at = $11,
                failure = $12,
                failed_sinks = $13,
                warnings = $14
             WHERE run_id = $1 AND table_name = $2",
            self.summary_table
        )
    }

    /// Connect, or reconnect after the previous connection dropped.
    async fn client(&mut self) -> Result<&mut Client> {
        let stale = self.client.as_ref().map_or(true, |c| c.is_closed());
        if stale {
            debug!("table sink connecting to {}", self.connection.display_target());
            self.client = Some(connect(&self.connection).await?);
        }
        self.client
            .as_mut()
            .ok_or_else(|| ReconcileError::sink("table", "no connection"))
    }
}

#[async_trait]
impl ReportSink for PgTableSink {
    fn name(&self) -> &str {
        "table"
    }

    async fn begin(&mut self, run: &RunInfo) -> Result<()> {
        let statements = self.ddl();
        let insert = format!(
            "INSERT INTO {} (run_id, table_name, target_table, status, started_at)
             VALUES ($1, $2, $3, 'running', $4)
             ON CONFLICT (run_id, table_name) DO UPDATE SET
                status = 'running',
                started_at = EXCLUDED.started_at,
                completed_at = NULL,
                failure = NULL,
                failed_sinks = '{{}}',
                warnings = '{{}}'",
            self.summary_table
        );

        let client = self.client().await?;
        for sql in &statements {
            client.execute(sql.as_str(), &[]).await?;
        }
        client
            .execute(
                insert.as_str(),
                &[&run.run_id, &run.source_table, &run.target_table, &run.started_at],
            )
            .await?;
        Ok(())
    }

    async fn write(&mut self, records: &[DetailRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {}
             (run_id, table_name, key, column_name, source_value, target_value, status, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.details_table
        );

        let client = self.client().await?;
        let tx = client.transaction().await?;
        let stmt = tx.prepare(&sql).await?;
        for r in records {
            tx.execute(
                &stmt,
                &[
                    &r.run_id,
                    &r.table_name,
                    &r.key,
                    &r.column,
                    &r.source_value,
                    &r.target_value,
                    &r.status.as_str(),
                    &r.recorded_at,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        debug!("table sink wrote {} detail rows", records.len());
        Ok(())
    }

    async fn write_summary(&mut self, summary: &ReconciliationSummary) -> Result<()> {
        let sql = self.summary_update();

        let client = self.client().await?;
        let updated = client
            .execute(
                sql.as_str(),
                &[
                    &summary.run_id,
                    &summary.source_table,
                    &summary.status.as_str(),
                    &(summary.rows_compared as i64),
                    &(summary.rows_matched as i64),
                    &(summary.rows_mismatched as i64),
                    &(summary.rows_missing_in_target as i64),
                    &(summary.rows_missing_in_source as i64),
                    &(summary.data_errors as i64),
                    &summary.incomplete,
                    &summary.completed_at,
                    &summary.failure,
                    &summary.failed_sinks,
                    &summary.warnings,
                ],
            )
            .await?;

        if updated == 0 {
            return Err(ReconcileError::sink(
                "table",
                format!("no summary row for run {}", summary.run_id),
            ));
        }
        Ok(())
    }
}
