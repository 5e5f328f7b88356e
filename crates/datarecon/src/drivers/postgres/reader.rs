//! PostgreSQL row source.

use std::borrow::Cow;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use tokio_postgres::Client;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{connect, PostgresDialect};
use crate::config::ConnectionConfig;
use crate::core::{
    ColumnSpec, Dialect, PageRequest, Row, RowSource, SqlValue, TableName, TableSpec, TypeClass,
};
use crate::error::{ReconcileError, Result};

/// Reads key-ordered pages from one PostgreSQL connection.
pub struct PostgresReader {
    config: ConnectionConfig,
    client: Option<Client>,
    dialect: PostgresDialect,
}

impl PostgresReader {
    /// Connect and verify the connection.
    pub async fn new(config: &ConnectionConfig) -> Result<Self> {
        let client = connect(config).await?;
        client.simple_query("SELECT 1").await?;
        debug!("connected to PostgreSQL at {}", config.display_target());
        Ok(Self {
            config: config.clone(),
            client: Some(client),
            dialect: PostgresDialect::new(),
        })
    }

    fn client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or_else(|| {
            ReconcileError::transient(self.config.display_target(), "connection is closed")
        })
    }

    async fn load_columns(&self, table: &TableName) -> Result<Vec<ColumnSpec>> {
        let query = r#"
            SELECT column_name, udt_name, is_nullable = 'YES'
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
        "#;

        let rows = self
            .client()?
            .query(query, &[&table.schema, &table.name])
            .await?;

        rows.iter()
            .map(|row| -> Result<ColumnSpec> {
                let mut col = ColumnSpec::new(
                    row.try_get::<_, String>(0)?,
                    row.try_get::<_, String>(1)?,
                    TypeClass::Unknown,
                );
                col.is_nullable = row.try_get::<_, bool>(2)?;
                Ok(col)
            })
            .collect()
    }

    async fn load_primary_key(&self, table: &TableName) -> Result<Vec<String>> {
        let query = r#"
            SELECT a.attname::text
            FROM pg_catalog.pg_constraint c
            JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid
            WHERE n.nspname = $1
              AND t.relname = $2
              AND c.contype = 'p'
              AND a.attnum = ANY(c.conkey)
            ORDER BY array_position(c.conkey, a.attnum)
        "#;

        let rows = self
            .client()?
            .query(query, &[&table.schema, &table.name])
            .await?;
        rows.iter()
            .map(|row| -> Result<String> { Ok(row.try_get(0)?) })
            .collect()
    }
}

#[async_trait]
impl RowSource for PostgresReader {
    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn describe(&mut self, table: &TableName) -> Result<Option<TableSpec>> {
        let columns = self.load_columns(table).await?;
        if columns.is_empty() {
            return Ok(None);
        }
        let primary_key = self.load_primary_key(table).await?;
        debug!(
            "{}: {} columns, primary key {:?}",
            table,
            columns.len(),
            primary_key
        );
        Ok(Some(
            TableSpec::new(table.clone(), columns).with_primary_key(primary_key),
        ))
    }

    async fn fetch_page(&mut self, request: &PageRequest<'_>) -> Result<Vec<Row>> {
        let sql = self.dialect.build_page_query(request)?;
        let rows = self.client()?.query(sql.as_str(), &[]).await?;

        let columns = &request.table.columns;
        rows.iter()
            .map(|row| -> Result<Row> {
                let mut values = Vec::with_capacity(columns.len());
                for (idx, col) in columns.iter().enumerate() {
                    values.push(convert_pg_row_value(row, idx, &col.data_type)?);
                }
                Ok(Row::new(values))
            })
            .collect()
    }

    async fn row_count(&mut self, table: &TableName) -> Result<Option<i64>> {
        let query = r#"
            SELECT c.reltuples::int8
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2
        "#;
        let row = self
            .client()?
            .query_opt(query, &[&table.schema, &table.name])
            .await?;
        // reltuples is -1 for tables never vacuumed or analyzed
        Ok(row
            .map(|r| r.try_get::<_, i64>(0))
            .transpose()?
            .filter(|n| *n >= 0))
    }

    async fn ping(&mut self) -> Result<()> {
        self.client()?.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.client = None;
        let client = connect(&self.config).await?;
        self.client = Some(client);
        debug!("reconnected to PostgreSQL at {}", self.config.display_target());
        Ok(())
    }

    async fn close(&mut self) {
        if self.client.take().is_none() {
            warn!("PostgreSQL connection already closed");
        }
    }
}

/// Decode column `idx` by its udt name. Columns the dialect selected as
/// `::text` come back as text.
fn convert_pg_row_value(
    row: &tokio_postgres::Row,
    idx: usize,
    data_type: &str,
) -> Result<SqlValue<'static>> {
    let value: SqlValue<'static> = match data_type.to_lowercase().as_str() {
        "bool" => row.try_get::<_, Option<bool>>(idx)?.into(),
        "int2" => row.try_get::<_, Option<i16>>(idx)?.into(),
        "int4" => row.try_get::<_, Option<i32>>(idx)?.into(),
        "int8" => row.try_get::<_, Option<i64>>(idx)?.into(),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)?
            .map_or(SqlValue::Null, SqlValue::F32),
        "float8" => row.try_get::<_, Option<f64>>(idx)?.into(),
        "uuid" => row.try_get::<_, Option<Uuid>>(idx)?.into(),
        "timestamp" => row.try_get::<_, Option<NaiveDateTime>>(idx)?.into(),
        "timestamptz" => row.try_get::<_, Option<DateTime<FixedOffset>>>(idx)?.into(),
        "date" => row.try_get::<_, Option<NaiveDate>>(idx)?.into(),
        "time" => row.try_get::<_, Option<NaiveTime>>(idx)?.into(),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map_or(SqlValue::Null, |b| SqlValue::Bytes(Cow::Owned(b))),
        _ => row.try_get::<_, Option<String>>(idx)?.into(),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_types_are_cast_to_text() {
        assert!(PostgresDialect::is_native("int4"));
        assert!(PostgresDialect::is_native("TIMESTAMPTZ"));
        assert!(!PostgresDialect::is_native("jsonb"));
        assert!(!PostgresDialect::is_native("interval"));
        // NaN and Infinity have no Decimal
        assert!(!PostgresDialect::is_native("numeric"));
    }
}
