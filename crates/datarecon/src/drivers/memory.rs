//! In-memory row source.
//!
//! Serves tables held in memory with the same keyset semantics as the SQL
//! drivers: rows come back ordered by their normalized key, nulls first,
//! after (or, for inclusive requests, at) the requested key. Rows with equal
//! keys keep their insertion order. Failures can be scripted to exercise
//! retry and failure handling without a database.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::core::{PageRequest, Row, RowSource, SqlValue, TableName, TableSpec};
use crate::error::{ReconcileError, Result};
use crate::normalize::{ComparableValue, ValueNormalizer};

#[derive(Debug, Clone)]
struct MemoryTable {
    spec: TableSpec,
    rows: Vec<Row>,
}

/// Row source over in-memory tables.
///
/// ```rust
/// use datarecon::core::{ColumnSpec, Row, SqlValue, TableName, TableSpec, TypeClass};
/// use datarecon::drivers::MemorySource;
///
/// let spec = TableSpec::new(
///     TableName::new("dbo", "t"),
///     vec![ColumnSpec::new("id", "int", TypeClass::Integer)],
/// )
/// .with_primary_key(["id"]);
/// let source = MemorySource::new().with_table(spec, vec![Row::new(vec![SqlValue::I32(1)])]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    tables: HashMap<String, MemoryTable>,
    transient_failures: u32,
    fail_after_pages: Option<u64>,
    pages_served: u64,
    reconnects: u32,
}

fn table_key(table: &TableName) -> String {
    table.full_name().to_lowercase()
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table. Rows may be in any order.
    pub fn with_table(mut self, spec: TableSpec, rows: Vec<Row>) -> Self {
        self.tables
            .insert(table_key(&spec.name), MemoryTable { spec, rows });
        self
    }

    /// Fail the next `count` page fetches with a transient error.
    pub fn fail_transiently(mut self, count: u32) -> Self {
        self.transient_failures = count;
        self
    }

    /// Serve `pages` pages, then fail every fetch with a non-transient error.
    pub fn fail_after_pages(mut self, pages: u64) -> Self {
        self.fail_after_pages = Some(pages);
        self
    }

    /// Number of reconnects requested so far.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    fn sort_key(
        normalizer: &ValueNormalizer,
        request: &PageRequest<'_>,
        values: &[&SqlValue<'_>],
    ) -> Vec<ComparableValue> {
        request
            .key_columns()
            .zip(values)
            .map(|(col, value)| normalizer.normalize(value, col.class))
            .collect()
    }
}

#[async_trait]
impl RowSource for MemorySource {
    fn db_type(&self) -> &str {
        "memory"
    }

    async fn describe(&mut self, table: &TableName) -> Result<Option<TableSpec>> {
        Ok(self.tables.get(&table_key(table)).map(|t| t.spec.clone()))
    }

    async fn fetch_page(&mut self, request: &PageRequest<'_>) -> Result<Vec<Row>> {
        let table = request.table.full_name();
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(ReconcileError::transient(table, "connection reset by peer"));
        }
        if let Some(limit) = self.fail_after_pages {
            if self.pages_served >= limit {
                return Err(ReconcileError::fatal(table, "relation is no longer readable"));
            }
        }

        let data = self
            .tables
            .get(&table_key(&request.table.name))
            .ok_or_else(|| ReconcileError::fatal(&table, "table disappeared"))?;

        let normalizer = ValueNormalizer::default().for_keys();
        let after = request.after.map(|after| {
            let values: Vec<&SqlValue<'_>> = after.iter().collect();
            Self::sort_key(&normalizer, request, &values)
        });

        let mut keyed: Vec<(Vec<ComparableValue>, &Row)> = data
            .rows
            .iter()
            .map(|row| {
                let values: Vec<&SqlValue<'_>> =
                    request.key_indices.iter().map(|&i| row.get(i)).collect();
                (Self::sort_key(&normalizer, request, &values), row)
            })
            .filter(|(key, _)| {
                after.as_ref().map_or(true, |after| {
                    key > after || (request.inclusive && key == after)
                })
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        self.pages_served += 1;
        Ok(keyed
            .into_iter()
            .take(request.limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn row_count(&mut self, table: &TableName) -> Result<Option<i64>> {
        Ok(self
            .tables
            .get(&table_key(table))
            .map(|t| t.rows.len() as i64))
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.reconnects += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ColumnSpec, TypeClass};

    fn spec() -> TableSpec {
        TableSpec::new(
            TableName::new("dbo", "t"),
            vec![
                ColumnSpec::new("id", "int", TypeClass::Integer),
                ColumnSpec::new("v", "varchar", TypeClass::Text),
            ],
        )
    }

    #[tokio::test]
    async fn test_nulls_sort_first_and_after_is_exclusive() {
        let rows = vec![
            Row::new(vec![SqlValue::I32(2), "b".into()]),
            Row::new(vec![SqlValue::Null, "n".into()]),
            Row::new(vec![SqlValue::I32(1), "a".into()]),
        ];
        let mut source = MemorySource::new().with_table(spec(), rows);
        let spec = spec();
        let keys = [0];

        let first = source
            .fetch_page(&PageRequest {
                table: &spec,
                key_indices: &keys,
                after: None,
                inclusive: false,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(first[0].get(0), &SqlValue::Null);
        assert_eq!(first[2].get(0), &SqlValue::I32(2));

        let after = [SqlValue::I32(1)];
        let rest = source
            .fetch_page(&PageRequest {
                table: &spec,
                key_indices: &keys,
                after: Some(&after),
                inclusive: false,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].get(0), &SqlValue::I32(2));
    }

    #[tokio::test]
    async fn test_describe_is_case_insensitive() {
        let mut source = MemorySource::new().with_table(spec(), vec![]);
        assert!(source
            .describe(&TableName::new("DBO", "T"))
            .await
            .unwrap()
            .is_some());
        assert!(source
            .describe(&TableName::new("dbo", "other"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_inclusive_request_repeats_the_last_key() {
        let rows = vec![
            Row::new(vec![SqlValue::I32(1), "a".into()]),
            Row::new(vec![SqlValue::I32(2), "b".into()]),
            Row::new(vec![SqlValue::I32(2), "c".into()]),
            Row::new(vec![SqlValue::I32(3), "d".into()]),
        ];
        let mut source = MemorySource::new().with_table(spec(), rows);
        let spec = spec();
        let after = [SqlValue::I32(2)];

        let page = source
            .fetch_page(&PageRequest {
                table: &spec,
                key_indices: &[0],
                after: Some(&after),
                inclusive: true,
                limit: 10,
            })
            .await
            .unwrap();
        let names: Vec<String> = page.iter().map(|r| r.get(1).to_string()).collect();
        assert_eq!(names, vec!["b", "c", "d"]);
    }
}
