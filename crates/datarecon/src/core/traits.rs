//! Core traits for engine-agnostic row fetching.
//!
//! - [`RowSource`]: reads table metadata and key-ordered pages of rows
//! - [`Dialect`]: SQL syntax strategy used to build keyset page queries
//!
//! # Keyset pagination
//!
//! Pages are requested by "rows strictly after this key tuple", never by
//! offset, so concurrent inserts behind the cursor cannot shift rows between
//! pages. Tables keyed on every column may repeat a key; their scans resume
//! at the last key instead and skip the rows already seen. Both engines order keys the way [`CanonicalKey`] compares them:
//! binary collation for text, nulls first.
//!
//! [`CanonicalKey`]: crate::normalize::CanonicalKey

use async_trait::async_trait;

use crate::error::Result;

use super::schema::{ColumnSpec, TableName, TableSpec};
use super::value::{Row, SqlValue};

/// One page request against a table.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    /// Table metadata as returned by [`RowSource::describe`].
    pub table: &'a TableSpec,
    /// Positions of the key columns in `table.columns`, in key order.
    pub key_indices: &'a [usize],
    /// Raw key values of the last row already seen; `None` for the first page.
    pub after: Option<&'a [SqlValue<'static>]>,
    /// Also return rows whose key equals `after`.
    pub inclusive: bool,
    /// Maximum number of rows to return.
    pub limit: usize,
}

impl<'a> PageRequest<'a> {
    /// Key column metadata in key order.
    pub fn key_columns(&self) -> impl Iterator<Item = &'a ColumnSpec> + 'a {
        let table = self.table;
        self.key_indices.iter().map(move |&i| &table.columns[i])
    }
}

/// Read metadata and key-ordered pages from one database table.
///
/// A source owns a single connection and is driven by exactly one
/// [`BatchFetcher`](crate::fetch::BatchFetcher), so methods take `&mut self`.
#[async_trait]
pub trait RowSource: Send {
    /// Engine name ("mssql", "postgres", "memory").
    fn db_type(&self) -> &str;

    /// Load column metadata and the primary key. `Ok(None)` if the table
    /// does not exist.
    async fn describe(&mut self, table: &TableName) -> Result<Option<TableSpec>>;

    /// Fetch up to `request.limit` rows ordered by the key columns, starting
    /// strictly after `request.after` (at it, when `request.inclusive`). Values come back in `table.columns`
    /// order.
    async fn fetch_page(&mut self, request: &PageRequest<'_>) -> Result<Vec<Row>>;

    /// Approximate row count from catalog statistics, if the engine has one.
    async fn row_count(&mut self, _table: &TableName) -> Result<Option<i64>> {
        Ok(None)
    }

    /// Round-trip a trivial query.
    async fn ping(&mut self) -> Result<()>;

    /// Drop and re-establish the connection after a transient failure.
    async fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the connection.
    async fn close(&mut self) {}
}

/// SQL syntax strategy for a database engine.
pub trait Dialect: Send + Sync {
    /// Dialect name.
    fn name(&self) -> &str;

    /// Quote an identifier.
    fn quote_ident(&self, name: &str) -> Result<String>;

    /// Quote a schema-qualified table name.
    fn qualify(&self, table: &TableName) -> Result<String> {
        Ok(format!(
            "{}.{}",
            self.quote_ident(&table.schema)?,
            self.quote_ident(&table.name)?
        ))
    }

    /// Select-list expression for a column. Types the driver cannot decode
    /// natively are cast to text here.
    fn select_expr(&self, column: &ColumnSpec) -> Result<String>;

    /// Expression a key column is ordered and compared by.
    fn order_expr(&self, column: &ColumnSpec) -> Result<String>;

    /// Render a key value as a literal comparable with [`Dialect::order_expr`].
    fn literal(&self, value: &SqlValue<'_>, column: &ColumnSpec) -> Result<String>;

    /// Appended to each ORDER BY term so nulls sort first.
    fn nulls_first(&self) -> &str {
        ""
    }

    /// Assemble a row-limited SELECT.
    fn limit_select(
        &self,
        columns: &str,
        from: &str,
        filter: Option<&str>,
        order_by: &str,
        limit: usize,
    ) -> String;

    /// Lexicographic "greater than the last key" predicate.
    ///
    /// `(k1, k2) > (v1, v2)` expands to `k1 > v1 OR (k1 = v1 AND k2 > v2)`.
    /// A null last value compares as the smallest value: equality becomes
    /// `IS NULL` and greater-than becomes `IS NOT NULL`. With `inclusive`
    /// the last comparison is `>=`.
    fn build_keyset_where(
        &self,
        key_columns: &[&ColumnSpec],
        after: &[SqlValue<'_>],
        inclusive: bool,
    ) -> Result<String> {
        let mut exprs = Vec::with_capacity(key_columns.len());
        for col in key_columns {
            exprs.push(self.order_expr(col)?);
        }

        let mut branches = Vec::with_capacity(key_columns.len());
        for i in 0..key_columns.len() {
            let mut terms = Vec::with_capacity(i + 1);
            for j in 0..i {
                terms.push(match &after[j] {
                    SqlValue::Null => format!("{} IS NULL", exprs[j]),
                    value => format!("{} = {}", exprs[j], self.literal(value, key_columns[j])?),
                });
            }
            let last = i + 1 == key_columns.len();
            match &after[i] {
                // Every value is >= NULL
                SqlValue::Null if inclusive && last => {}
                SqlValue::Null => terms.push(format!("{} IS NOT NULL", exprs[i])),
                value => {
                    let op = if inclusive && last { ">=" } else { ">" };
                    let literal = self.literal(value, key_columns[i])?;
                    terms.push(format!("{} {} {}", exprs[i], op, literal));
                }
            }
            if terms.is_empty() {
                branches.push("1 = 1".to_string());
            } else if terms.len() == 1 {
                branches.push(terms.remove(0));
            } else {
                branches.push(format!("({})", terms.join(" AND ")));
            }
        }
        Ok(branches.join(" OR "))
    }

    /// Build the SELECT for one page of a keyset scan.
    fn build_page_query(&self, request: &PageRequest<'_>) -> Result<String> {
        let key_columns: Vec<&ColumnSpec> = request.key_columns().collect();

        let mut select = Vec::with_capacity(request.table.columns.len());
        for col in &request.table.columns {
            select.push(self.select_expr(col)?);
        }

        let mut order_by = Vec::with_capacity(key_columns.len());
        for col in &key_columns {
            order_by.push(format!("{}{}", self.order_expr(col)?, self.nulls_first()));
        }

        let filter = match request.after {
            Some(after) => Some(self.build_keyset_where(&key_columns, after, request.inclusive)?),
            None => None,
        };

        Ok(self.limit_select(
            &select.join(", "),
            &self.qualify(&request.table.name)?,
            filter.as_deref(),
            &order_by.join(", "),
            request.limit,
        ))
    }
}
