//! Key-ordered batch fetching.
//!
//! [`BatchFetcher`] turns a [`RowSource`] into a stream of [`Page`]s for one
//! table. It owns retry: transient errors are retried with exponential
//! backoff and a reconnect in between; once the retry ceiling is hit, or on
//! any non-transient error, the failure escalates to
//! [`ReconcileError::FatalFetch`].
//!
//! [`spawn_producer`] runs a fetcher on its own task and feeds a bounded
//! channel, so fetching one side overlaps with fetching the other and with
//! the merge.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::core::{PageRequest, Row, RowSource, SqlValue, TableName, TableSpec};
use crate::error::{ReconcileError, Result};
use crate::normalize::{ComparableValue, ValueNormalizer};
use crate::typemap::TypeCompatibilityResolver;

/// One page of rows in key order.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub rows: Vec<Row>,
    /// False on the last page of the table.
    pub has_more: bool,
}

/// Position of a keyset scan over one table.
#[derive(Debug, Clone)]
pub struct Cursor {
    table: TableSpec,
    key_indices: Vec<usize>,
    batch_size: usize,
    last_key: Option<Vec<SqlValue<'static>>>,
    /// Keys may repeat; pages resume at `last_key` and skip `repeats` rows.
    duplicate_keys: bool,
    repeats: usize,
    exhausted: bool,
    pages: u64,
    rows: u64,
}

impl Cursor {
    /// Position a cursor before the first row of `table`.
    ///
    /// Key columns default to the primary key when `key_columns` is empty.
    /// Fails with [`ReconcileError::SchemaMismatch`] if a key column does
    /// not exist.
    pub fn new(table: TableSpec, key_columns: &[String], batch_size: usize) -> Result<Self> {
        let key_indices = if key_columns.is_empty() {
            table.key_indices(&table.primary_key)?
        } else {
            table.key_indices(key_columns)?
        };

        debug!(
            "{}: opened cursor on {} columns, key ({}), batch size {}",
            table.full_name(),
            table.columns.len(),
            key_indices
                .iter()
                .map(|&i| table.columns[i].name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            batch_size
        );

        Ok(Self {
            table,
            key_indices,
            batch_size: batch_size.max(1),
            last_key: None,
            duplicate_keys: false,
            repeats: 0,
            exhausted: false,
            pages: 0,
            rows: 0,
        })
    }

    /// Allow several rows to share a key.
    pub fn with_duplicate_keys(mut self) -> Self {
        self.duplicate_keys = true;
        self
    }

    /// Table metadata, with type classes resolved.
    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    /// Positions of the key columns in fetched rows.
    pub fn key_indices(&self) -> &[usize] {
        &self.key_indices
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Rows fetched so far.
    pub fn rows_fetched(&self) -> u64 {
        self.rows
    }

    /// Key as the database compares it, for counting repeats.
    fn comparable_key<'v>(
        &self,
        values: impl Iterator<Item = &'v SqlValue<'static>>,
    ) -> Vec<ComparableValue> {
        let normalizer = ValueNormalizer::default().for_keys();
        self.key_indices
            .iter()
            .zip(values)
            .map(|(&i, value)| normalizer.normalize(value, self.table.columns[i].class))
            .collect()
    }

    fn comparable_row_key(&self, row: &Row) -> Vec<ComparableValue> {
        self.comparable_key(self.key_indices.iter().map(|&i| row.get(i)))
    }
}

/// Fetches one table in key order, page by page.
pub struct BatchFetcher {
    source: Box<dyn RowSource>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl BatchFetcher {
    pub fn new(source: Box<dyn RowSource>, retry: RetryConfig) -> Self {
        Self {
            source,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort backoff sleeps when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Engine name of the underlying source.
    pub fn db_type(&self) -> &str {
        self.source.db_type()
    }

    /// Describe `table` with column type classes resolved through
    /// `resolver`. Fails with [`ReconcileError::SchemaMismatch`] if the table
    /// does not exist.
    pub async fn describe(
        &mut self,
        table: &TableName,
        resolver: &TypeCompatibilityResolver,
    ) -> Result<TableSpec> {
        let mut spec = self
            .describe_with_retry(table)
            .await?
            .ok_or_else(|| ReconcileError::schema(table.full_name(), "table does not exist"))?;

        for col in &mut spec.columns {
            col.class = resolver.resolve(&col.data_type);
        }
        Ok(spec)
    }

    /// Describe `table` and position a cursor before its first row.
    ///
    /// See [`BatchFetcher::describe`] and [`Cursor::new`].
    pub async fn open(
        &mut self,
        table: &TableName,
        key_columns: &[String],
        batch_size: usize,
        resolver: &TypeCompatibilityResolver,
    ) -> Result<Cursor> {
        let spec = self.describe(table, resolver).await?;
        Cursor::new(spec, key_columns, batch_size)
    }

    /// Approximate row count of the cursor's table, `None` if unknown.
    ///
    /// Errors are logged and reported as unknown; the count only feeds
    /// warnings and progress estimates.
    pub async fn row_count(&mut self, cursor: &Cursor) -> Option<i64> {
        match self.source.row_count(&cursor.table.name).await {
            Ok(count) => count,
            Err(e) => {
                warn!("{}: row count unavailable: {}", cursor.table.full_name(), e);
                None
            }
        }
    }

    /// Fetch the next page. After the last page, returns empty pages.
    pub async fn next(&mut self, cursor: &mut Cursor) -> Result<Page> {
        if cursor.exhausted {
            return Ok(Page::default());
        }

        // Rows at the last key were already delivered
        let skip = match cursor.last_key {
            Some(_) if cursor.duplicate_keys => cursor.repeats,
            _ => 0,
        };
        let request = PageRequest {
            table: &cursor.table,
            key_indices: &cursor.key_indices,
            after: cursor.last_key.as_deref(),
            inclusive: skip > 0,
            limit: cursor.batch_size + skip,
        };
        let mut rows = self.fetch_with_retry(&request).await?;

        let has_more = rows.len() >= request.limit;
        rows.drain(..skip.min(rows.len()));

        if let Some(last) = rows.last() {
            let key: Vec<SqlValue<'static>> = cursor
                .key_indices
                .iter()
                .map(|&i| last.get(i).clone())
                .collect();
            if cursor.duplicate_keys {
                let last_key = cursor.comparable_key(key.iter());
                let run = rows
                    .iter()
                    .rev()
                    .take_while(|row| cursor.comparable_row_key(row) == last_key)
                    .count();
                let same_as_before = cursor
                    .last_key
                    .as_ref()
                    .is_some_and(|prev| cursor.comparable_key(prev.iter()) == last_key);
                cursor.repeats = if run == rows.len() && same_as_before {
                    skip + run
                } else {
                    run
                };
            }
            cursor.last_key = Some(key);
        }
        cursor.exhausted = !has_more;
        cursor.pages += 1;
        cursor.rows += rows.len() as u64;

        debug!(
            "{}: page {} with {} rows",
            cursor.table.full_name(),
            cursor.pages,
            rows.len()
        );

        Ok(Page { rows, has_more })
    }

    /// Release the connection.
    pub async fn close(mut self, cursor: &Cursor) {
        self.source.close().await;
        info!(
            "{}: fetched {} rows in {} pages",
            cursor.table.full_name(),
            cursor.rows,
            cursor.pages
        );
    }

    async fn describe_with_retry(&mut self, table: &TableName) -> Result<Option<TableSpec>> {
        let mut attempt = 0;
        loop {
            match self.source.describe(table).await {
                Ok(spec) => return Ok(spec),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    self.backoff(&table.full_name(), attempt, &e).await?;
                }
                Err(e) if e.is_transient() => {
                    return Err(ReconcileError::fatal(
                        table.full_name(),
                        format!("giving up after {} retries: {}", attempt, e),
                    ))
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_with_retry(&mut self, request: &PageRequest<'_>) -> Result<Vec<Row>> {
        let table = request.table.full_name();
        let mut attempt = 0;
        loop {
            match self.source.fetch_page(request).await {
                Ok(rows) => return Ok(rows),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    self.backoff(&table, attempt, &e).await?;
                }
                Err(e) if e.is_transient() => {
                    return Err(ReconcileError::fatal(
                        table,
                        format!("giving up after {} retries: {}", attempt, e),
                    ))
                }
                Err(e @ ReconcileError::FatalFetch { .. }) => return Err(e),
                Err(e) => return Err(ReconcileError::fatal(table, e.to_string())),
            }
        }
    }

    /// Sleep before retry `attempt`, then reconnect.
    async fn backoff(&mut self, table: &str, attempt: u32, error: &ReconcileError) -> Result<()> {
        let delay = self.retry.delay_for(attempt);
        warn!(
            "{}: transient error, retry {}/{} in {:?}: {}",
            table, attempt, self.retry.max_retries, delay, error
        );

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(ReconcileError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        // A failed reconnect surfaces on the next attempt.
        if let Err(e) = self.source.reconnect().await {
            warn!("{}: reconnect failed: {}", table, e);
        }
        Ok(())
    }
}

/// Run `fetcher` on a background task, sending pages into a channel that
/// holds at most `capacity` pages.
///
/// The task stops after the last page, after the first error (which is
/// sent), when `cancel` fires, or when the receiver is dropped. The fetcher
/// is closed on exit.
pub fn spawn_producer(
    mut fetcher: BatchFetcher,
    mut cursor: Cursor,
    capacity: usize,
    cancel: CancellationToken,
) -> (mpsc::Receiver<Result<Page>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let handle = tokio::spawn(async move {
        let table = cursor.table.full_name();
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("{}: producer cancelled", table);
                    break;
                }
                result = fetcher.next(&mut cursor) => result,
            };

            let done = match &result {
                Ok(page) => !page.has_more,
                Err(_) => true,
            };
            if tx.send(result).await.is_err() {
                debug!("{}: consumer gone, stopping", table);
                break;
            }
            if done {
                break;
            }
        }
        fetcher.close(&cursor).await;
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ColumnSpec, TypeClass};
    use crate::drivers::MemorySource;

    fn table() -> TableName {
        TableName::new("dbo", "items")
    }

    fn source(n: i32) -> MemorySource {
        let spec = TableSpec::new(
            table(),
            vec![
                ColumnSpec::new("id", "int", TypeClass::Unknown).not_null(),
                ColumnSpec::new("name", "varchar", TypeClass::Unknown),
            ],
        )
        .with_primary_key(["id"]);
        let rows = (1..=n)
            .rev()
            .map(|i| Row::new(vec![SqlValue::I32(i), SqlValue::text_owned(format!("item {}", i))]))
            .collect();
        MemorySource::new().with_table(spec, rows)
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_pages_in_key_order() {
        let mut fetcher = BatchFetcher::new(Box::new(source(5)), fast_retry());
        let resolver = TypeCompatibilityResolver::new();
        let mut cursor = fetcher.open(&table(), &[], 2, &resolver).await.unwrap();
        assert_eq!(cursor.table().columns[0].class, TypeClass::Integer);

        let mut ids = Vec::new();
        let mut pages = 0;
        loop {
            let page = fetcher.next(&mut cursor).await.unwrap();
            pages += 1;
            ids.extend(page.rows.iter().map(|r| r.get(0).clone()));
            if !page.has_more {
                break;
            }
        }
        assert_eq!(pages, 3);
        assert_eq!(ids, (1..=5).map(SqlValue::I32).collect::<Vec<_>>());
        assert!(fetcher.next(&mut cursor).await.unwrap().rows.is_empty());
        assert_eq!(cursor.rows_fetched(), 5);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_page() {
        let mut fetcher = BatchFetcher::new(Box::new(source(4)), fast_retry());
        let resolver = TypeCompatibilityResolver::new();
        let mut cursor = fetcher.open(&table(), &[], 2, &resolver).await.unwrap();

        assert!(fetcher.next(&mut cursor).await.unwrap().has_more);
        assert!(fetcher.next(&mut cursor).await.unwrap().has_more);
        let last = fetcher.next(&mut cursor).await.unwrap();
        assert!(last.rows.is_empty());
        assert!(!last.has_more);
        assert!(cursor.is_exhausted());
    }

    #[tokio::test]
    async fn test_missing_table_is_schema_error() {
        let mut fetcher = BatchFetcher::new(Box::new(source(1)), fast_retry());
        let resolver = TypeCompatibilityResolver::new();
        let err = fetcher
            .open(&TableName::new("dbo", "nope"), &[], 10, &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn test_missing_key_column_is_schema_error() {
        let mut fetcher = BatchFetcher::new(Box::new(source(1)), fast_retry());
        let resolver = TypeCompatibilityResolver::new();
        let err = fetcher
            .open(&table(), &["sku".to_string()], 10, &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let source = source(3).fail_transiently(2);
        let mut fetcher = BatchFetcher::new(Box::new(source), fast_retry());
        let resolver = TypeCompatibilityResolver::new();
        let mut cursor = fetcher.open(&table(), &[], 10, &resolver).await.unwrap();

        let page = fetcher.next(&mut cursor).await.unwrap();
        assert_eq!(page.rows.len(), 3);
    }

    #[tokio::test]
    async fn test_retry_ceiling_escalates_to_fatal() {
        let source = source(3).fail_transiently(3);
        let mut fetcher = BatchFetcher::new(Box::new(source), fast_retry());
        let resolver = TypeCompatibilityResolver::new();
        let mut cursor = fetcher.open(&table(), &[], 10, &resolver).await.unwrap();

        let err = fetcher.next(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ReconcileError::FatalFetch { .. }));
    }

    #[tokio::test]
    async fn test_producer_streams_all_pages() {
        let mut fetcher = BatchFetcher::new(Box::new(source(7)), fast_retry());
        let resolver = TypeCompatibilityResolver::new();
        let cursor = fetcher.open(&table(), &[], 3, &resolver).await.unwrap();

        let (mut rx, handle) = spawn_producer(fetcher, cursor, 1, CancellationToken::new());
        let mut total = 0;
        while let Some(page) = rx.recv().await {
            total += page.unwrap().rows.len();
        }
        handle.await.unwrap();
        assert_eq!(total, 7);
    }

    #[tokio::test]
    async fn test_repeated_keys_across_page_boundaries() {
        let spec = TableSpec::new(
            table(),
            vec![ColumnSpec::new("code", "int", TypeClass::Unknown)],
        );
        let codes = [3, 2, 1, 2, 2, 3, 2, 2];
        let rows = codes
            .iter()
            .map(|&c| Row::new(vec![SqlValue::I32(c)]))
            .collect();
        let source = MemorySource::new().with_table(spec, rows);
        let mut fetcher = BatchFetcher::new(Box::new(source), fast_retry());
        let resolver = TypeCompatibilityResolver::new();
        let spec = fetcher.describe(&table(), &resolver).await.unwrap();
        let mut cursor = Cursor::new(spec, &["code".to_string()], 2)
            .unwrap()
            .with_duplicate_keys();

        let mut seen = Vec::new();
        loop {
            let page = fetcher.next(&mut cursor).await.unwrap();
            seen.extend(page.rows.iter().map(|r| r.get(0).clone()));
            if !page.has_more {
                break;
            }
        }
        let expected: Vec<SqlValue<'static>> =
            [1, 2, 2, 2, 2, 2, 3, 3].into_iter().map(SqlValue::I32).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_table_without_primary_key_needs_key_columns() {
        let spec = TableSpec::new(
            table(),
            vec![ColumnSpec::new("code", "int", TypeClass::Unknown)],
        );
        let err = Cursor::new(spec, &[], 10).unwrap_err();
        assert!(matches!(err, ReconcileError::SchemaMismatch { .. }));
    }
}
