//! Ordered merge-join reconciliation of one table pair.
//!
//! The [`Reconciler`] drives a single comparison through
//! `Idle → Running → {Completed, Cancelled, Failed}`:
//!
//! 1. Describe both tables, pick the key and check that the key columns
//!    pair up with comparable types. Problems here fail the run with an
//!    error before any row is fetched. A source without a primary key and
//!    without configured key columns is keyed on every column both tables
//!    share; rows are then matched as a multiset, so duplicates pair up one
//!    by one and null key components are allowed.
//! 2. Plan the value columns: shared columns of comparable type are
//!    compared, everything else is reported once as a warning.
//! 3. Start one producer task per side and merge the two key-ordered
//!    streams with one lookahead row each. Every outcome goes to the
//!    [`MismatchReporter`] as soon as it is classified.
//!
//! Cancellation is checked before every merge step, so the outcome of the
//! row being classified is always recorded in full.

mod types;

pub use types::{
    ColumnDiff, JobState, KeyMapping, OutcomeKind, ProgressUpdate, ReconciliationJob,
    ReconciliationSummary, RowImage, RowOutcome, Side,
};

use std::cmp::Ordering;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{Row, TableSpec, TypeClass};
use crate::error::{ReconcileError, Result};
use crate::fetch::{spawn_producer, BatchFetcher, Cursor, Page};
use crate::normalize::{CanonicalKey, KeyColumn, KeyNormalizer, ValueNormalizer};
use crate::report::{MismatchReporter, RunInfo};
use crate::typemap::TypeCompatibilityResolver;

/// Types each engine cannot ORDER BY, never used as an implicit key.
const UNORDERED_TYPES: &[(&str, &[&str])] = &[
    (
        "mssql",
        &["text", "ntext", "image", "xml", "sql_variant", "geography", "geometry"],
    ),
    ("postgres", &["xml", "json", "point", "line", "lseg", "box", "path", "polygon", "circle"]),
];

fn orderable(engine: &str, data_type: &str, class: TypeClass) -> bool {
    let data_type = data_type.to_lowercase();
    class != TypeClass::Unknown
        && !UNORDERED_TYPES
            .iter()
            .any(|(e, types)| *e == engine && types.contains(&data_type.as_str()))
}

/// Progress callback, invoked from the merge loop.
pub type ProgressCallback = Box<dyn FnMut(&ProgressUpdate) + Send>;

/// A value column compared on both sides.
#[derive(Debug, Clone)]
struct ColumnPair {
    name: String,
    source_index: usize,
    target_index: usize,
    class: TypeClass,
}

/// Key column names chosen for both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyChoice {
    source: Vec<String>,
    target: Vec<String>,
    /// Keyed on every shared column because the source has no key.
    row_identity: bool,
}

impl KeyChoice {
    /// An explicit mapping wins, then the source's primary key, then every
    /// shared column that both engines can order.
    fn resolve(
        job: &ReconciliationJob,
        source: &TableSpec,
        source_engine: &str,
        target: &TableSpec,
        target_engine: &str,
    ) -> Result<Self> {
        if !job.key_columns.is_empty() {
            return Ok(Self {
                source: job.key_columns.iter().map(|k| k.source.clone()).collect(),
                target: job.key_columns.iter().map(|k| k.target.clone()).collect(),
                row_identity: false,
            });
        }

        // The target is keyed by the source's key names
        if !source.primary_key.is_empty() {
            let names: Vec<String> = source
                .key_indices(&source.primary_key)?
                .into_iter()
                .map(|i| source.columns[i].name.clone())
                .collect();
            return Ok(Self {
                source: names.clone(),
                target: names,
                row_identity: false,
            });
        }

        let mut names = (Vec::new(), Vec::new());
        for s in &source.columns {
            if job.exclude_columns.iter().any(|e| e.eq_ignore_ascii_case(&s.name)) {
                continue;
            }
            let Some(t) = target.column(&s.name) else {
                continue;
            };
            if orderable(source_engine, &s.data_type, s.class)
                && orderable(target_engine, &t.data_type, t.class)
                && job.resolver.comparison_class(s.class, t.class).is_some()
            {
                names.0.push(s.name.clone());
                names.1.push(t.name.clone());
            }
        }
        if names.0.is_empty() {
            return Err(ReconcileError::schema(
                source.full_name(),
                "no primary key, no key columns given and no shared orderable column to key on",
            ));
        }
        Ok(Self {
            source: names.0,
            target: names.1,
            row_identity: true,
        })
    }
}

/// Key layout and value columns of a table pair.
#[derive(Debug)]
struct ComparePlan {
    source_keys: Vec<KeyColumn>,
    target_keys: Vec<KeyColumn>,
    columns: Vec<ColumnPair>,
    warnings: Vec<String>,
    row_identity: bool,
}

impl ComparePlan {
    fn build(
        source: &TableSpec,
        source_key_indices: &[usize],
        target: &TableSpec,
        target_key_indices: &[usize],
        exclude: &[String],
        resolver: &TypeCompatibilityResolver,
    ) -> Result<Self> {
        if source_key_indices.len() != target_key_indices.len() {
            return Err(ReconcileError::Config(format!(
                "{} has {} key columns but {} has {}",
                source.full_name(),
                source_key_indices.len(),
                target.full_name(),
                target_key_indices.len()
            )));
        }

        let mut source_keys = Vec::with_capacity(source_key_indices.len());
        let mut target_keys = Vec::with_capacity(target_key_indices.len());
        for (&si, &ti) in source_key_indices.iter().zip(target_key_indices) {
            let s = &source.columns[si];
            let t = &target.columns[ti];
            let class = resolver.comparison_class(s.class, t.class).ok_or_else(|| {
                ReconcileError::Config(format!(
                    "key column {}.{} ({}, {}) is not comparable with {}.{} ({}, {})",
                    source.full_name(),
                    s.name,
                    s.data_type,
                    s.class,
                    target.full_name(),
                    t.name,
                    t.data_type,
                    t.class
                ))
            })?;
            source_keys.push(KeyColumn {
                name: s.name.clone(),
                index: si,
                class,
            });
            target_keys.push(KeyColumn {
                name: t.name.clone(),
                index: ti,
                class,
            });
        }

        let skipped = |idx: usize, name: &str, keys: &[usize]| {
            keys.contains(&idx) || exclude.iter().any(|e| e.eq_ignore_ascii_case(name))
        };

        let mut columns = Vec::new();
        let mut warnings = Vec::new();
        let mut matched_targets = Vec::new();

        for (si, s) in source.columns.iter().enumerate() {
            if skipped(si, &s.name, source_key_indices) {
                continue;
            }
            let found = target
                .columns
                .iter()
                .enumerate()
                .find(|(ti, t)| {
                    t.name.eq_ignore_ascii_case(&s.name) && !skipped(*ti, &t.name, target_key_indices)
                });
            let Some((ti, t)) = found else {
                warnings.push(format!(
                    "column {} exists only in {}; not compared",
                    s.name,
                    source.full_name()
                ));
                continue;
            };
            matched_targets.push(ti);

            match resolver.comparison_class(s.class, t.class) {
                Some(class) => columns.push(ColumnPair {
                    name: s.name.clone(),
                    source_index: si,
                    target_index: ti,
                    class,
                }),
                None => warnings.push(format!(
                    "column {}: {} ({}) is not comparable with {} ({}); not compared",
                    s.name, s.data_type, s.class, t.data_type, t.class
                )),
            }
        }

        for (ti, t) in target.columns.iter().enumerate() {
            if matched_targets.contains(&ti) || skipped(ti, &t.name, target_key_indices) {
                continue;
            }
            warnings.push(format!(
                "column {} exists only in {}; not compared",
                t.name,
                target.full_name()
            ));
        }

        Ok(Self {
            source_keys,
            target_keys,
            columns,
            warnings,
            row_identity: false,
        })
    }

    /// Classify two rows with equal keys.
    fn compare(&self, source: &Row, target: &Row, normalizer: &ValueNormalizer) -> OutcomeKind {
        let diffs: Vec<ColumnDiff> = self
            .columns
            .iter()
            .filter_map(|c| {
                let a = source.get(c.source_index);
                let b = target.get(c.target_index);
                if normalizer.normalize(a, c.class) == normalizer.normalize(b, c.class) {
                    None
                } else {
                    Some(ColumnDiff {
                        column: c.name.clone(),
                        source: a.clone(),
                        target: b.clone(),
                    })
                }
            })
            .collect();

        if diffs.is_empty() {
            OutcomeKind::Matched
        } else {
            OutcomeKind::Mismatched(diffs)
        }
    }
}

/// Rows of one side, pulled page by page from its producer.
struct RowStream {
    side: Side,
    table: String,
    columns: Vec<String>,
    keys: Vec<KeyColumn>,
    rx: mpsc::Receiver<Result<Page>>,
    rows: std::vec::IntoIter<Row>,
    last_page: bool,
    last_key: Option<CanonicalKey>,
    duplicates_allowed: bool,
}

impl RowStream {
    fn new(
        side: Side,
        table: &TableSpec,
        keys: Vec<KeyColumn>,
        rx: mpsc::Receiver<Result<Page>>,
        duplicates_allowed: bool,
    ) -> Self {
        Self {
            side,
            table: table.full_name(),
            columns: table.columns.iter().map(|c| c.name.clone()).collect(),
            keys,
            rx,
            rows: Vec::new().into_iter(),
            last_page: false,
            last_key: None,
            duplicates_allowed,
        }
    }

    /// All values of `row`, labelled with this side's column names.
    fn image(&self, row: Row) -> RowImage {
        RowImage(self.columns.iter().cloned().zip(row.values).collect())
    }

    /// Next row with a complete key, `None` at the end of the table.
    ///
    /// Rows with a null key component are reported and skipped unless the
    /// key normalizer accepts nulls. Keys must strictly increase, or merely
    /// not decrease when duplicates are allowed; anything else means the
    /// source does not honor the requested order and the run cannot
    /// continue.
    async fn next(
        &mut self,
        normalizer: &KeyNormalizer,
        cancel: &CancellationToken,
        reporter: &mut MismatchReporter,
    ) -> Result<Option<(CanonicalKey, Row)>> {
        loop {
            if cancel.is_cancelled() {
                return Err(ReconcileError::Cancelled);
            }

            if let Some(row) = self.rows.next() {
                match normalizer.build_key(&row, &self.keys) {
                    Ok(key) => {
                        if let Some(last) = &self.last_key {
                            let out_of_order = match key.cmp(last) {
                                Ordering::Less => true,
                                Ordering::Equal => !self.duplicates_allowed,
                                Ordering::Greater => false,
                            };
                            if out_of_order {
                                return Err(ReconcileError::fatal(
                                    &self.table,
                                    format!("rows out of key order: {} after {}", key, last),
                                ));
                            }
                        }
                        self.last_key = Some(key.clone());
                        return Ok(Some((key, row)));
                    }
                    Err(null) => {
                        let raw_key = self
                            .keys
                            .iter()
                            .map(|k| row.get(k.index).to_string())
                            .collect::<Vec<_>>()
                            .join("|");
                        warn!(
                            "{}: skipping row with null key column {} ({})",
                            self.table, null.column, raw_key
                        );
                        reporter
                            .record_integrity_error(self.side, &null.column, raw_key)
                            .await;
                        continue;
                    }
                }
            }

            if self.last_page {
                return Ok(None);
            }

            match self.rx.recv().await {
                Some(Ok(page)) => {
                    self.last_page = !page.has_more;
                    self.rows = page.rows.into_iter();
                }
                Some(Err(e)) => return Err(e),
                None if cancel.is_cancelled() => return Err(ReconcileError::Cancelled),
                None => {
                    return Err(ReconcileError::fatal(
                        &self.table,
                        format!("{} producer stopped before the last page", self.side),
                    ))
                }
            }
        }
    }
}

/// Compares one source table with one target table.
pub struct Reconciler {
    job: ReconciliationJob,
    state: JobState,
    cancel: CancellationToken,
    on_progress: Option<ProgressCallback>,
}

impl Reconciler {
    pub fn new(job: ReconciliationJob) -> Self {
        Self {
            job,
            state: JobState::Idle,
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }

    /// Use `cancel` instead of a private token, e.g. to share one signal
    /// across the tables of a run.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn job(&self) -> &ReconciliationJob {
        &self.job
    }

    /// Token that cancels this run; cloneable into other tasks.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Compare the tables behind `source` and `target`.
    ///
    /// Returns `Err` for configuration and schema problems found before
    /// fetching starts. Once rows flow, the run always produces a summary:
    /// a fetch failure ends it as Failed with the cause in
    /// [`ReconciliationSummary::failure`], a cancellation as Cancelled.
    pub async fn run(
        &mut self,
        source: BatchFetcher,
        target: BatchFetcher,
        reporter: &mut MismatchReporter,
    ) -> Result<ReconciliationSummary> {
        if self.state != JobState::Idle {
            return Err(ReconcileError::Config(format!(
                "reconciler already used (state {})",
                self.state
            )));
        }
        self.state = JobState::Running;
        info!(
            "Reconciling {} -> {}",
            self.job.source_table, self.job.target_table
        );

        let producers = self.cancel.child_token();
        let mut source = source.with_cancel(producers.clone());
        let mut target = target.with_cancel(producers.clone());

        let (source_cursor, target_cursor, plan) =
            match self.prepare(&mut source, &mut target).await {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.state = JobState::Failed;
                    return Err(e);
                }
            };

        reporter
            .begin(RunInfo {
                run_id: self.job.run_id.clone(),
                source_table: source_cursor.table().full_name(),
                target_table: target_cursor.table().full_name(),
                started_at: Utc::now(),
            })
            .await;

        for warning in &plan.warnings {
            warn!("{}", warning);
            reporter.add_warning(warning.clone());
        }

        let mut estimated_total = None;
        if self.job.row_count_check {
            let source_rows = source.row_count(&source_cursor).await;
            let target_rows = target.row_count(&target_cursor).await;
            if let (Some(s), Some(t)) = (source_rows, target_rows) {
                if s != t {
                    let warning = format!(
                        "row count estimates differ: {} has ~{}, {} has ~{}",
                        source_cursor.table().full_name(),
                        s,
                        target_cursor.table().full_name(),
                        t
                    );
                    warn!("{}", warning);
                    reporter.add_warning(warning);
                }
            }
            estimated_total = source_rows
                .into_iter()
                .chain(target_rows)
                .max()
                .map(|n| n.max(0) as u64);
            reporter.set_row_estimates(source_rows, target_rows);
        }

        let mut source_rows =
            self.start_producer(Side::Source, source, source_cursor, &plan, &producers);
        let mut target_rows =
            self.start_producer(Side::Target, target, target_cursor, &plan, &producers);

        let result = self
            .merge(
                &mut source_rows.0,
                &mut target_rows.0,
                &plan,
                reporter,
                estimated_total,
            )
            .await;

        let counters = *reporter.counters();
        self.report_progress(counters.progress(estimated_total));

        producers.cancel();
        drop(source_rows.0);
        drop(target_rows.0);
        for handle in [source_rows.1, target_rows.1] {
            if let Err(e) = handle.await {
                warn!("row producer task failed: {}", e);
            }
        }

        let (state, failure) = match result {
            Ok(()) => (JobState::Completed, None),
            Err(ReconcileError::Cancelled) => {
                info!("{}: cancelled", self.job.source_table);
                (JobState::Cancelled, None)
            }
            Err(e) => {
                warn!("{}: {}", self.job.source_table, e);
                (JobState::Failed, Some(e.to_string()))
            }
        };

        self.state = state;
        Ok(reporter.finalize(state, failure).await)
    }

    async fn prepare(
        &self,
        source: &mut BatchFetcher,
        target: &mut BatchFetcher,
    ) -> Result<(Cursor, Cursor, ComparePlan)> {
        self.job.validate()?;
        let job = &self.job;

        let source_spec = source.describe(&job.source_table, &job.resolver).await?;
        let target_spec = target.describe(&job.target_table, &job.resolver).await?;
        let keys = KeyChoice::resolve(
            job,
            &source_spec,
            source.db_type(),
            &target_spec,
            target.db_type(),
        )?;

        let mut source_cursor = Cursor::new(source_spec, &keys.source, job.batch_size)?;
        let mut target_cursor = Cursor::new(target_spec, &keys.target, job.batch_size)?;
        if keys.row_identity {
            source_cursor = source_cursor.with_duplicate_keys();
            target_cursor = target_cursor.with_duplicate_keys();
        }

        let mut plan = ComparePlan::build(
            source_cursor.table(),
            source_cursor.key_indices(),
            target_cursor.table(),
            target_cursor.key_indices(),
            &job.exclude_columns,
            &job.resolver,
        )?;
        plan.row_identity = keys.row_identity;
        if keys.row_identity {
            plan.warnings.push(format!(
                "{} has no primary key; rows keyed on all {} shared columns ({})",
                source_cursor.table().full_name(),
                keys.source.len(),
                keys.source.join(", ")
            ));
        }

        debug!(
            "{}: comparing {} columns by key ({})",
            source_cursor.table().full_name(),
            plan.columns.len(),
            plan.source_keys
                .iter()
                .map(|k| k.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok((source_cursor, target_cursor, plan))
    }

    fn start_producer(
        &self,
        side: Side,
        fetcher: BatchFetcher,
        cursor: Cursor,
        plan: &ComparePlan,
        cancel: &CancellationToken,
    ) -> (RowStream, tokio::task::JoinHandle<()>) {
        let table = cursor.table().clone();
        let keys = match side {
            Side::Source => plan.source_keys.clone(),
            Side::Target => plan.target_keys.clone(),
        };
        let (rx, handle) = spawn_producer(fetcher, cursor, self.job.buffer_batches, cancel.clone());
        (
            RowStream::new(side, &table, keys, rx, plan.row_identity),
            handle,
        )
    }

    async fn merge(
        &mut self,
        source: &mut RowStream,
        target: &mut RowStream,
        plan: &ComparePlan,
        reporter: &mut MismatchReporter,
        estimated_total: Option<u64>,
    ) -> Result<()> {
        let keys = KeyNormalizer::new(&self.job.normalizer).with_nulls_allowed(plan.row_identity);
        let normalizer = self.job.normalizer.clone();
        let interval = self.job.progress_interval.max(1) as u64;
        let cancel = self.cancel.clone();

        let mut s = source.next(&keys, &cancel, reporter).await?;
        let mut t = target.next(&keys, &cancel, reporter).await?;

        loop {
            if cancel.is_cancelled() {
                return Err(ReconcileError::Cancelled);
            }

            let (outcome, advance_source, advance_target) = match (s.take(), t.take()) {
                (None, None) => return Ok(()),
                (Some((sk, srow)), None) => (
                    RowOutcome {
                        key: sk,
                        kind: OutcomeKind::MissingInTarget(source.image(srow)),
                    },
                    true,
                    false,
                ),
                (None, Some((tk, trow))) => (
                    RowOutcome {
                        key: tk,
                        kind: OutcomeKind::MissingInSource(target.image(trow)),
                    },
                    false,
                    true,
                ),
                (Some((sk, srow)), Some((tk, trow))) => match sk.cmp(&tk) {
                    Ordering::Equal => {
                        let kind = plan.compare(&srow, &trow, &normalizer);
                        (RowOutcome { key: sk, kind }, true, true)
                    }
                    Ordering::Less => {
                        t = Some((tk, trow));
                        (
                            RowOutcome {
                                key: sk,
                                kind: OutcomeKind::MissingInTarget(source.image(srow)),
                            },
                            true,
                            false,
                        )
                    }
                    Ordering::Greater => {
                        s = Some((sk, srow));
                        (
                            RowOutcome {
                                key: tk,
                                kind: OutcomeKind::MissingInSource(target.image(trow)),
                            },
                            false,
                            true,
                        )
                    }
                },
            };

            reporter.record_outcome(&outcome).await;
            let counters = *reporter.counters();
            if counters.rows_compared % interval == 0 {
                self.report_progress(counters.progress(estimated_total));
            }

            if advance_source {
                s = source.next(&keys, &cancel, reporter).await?;
            }
            if advance_target {
                t = target.next(&keys, &cancel, reporter).await?;
            }
        }
    }

    fn report_progress(&mut self, update: ProgressUpdate) {
        if let Some(callback) = self.on_progress.as_mut() {
            callback(&update);
        }
    }
}
