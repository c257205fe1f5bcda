//! Parallel range scan, reduce, and commit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use taxi_database::{CommitOutcome, StatStore};
use taxi_geo::GeoIndex;
use taxi_object_store::ObjectStore;
use taxi_queue::Task;
use taxi_stat::StatAccumulator;
use taxi_stat_models::StatAggregate;
use taxi_trip::{RangeReader, record_count};
use taxi_trip_models::{Category, Period, file_name};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{OrchestratorError, cut};

/// Records parsed per batch between cancellation checks.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Outcome of one scan: the reduced aggregate plus scan metadata.
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// `<store>/<key>` that was scanned.
    pub source: String,
    /// Reduced counters with region totals derived.
    pub aggregate: StatAggregate,
    /// Wall time of the scan.
    pub elapsed: Duration,
    /// Parts scanned concurrently.
    pub parts: usize,
    /// Fixed-width records that failed to parse.
    pub malformed: u64,
}

struct Part {
    accumulator: StatAccumulator,
    malformed: u64,
}

/// Runs scans against one normalized-file store and commits to one
/// statistics store.
pub struct Orchestrator {
    source: Arc<dyn ObjectStore>,
    geo: Arc<GeoIndex>,
    stats: Arc<dyn StatStore>,
    batch_size: usize,
    idempotent_commits: bool,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Creates an orchestrator with default batch size and at-least-once
    /// (non-idempotent) commits.
    #[must_use]
    pub fn new(
        source: Arc<dyn ObjectStore>,
        geo: Arc<GeoIndex>,
        stats: Arc<dyn StatStore>,
    ) -> Self {
        Self {
            source,
            geo,
            stats,
            batch_size: DEFAULT_BATCH_SIZE,
            idempotent_commits: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Records parsed per batch.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Guards task commits with per-task markers so a redelivered task
    /// is not counted twice.
    #[must_use]
    pub const fn with_idempotent_commits(mut self, enabled: bool) -> Self {
        self.idempotent_commits = enabled;
        self
    }

    /// Uses `cancel` to abort scans and stop the worker loop.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancellation token observed by scans.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Statistics store commits go to.
    #[must_use]
    pub fn stats(&self) -> &Arc<dyn StatStore> {
        &self.stats
    }

    /// Scans records `[start, end]` with `parallelism` concurrent parts
    /// and returns the reduced aggregate without committing it.
    ///
    /// `end` is clamped to the file's record count.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Trip`] if the file is missing or a
    /// read fails, and [`OrchestratorError::Cancelled`] if the scan was
    /// cancelled. Either way no partial result is returned.
    pub async fn scan_range(
        &self,
        category: Category,
        period: Period,
        start: u64,
        end: u64,
        parallelism: usize,
    ) -> Result<ScanReport, OrchestratorError> {
        let started = Instant::now();
        let records = record_count(self.source.as_ref(), category, period).await?;
        let end = end.min(records);
        let parts = cut(start.min(end), end, parallelism);

        let mut set = JoinSet::new();
        for (i, (part_start, part_end)) in parts.iter().copied().enumerate() {
            let worker = format!("mapper{i:02}");
            let source = Arc::clone(&self.source);
            let geo = Arc::clone(&self.geo);
            let cancel = self.cancel.clone();
            let batch_size = self.batch_size;
            set.spawn(async move {
                scan_part(
                    source.as_ref(),
                    &geo,
                    category,
                    period,
                    (part_start.min(records), part_end.min(records)),
                    batch_size,
                    &cancel,
                    &worker,
                )
                .await
            });
        }

        let mut master = StatAccumulator::new(category, period);
        let mut malformed = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(part)) => {
                    master.merge(&part.accumulator);
                    malformed += part.malformed;
                }
                Ok(Err(e)) => {
                    set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    set.abort_all();
                    return Err(e.into());
                }
            }
        }

        let aggregate = master.finish();
        log::info!(
            "{category}-{period} [{start}, {end}] => reduced {} records from {} parts",
            aggregate.total,
            parts.len()
        );
        Ok(ScanReport {
            source: format!("{}/{}", self.source.uri(), file_name(category, period)),
            aggregate,
            elapsed: started.elapsed(),
            parts: parts.len(),
            malformed,
        })
    }

    /// Scans and appends the result to the statistics store.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] if the scan or the append fails.
    /// Nothing is committed when the scan fails.
    pub async fn run_range(
        &self,
        category: Category,
        period: Period,
        start: u64,
        end: u64,
        parallelism: usize,
    ) -> Result<ScanReport, OrchestratorError> {
        let report = self
            .scan_range(category, period, start, end, parallelism)
            .await?;
        self.stats.append(&report.aggregate).await?;
        log::info!("{category}-{period} => committed {}", report.aggregate.total);
        Ok(report)
    }

    /// Scans the range of a leased task and commits it, guarded by the
    /// task's marker when idempotent commits are enabled.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] if the scan or the commit fails.
    pub async fn run_task(
        &self,
        task: &Task,
        parallelism: usize,
    ) -> Result<(ScanReport, CommitOutcome), OrchestratorError> {
        let report = self.scan_task(task, parallelism).await?;

        let outcome = if self.idempotent_commits {
            self.stats
                .append_once(&task.encode(), &report.aggregate)
                .await?
        } else {
            self.stats.append(&report.aggregate).await?;
            CommitOutcome::Committed
        };
        log::info!("{task} => {outcome:?} {}", report.aggregate.total);
        Ok((report, outcome))
    }

    /// Scans the half-open task range `[start, end)`.
    async fn scan_task(
        &self,
        task: &Task,
        parallelism: usize,
    ) -> Result<ScanReport, OrchestratorError> {
        if task.end <= task.start {
            log::debug!("{task} => empty range");
            return Ok(ScanReport {
                source: format!("{}/{}", self.source.uri(), file_name(task.category, task.period)),
                aggregate: StatAccumulator::new(task.category, task.period).finish(),
                elapsed: Duration::ZERO,
                parts: 0,
                malformed: 0,
            });
        }
        self.scan_range(
            task.category,
            task.period,
            task.start,
            task.end - 1,
            parallelism,
        )
        .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn scan_part(
    source: &dyn ObjectStore,
    geo: &GeoIndex,
    category: Category,
    period: Period,
    (start, end): (u64, u64),
    batch_size: usize,
    cancel: &CancellationToken,
    worker: &str,
) -> Result<Part, OrchestratorError> {
    let mut reader = RangeReader::open(source, category, period, start, end).await?;
    log::info!("{} [{start}, {end}) => {worker}", reader.location());

    let mut accumulator = StatAccumulator::new(category, period);
    loop {
        if cancel.is_cancelled() {
            log::warn!("{} [{start}, {end}) => {worker} cancelled", reader.location());
            return Err(OrchestratorError::Cancelled);
        }
        let batch = reader.next_batch(batch_size).await?;
        if batch.is_empty() {
            break;
        }
        for record in &batch {
            accumulator.update(record, geo);
        }
    }

    let malformed = reader.malformed();
    log::info!(
        "{} [{start}, {end}) => {worker} done, {} records",
        reader.location(),
        accumulator.aggregate().total
    );
    reader.close();
    Ok(Part {
        accumulator,
        malformed,
    })
}
