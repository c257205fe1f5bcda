//! Queue-driven worker loop.

use std::convert::Infallible;
use std::time::Duration;

use taxi_database::CommitOutcome;
use taxi_queue::{Task, TaskQueue};
use tokio::time::{Instant, MissedTickBehavior};

use crate::{Orchestrator, OrchestratorError};

/// Worker loop parameters.
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Sleep after an empty lease.
    pub poll_interval: Duration,
    /// Longest a single lease call waits for a task.
    pub lease_wait: Duration,
    /// Concurrent parts per task.
    pub parallelism: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            lease_wait: Duration::from_secs(1),
            parallelism: 1,
        }
    }
}

/// Counters for one worker loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks scanned, committed, and deleted.
    pub completed: u64,
    /// Tasks left for redelivery after a failure.
    pub failed: u64,
    /// Tasks whose commit was skipped as already applied.
    pub duplicates: u64,
}

/// Extends the lease on `task` every half timeout. Never returns.
async fn heartbeat(queue: &dyn TaskQueue, task: &Task) -> Infallible {
    let every = (task.timeout() / 2).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match queue.extend_lease(task, task.timeout_secs).await {
            Ok(()) => log::debug!("{task} => lease extended {}s", task.timeout_secs),
            Err(e) => log::warn!("{task} => failed to extend lease: {e}"),
        }
    }
}

impl Orchestrator {
    /// Leases tasks from `queue` and runs each until cancelled.
    ///
    /// A task is deleted only after its statistics are committed. A failed
    /// task is logged and left leased so the queue redelivers it once the
    /// lease expires. Queue errors are logged and retried after
    /// `poll_interval`. Returns once the cancellation token fires.
    pub async fn run_worker_loop(
        &self,
        queue: &dyn TaskQueue,
        options: WorkerOptions,
    ) -> WorkerStats {
        let cancel = self.cancellation().clone();
        let mut stats = WorkerStats::default();
        let mut nth_task = 0u64;
        log::info!("worker => polling {}", queue.name());

        while !cancel.is_cancelled() {
            let leased = tokio::select! {
                () = cancel.cancelled() => break,
                leased = queue.lease(options.lease_wait) => leased,
            };

            let task = match leased {
                Ok(Some(task)) => task,
                Ok(None) => {
                    log::info!(
                        "no task, wait for {} seconds...",
                        options.poll_interval.as_secs_f64()
                    );
                    self.idle(options.poll_interval).await;
                    continue;
                }
                Err(e) => {
                    log::warn!("Failed to lease from {}: {e}", queue.name());
                    self.idle(options.poll_interval).await;
                    continue;
                }
            };

            log::info!("task {nth_task} => start {task}");
            nth_task += 1;

            let result = tokio::select! {
                result = self.run_task(&task, options.parallelism) => result,
                never = heartbeat(queue, &task) => match never {},
            };

            match result {
                Ok((_, outcome)) => {
                    if outcome == CommitOutcome::Duplicate {
                        stats.duplicates += 1;
                    }
                    match queue.delete(&task).await {
                        Ok(()) => log::info!("task {task} => succeeded"),
                        Err(e) => log::warn!("task {task} => committed but not deleted: {e}"),
                    }
                    stats.completed += 1;
                }
                Err(OrchestratorError::Cancelled) => {
                    log::warn!("task {task} => cancelled, left for redelivery");
                    stats.failed += 1;
                }
                Err(e) => {
                    log::error!("task {task} => failed: {e}");
                    stats.failed += 1;
                }
            }
        }

        log::info!(
            "worker => stopped ({} completed, {} failed, {} duplicates)",
            stats.completed,
            stats.failed,
            stats.duplicates
        );
        stats
    }

    async fn idle(&self, duration: Duration) {
        tokio::select! {
            () = self.cancellation().cancelled() => {}
            () = tokio::time::sleep(duration) => {}
        }
    }
}
