//! Task submission and inspection.

use std::time::Duration;

use taxi_object_store::ObjectStore;
use taxi_queue::{Task, TaskQueue};
use taxi_trip::record_count;
use taxi_trip_models::{Category, Period};

use crate::{OrchestratorError, cut};

/// How a month's records are split into tasks.
#[derive(Debug, Clone, Copy)]
pub struct SubmitOptions {
    /// Fixed task count. Derived from `records_per_task` when `None`.
    pub n_tasks: Option<usize>,
    /// Target records per task.
    pub records_per_task: u64,
    /// Lease timeout written into every task.
    pub timeout_secs: u64,
    /// Log the tasks without enqueueing them.
    pub dry_run: bool,
}

/// Cuts the month's records into tasks and enqueues them.
///
/// Returns the tasks that were (or, on a dry run, would have been)
/// enqueued.
///
/// # Errors
///
/// Returns [`OrchestratorError::Trip`] if the normalized file is missing
/// and [`OrchestratorError::Queue`] if an enqueue fails.
pub async fn submit_tasks(
    source: &dyn ObjectStore,
    queue: &dyn TaskQueue,
    category: Category,
    period: Period,
    options: &SubmitOptions,
) -> Result<Vec<Task>, OrchestratorError> {
    let records = record_count(source, category, period).await?;
    let n_tasks = options.n_tasks.unwrap_or_else(|| {
        usize::try_from(records / options.records_per_task.max(1) + 1).unwrap_or(usize::MAX)
    });
    log::debug!(
        "create {n_tasks} tasks for {}/{category}-{period} ({records})",
        source.uri()
    );

    let mut tasks = Vec::with_capacity(n_tasks);
    for (start, end) in cut(0, records, n_tasks) {
        let task = Task::new(category, period, start, end, options.timeout_secs);
        log::debug!("{task} => create");
        if !options.dry_run {
            queue.enqueue(&task).await?;
        }
        tasks.push(task);
    }

    log::info!(
        "{} {} tasks for {category}-{period} to {}",
        if options.dry_run { "Would submit" } else { "Submitted" },
        tasks.len(),
        queue.name()
    );
    Ok(tasks)
}

/// Leases up to `count` tasks, deleting each one when `delete` is set.
/// Stops early when the queue is empty.
///
/// # Errors
///
/// Returns [`OrchestratorError::Queue`] if a lease or delete fails.
pub async fn receive_tasks(
    queue: &dyn TaskQueue,
    count: usize,
    delete: bool,
    wait: Duration,
) -> Result<Vec<Task>, OrchestratorError> {
    let mut tasks = Vec::new();
    while tasks.len() < count {
        let Some(task) = queue.lease(wait).await? else {
            log::debug!("no more tasks");
            break;
        };
        if delete {
            queue.delete(&task).await?;
        }
        tasks.push(task);
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use taxi_database::MemoryStatStore;
    use taxi_queue::{MemoryQueue, QueueDepth};

    use super::*;
    use crate::Orchestrator;
    use crate::scan::tests::{fixture, geo, period};

    fn options(n_tasks: Option<usize>, dry_run: bool) -> SubmitOptions {
        SubmitOptions {
            n_tasks,
            records_per_task: 40,
            timeout_secs: 120,
            dry_run,
        }
    }

    #[tokio::test]
    async fn derives_task_count_from_records_per_task() {
        let (dir, source) = fixture("submit_derived", 100);
        let queue = MemoryQueue::new();

        let tasks = submit_tasks(
            source.as_ref(),
            &queue,
            Category::Green,
            period(),
            &options(None, false),
        )
        .await
        .unwrap();

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].start, 0);
        assert_eq!(tasks[2].end, 101);
        assert!(tasks.iter().all(|t| t.timeout_secs == 120));
        assert_eq!(queue.depth().await.unwrap().visible, 3);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn submitted_tasks_scan_every_record_once() {
        for (records, records_per_task) in [(300, 100), (257, 40), (5, 100)] {
            let (dir, source) = fixture(&format!("submit_cover_{records}"), records);
            let queue = MemoryQueue::new();
            let orchestrator =
                Orchestrator::new(Arc::clone(&source), geo(), Arc::new(MemoryStatStore::new()));

            let tasks = submit_tasks(
                source.as_ref(),
                &queue,
                Category::Green,
                period(),
                &SubmitOptions {
                    records_per_task,
                    ..options(None, true)
                },
            )
            .await
            .unwrap();

            let mut scanned = 0;
            for task in &tasks {
                let (report, _) = orchestrator.run_task(task, 3).await.unwrap();
                assert_eq!(
                    report.aggregate.total,
                    task.end.min(records) - task.start,
                    "{task}"
                );
                scanned += report.aggregate.total;
            }
            assert_eq!(scanned, records);

            std::fs::remove_dir_all(&dir).ok();
        }
    }

    #[tokio::test]
    async fn dry_run_enqueues_nothing() {
        let (dir, source) = fixture("submit_dry", 100);
        let queue = MemoryQueue::new();

        let tasks = submit_tasks(
            source.as_ref(),
            &queue,
            Category::Green,
            period(),
            &options(Some(5), true),
        )
        .await
        .unwrap();

        assert_eq!(tasks.len(), 5);
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn missing_source_is_fatal() {
        let (dir, source) = fixture("submit_missing", 1);
        let queue = MemoryQueue::new();

        let result = submit_tasks(
            source.as_ref(),
            &queue,
            Category::Yellow,
            period(),
            &options(None, false),
        )
        .await;
        assert!(matches!(result, Err(OrchestratorError::Trip(_))));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn receive_leases_and_optionally_deletes() {
        let queue = MemoryQueue::new();
        for start in [0, 10, 20] {
            queue
                .enqueue(&Task::new(Category::Green, period(), start, start + 10, 60))
                .await
                .unwrap();
        }

        let held = receive_tasks(&queue, 1, false, Duration::ZERO).await.unwrap();
        assert_eq!(held.len(), 1);
        let deleted = receive_tasks(&queue, 5, true, Duration::ZERO).await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(
            queue.depth().await.unwrap(),
            QueueDepth {
                visible: 0,
                in_flight: 1
            }
        );
    }
}
