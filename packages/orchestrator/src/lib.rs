#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Map/reduce over normalized trip files.
//!
//! A record range is [`cut`] into contiguous parts, each part is scanned
//! by its own task into its own accumulator, the partials are merged, and
//! the result is appended to a [`taxi_database::StatStore`] in a single
//! commit. [`Orchestrator::run_worker_loop`] drives the same scan from a
//! [`taxi_queue::TaskQueue`].

pub mod scan;
pub mod submit;
pub mod worker;

pub use scan::{Orchestrator, ScanReport};
pub use submit::{SubmitOptions, receive_tasks, submit_tasks};
pub use worker::{WorkerOptions, WorkerStats};

use taxi_database::StatStoreError;
use taxi_queue::QueueError;
use taxi_trip::TripError;

/// Errors from scanning, committing, or queue handling.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Reading the trip file failed.
    #[error(transparent)]
    Trip(#[from] TripError),

    /// Committing statistics failed.
    #[error(transparent)]
    Store(#[from] StatStoreError),

    /// Queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A scan task panicked or was aborted.
    #[error("Scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The scan was cancelled before it finished.
    #[error("Scan cancelled")]
    Cancelled,
}

/// Partitions the inclusive range `[start, end]` into `n` contiguous
/// half-open parts.
///
/// Parts step by `(end - start) / n`; the last part always ends at
/// `end + 1` and absorbs the remainder. When the span is shorter than `n`
/// the leading parts are empty. `n == 0` is treated as `1`.
#[must_use]
pub fn cut(start: u64, end: u64, n: usize) -> Vec<(u64, u64)> {
    let n = n.max(1);
    let end = end.max(start);
    let step = (end - start) / n as u64;

    let mut bounds: Vec<u64> = (0..n as u64).map(|i| start + i * step).collect();
    bounds.push(end + 1);
    bounds.windows(2).map(|w| (w[0], w[1])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(parts: &[(u64, u64)], start: u64, end: u64) {
        assert_eq!(parts.first().map(|p| p.0), Some(start));
        assert_eq!(parts.last().map(|p| p.1), Some(end + 1));
        for w in parts.windows(2) {
            assert_eq!(w[0].1, w[1].0);
        }
    }

    #[test]
    fn cuts_even_span() {
        assert_eq!(cut(0, 100, 4), vec![(0, 25), (25, 50), (50, 75), (75, 101)]);
    }

    #[test]
    fn last_part_absorbs_remainder() {
        let parts = cut(10, 117, 5);
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], (10, 31));
        assert_eq!(parts[4], (94, 118));
        assert_covers(&parts, 10, 117);
    }

    #[test]
    fn span_shorter_than_parts() {
        let parts = cut(5, 7, 4);
        assert_eq!(parts, vec![(5, 5), (5, 5), (5, 5), (5, 8)]);
        assert_covers(&parts, 5, 7);
    }

    #[test]
    fn single_part_is_whole_range() {
        assert_eq!(cut(3, 9, 1), vec![(3, 10)]);
        assert_eq!(cut(3, 9, 0), vec![(3, 10)]);
    }
}
