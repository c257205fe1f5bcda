#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Leased work queue of scan tasks.
//!
//! Delivery is at-least-once: a leased task stays hidden for its timeout
//! and reappears unless it is deleted first. Tasks travel as the text
//! `category,year,month,start,end,timeout`.
//!
//! Backends: [`memory::MemoryQueue`] (single process, tests) and, with the
//! `sqs` feature, `sqs::SqsQueue`.

pub mod memory;
#[cfg(feature = "sqs")]
pub mod sqs;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use taxi_trip_models::{Category, Period};

pub use memory::MemoryQueue;

/// Lease duration applied when an encoded task omits its timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A message body is not a valid task encoding.
    #[error("Invalid task '{body}': {message}")]
    Decode {
        /// The rejected message body.
        body: String,
        /// Description of what went wrong.
        message: String,
    },

    /// The task was never leased from this queue.
    #[error("Task {task} has no delivery handle")]
    NotLeased {
        /// Short form of the task.
        task: String,
    },

    /// The lease behind a receipt expired and the task was leased again.
    #[error("Lease on message {message_id} is no longer held")]
    StaleReceipt {
        /// Queue message ID.
        message_id: String,
    },

    /// The remote queue service failed.
    #[error("Queue {queue} {operation} failed: {source}")]
    Service {
        /// Queue name or URL.
        queue: String,
        /// Operation that failed.
        operation: &'static str,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Identifies one delivery of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Stable message ID.
    pub message_id: String,
    /// Receipt handle of this particular lease.
    pub receipt: String,
}

/// Scan records `[start, end)` of one category and month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Dataset category.
    pub category: Category,
    /// Dataset month.
    pub period: Period,
    /// First record index.
    pub start: u64,
    /// One past the last record index.
    pub end: u64,
    /// Lease duration in seconds.
    pub timeout_secs: u64,
    /// Set on tasks returned by [`TaskQueue::lease`].
    pub delivery: Option<Delivery>,
}

impl Task {
    /// Creates an undelivered task.
    #[must_use]
    pub const fn new(
        category: Category,
        period: Period,
        start: u64,
        end: u64,
        timeout_secs: u64,
    ) -> Self {
        Self {
            category,
            period,
            start,
            end,
            timeout_secs,
            delivery: None,
        }
    }

    /// Wire form `category,year,month,start,end,timeout`.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.category,
            self.period.year,
            self.period.month,
            self.start,
            self.end,
            self.timeout_secs
        )
    }

    /// Parses the wire form. The timeout field may be omitted.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Decode`] if the body has the wrong number of
    /// fields or any field fails to parse.
    pub fn decode(body: &str) -> Result<Self, QueueError> {
        let fail = |message: String| QueueError::Decode {
            body: body.to_string(),
            message,
        };

        let fields: Vec<&str> = body.trim().split(',').map(str::trim).collect();
        if !(5..=6).contains(&fields.len()) {
            return Err(fail(format!("expected 6 fields, found {}", fields.len())));
        }

        let category = Category::from_str(fields[0]).map_err(|e| fail(e.to_string()))?;
        let year = parse_field::<i32>(fields[1], "year").map_err(fail)?;
        let month = parse_field::<u32>(fields[2], "month").map_err(fail)?;
        let period = Period::new(year, month).map_err(|e| fail(e.to_string()))?;
        let start = parse_field::<u64>(fields[3], "start").map_err(fail)?;
        let end = parse_field::<u64>(fields[4], "end").map_err(fail)?;
        let timeout_secs = match fields.get(5) {
            Some(value) => parse_field::<u64>(value, "timeout").map_err(fail)?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self::new(category, period, start, end, timeout_secs))
    }

    /// Decodes a received message body and attaches its delivery handle.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Decode`] if `body` is not a valid task. Such a
    /// message can never succeed and should be removed from the queue.
    pub fn from_delivery(body: &str, delivery: Delivery) -> Result<Self, QueueError> {
        let mut task = Self::decode(body)?;
        task.delivery = Some(delivery);
        Ok(task)
    }

    /// Lease duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub(crate) fn delivery(&self) -> Result<&Delivery, QueueError> {
        self.delivery.as_ref().ok_or_else(|| QueueError::NotLeased {
            task: self.to_string(),
        })
    }
}

fn parse_field<T: FromStr>(value: &str, name: &str) -> Result<T, String> {
    value
        .parse::<T>()
        .map_err(|_| format!("invalid {name} '{value}'"))
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:[{},{}):{}",
            self.category, self.period, self.start, self.end, self.timeout_secs
        )
    }
}

/// Approximate queue depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Tasks available for lease.
    pub visible: u64,
    /// Tasks currently leased.
    pub in_flight: u64,
}

/// At-least-once leased task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Human-readable queue name for logs.
    fn name(&self) -> String;

    /// Adds a task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the task cannot be sent.
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError>;

    /// Waits up to `max_wait` for a task and leases it for the task's
    /// timeout. Returns `None` if nothing became available.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the receive fails.
    async fn lease(&self, max_wait: Duration) -> Result<Option<Task>, QueueError>;

    /// Keeps a leased task hidden for another `seconds` from now.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::StaleReceipt`] if the lease was lost.
    async fn extend_lease(&self, task: &Task, seconds: u64) -> Result<(), QueueError>;

    /// Permanently removes a leased task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::StaleReceipt`] if the lease was lost.
    async fn delete(&self, task: &Task) -> Result<(), QueueError>;

    /// Visible and in-flight task counts.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the counts cannot be fetched.
    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    /// Removes every task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the purge fails.
    async fn purge(&self) -> Result<(), QueueError>;
}
