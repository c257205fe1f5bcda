#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Persisted trip statistics.
//!
//! A [`StatStore`] keeps one aggregate per `(category, year * 100 + month)`.
//! Appends are additive at the store (`value = value + delta` per counter),
//! so reducers for the same key never need client-side locking.
//!
//! Two backends: [`stat_db::DuckDbStatStore`] on a local `DuckDB` file and
//! [`memory::MemoryStatStore`] for tests and dry runs.

pub mod memory;
pub mod paths;
pub mod stat_db;

use async_trait::async_trait;
use taxi_stat_models::StatAggregate;
use taxi_trip_models::{Category, Period};

pub use memory::MemoryStatStore;
pub use stat_db::DuckDbStatStore;

/// Errors that can occur during statistics storage.
#[derive(Debug, thiserror::Error)]
pub enum StatStoreError {
    /// `DuckDB` error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// I/O error preparing the database file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A counter value does not fit the storage type.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },

    /// The store connection lock was poisoned by a panic.
    #[error("Statistics store lock poisoned")]
    Poisoned,

    /// A blocking database call panicked or was cancelled.
    #[error("Statistics store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result of a marker-guarded commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Counters were added.
    Committed,
    /// The marker was already recorded; nothing was added.
    Duplicate,
}

/// Additive persisted aggregate store.
#[async_trait]
pub trait StatStore: Send + Sync {
    /// Adds every counter of `aggregate` to the stored aggregate for its
    /// key.
    ///
    /// # Errors
    ///
    /// Returns [`StatStoreError`] if the write fails. Nothing is added on
    /// failure.
    async fn append(&self, aggregate: &StatAggregate) -> Result<(), StatStoreError>;

    /// Like [`Self::append`], but records `marker` atomically with the
    /// update and skips the update if `marker` was already recorded.
    ///
    /// # Errors
    ///
    /// Returns [`StatStoreError`] if the write fails.
    async fn append_once(
        &self,
        marker: &str,
        aggregate: &StatAggregate,
    ) -> Result<CommitOutcome, StatStoreError>;

    /// Reads the stored aggregate. A missing key yields a zero aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`StatStoreError`] if the read fails.
    async fn try_get(&self, category: Category, period: Period)
    -> Result<StatAggregate, StatStoreError>;

    /// Periods with stored counters for `category`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`StatStoreError`] if the read fails.
    async fn periods(&self, category: Category) -> Result<Vec<Period>, StatStoreError>;

    /// Deletes every stored aggregate (and commit marker) of `category`.
    /// Returns the number of counter rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`StatStoreError`] if the delete fails.
    async fn purge(&self, category: Category) -> Result<u64, StatStoreError>;

    /// Reads the stored aggregate, degrading any failure to a zero
    /// aggregate (logged).
    async fn get(&self, category: Category, period: Period) -> StatAggregate {
        match self.try_get(category, period).await {
            Ok(aggregate) => aggregate,
            Err(e) => {
                log::warn!("Failed to read {category}-{period} statistics: {e}");
                StatAggregate::empty(category, period)
            }
        }
    }
}
