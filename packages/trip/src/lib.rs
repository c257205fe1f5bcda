#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Trip record I/O.
//!
//! - [`codec`]: raw upstream rows to fixed-width normalized records.
//! - [`reader`]: record-index range reads over normalized files.
//! - [`convert`]: month-by-month raw file conversion into a destination.
//! - [`progress`]: rendering-agnostic progress reporting.

pub mod codec;
pub mod convert;
pub mod progress;
pub mod reader;

pub use codec::{RecordCodec, RejectReason, SchemaEpoch};
pub use reader::{RangeReader, available_periods, record_count};

use taxi_object_store::ObjectStoreError;
use taxi_trip_models::ModelError;

/// Errors from reading, normalizing, or converting trip files.
#[derive(Debug, thiserror::Error)]
pub enum TripError {
    /// The source file or object does not exist.
    #[error("{location} does not exist")]
    NotFound {
        /// Path, URL, or store location.
        location: String,
    },

    /// Reading a source stream failed.
    #[error("Failed to read {location}: {source}")]
    Read {
        /// Path, URL, or store location.
        location: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The requested period range is unusable.
    #[error("Invalid range: {message}")]
    InvalidRange {
        /// Description of the problem.
        message: String,
    },

    /// Unsupported source or destination URI.
    #[error("Unsupported URI: {uri}")]
    InvalidUri {
        /// The rejected URI.
        uri: String,
    },

    /// Object storage error.
    #[error(transparent)]
    Store(ObjectStoreError),

    /// Period or record model error.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// HTTP download error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A conversion task panicked or was cancelled.
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<ObjectStoreError> for TripError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound { uri, key } => Self::NotFound {
                location: format!("{uri}/{key}"),
            },
            other => Self::Store(other),
        }
    }
}
