#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Object storage for normalized and raw trip files.
//!
//! The pipeline only needs a handful of operations from storage: read a
//! byte range of an object, look up its size, upload a file, list keys by
//! prefix, and attach tags. [`ObjectStore`] captures exactly that, with two
//! backends:
//!
//! - [`LocalObjectStore`] (`file://<dir>` or a bare path): objects are files
//!   under a root directory, tags live in a JSON sidecar.
//! - [`S3ObjectStore`] (`s3://<bucket>[/<prefix>]`): the AWS SDK client,
//!   with ranged `GetObject` and size + MD5/`ETag` skip-if-unchanged uploads.
//!
//! Use [`open`] to resolve a URI into a backend.

mod local;
mod s3;
mod sync;

use std::ops::Range;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

pub use local::LocalObjectStore;
pub use s3::S3ObjectStore;

/// Errors that can occur during object storage operations.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    /// The requested object does not exist.
    #[error("Object not found: {uri}/{key}")]
    NotFound {
        /// Store URI.
        uri: String,
        /// Object key.
        key: String,
    },

    /// Ranged read failed.
    #[error("Failed to read {uri}/{key}: {source}")]
    Get {
        /// Store URI.
        uri: String,
        /// Object key.
        key: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Upload failed.
    #[error("Failed to upload {uri}/{key}: {source}")]
    Put {
        /// Store URI.
        uri: String,
        /// Object key.
        key: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Metadata lookup failed.
    #[error("Failed to head {uri}/{key}: {source}")]
    Head {
        /// Store URI.
        uri: String,
        /// Object key.
        key: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Listing failed.
    #[error("Failed to list {uri}/{prefix}: {source}")]
    List {
        /// Store URI.
        uri: String,
        /// Key prefix.
        prefix: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Tagging failed.
    #[error("Failed to tag {uri}/{key}: {source}")]
    Tag {
        /// Store URI.
        uri: String,
        /// Object key.
        key: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The URI scheme is not supported.
    #[error("Unsupported object store URI: {uri}")]
    InvalidUri {
        /// The rejected URI.
        uri: String,
    },

    /// I/O error on local files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Object metadata from a head request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Content length in bytes.
    pub size: u64,
    /// Entity tag, when the backend provides one.
    pub etag: Option<String>,
}

/// Options for [`ObjectStore::put_file`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Request the bucket-owner-full-control canned ACL, for uploads into a
    /// bucket owned by another account.
    pub cross_account: bool,
    /// Upload even if the remote object already matches the local file.
    pub force: bool,
}

/// Whether an upload actually transferred bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The file was uploaded.
    Transferred,
    /// The remote object already matched and the upload was skipped.
    Skipped,
}

/// Streaming body returned by [`ObjectStore::get_range`].
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Minimal storage interface the trip pipeline depends on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// URI identifying this store, used in logs and errors.
    fn uri(&self) -> String;

    /// Opens a reader over bytes `[range.start, range.end)` of `key`.
    ///
    /// A range that extends past the end of the object yields a short read.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::NotFound`] if the object does not exist,
    /// [`ObjectStoreError::Get`] on other failures.
    async fn get_range(&self, key: &str, range: Range<u64>)
    -> Result<ObjectReader, ObjectStoreError>;

    /// Fetches object metadata. Returns `None` if the object doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::Head`] on failures other than absence.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError>;

    /// Uploads a local file to `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::Put`] on upload failure,
    /// [`ObjectStoreError::Io`] on local filesystem errors.
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        options: &PutOptions,
    ) -> Result<PutOutcome, ObjectStoreError>;

    /// Lists all keys starting with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::List`] on failures.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    /// Replaces the tag set of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::Tag`] on failures.
    async fn tag(&self, key: &str, tags: &[(String, String)]) -> Result<(), ObjectStoreError>;
}

/// Resolves a store URI into a backend.
///
/// `s3://bucket[/prefix]` opens an [`S3ObjectStore`] in `region`;
/// `file://dir` or a plain path opens a [`LocalObjectStore`].
///
/// # Errors
///
/// Returns [`ObjectStoreError::InvalidUri`] for other schemes or an empty
/// bucket name.
pub async fn open(uri: &str, region: &str) -> Result<Arc<dyn ObjectStore>, ObjectStoreError> {
    if let Some(rest) = uri.strip_prefix("s3://") {
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ObjectStoreError::InvalidUri {
                uri: uri.to_string(),
            });
        }
        let store = S3ObjectStore::connect(bucket, prefix, region).await;
        return Ok(Arc::new(store));
    }

    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(Arc::new(LocalObjectStore::new(path)));
    }

    if uri.contains("://") {
        return Err(ObjectStoreError::InvalidUri {
            uri: uri.to_string(),
        });
    }

    Ok(Arc::new(LocalObjectStore::new(uri)))
}
