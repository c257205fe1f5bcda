//! Backends resolved from [`Settings`].

use std::path::PathBuf;
use std::sync::Arc;

use taxi_cli_utils::MultiProgress;
use taxi_config::Settings;
use taxi_database::{DuckDbStatStore, StatStore, StatStoreError, paths};
use taxi_geo::{GeoError, GeoIndex};
use taxi_object_store::{ObjectStore, ObjectStoreError};
use taxi_orchestrator::Orchestrator;
use taxi_queue::{MemoryQueue, QueueError, TaskQueue};
use tokio_util::sync::CancellationToken;

/// Queue name that selects the in-process queue.
const MEMORY_QUEUE: &str = "memory";

/// Errors building a backend.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Opening the normalized-file store failed.
    #[error(transparent)]
    Store(#[from] ObjectStoreError),

    /// Opening the statistics database failed.
    #[error(transparent)]
    Stats(#[from] StatStoreError),

    /// Connecting to the queue failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Loading district polygons failed.
    #[error(transparent)]
    Geo(#[from] GeoError),

    /// The queue needs a backend this binary was built without.
    #[cfg(not(feature = "sqs"))]
    #[error("Queue '{name}' requires the `sqs` feature")]
    QueueUnavailable {
        /// Configured queue name.
        name: String,
    },
}

/// Everything a command needs.
pub struct Context {
    pub settings: Settings,
    pub multi: MultiProgress,
    pub cancel: CancellationToken,
}

impl Context {
    pub const fn new(settings: Settings, multi: MultiProgress, cancel: CancellationToken) -> Self {
        Self {
            settings,
            multi,
            cancel,
        }
    }

    /// Store holding normalized files (`source`).
    pub async fn source_store(&self) -> Result<Arc<dyn ObjectStore>, ContextError> {
        Ok(taxi_object_store::open(&self.settings.source, &self.settings.region).await?)
    }

    pub fn stat_db_path(&self) -> PathBuf {
        self.settings
            .stat_db
            .clone()
            .unwrap_or_else(paths::stat_db_path)
    }

    pub fn stat_store(&self) -> Result<Arc<dyn StatStore>, ContextError> {
        Ok(Arc::new(DuckDbStatStore::open(&self.stat_db_path())?))
    }

    pub async fn queue(&self) -> Result<Arc<dyn TaskQueue>, ContextError> {
        let name = self.settings.queue.as_str();
        if name == MEMORY_QUEUE {
            log::warn!("Using an in-process queue; tasks do not outlive this process");
            return Ok(Arc::new(MemoryQueue::new()));
        }
        self.remote_queue(name).await
    }

    #[cfg(feature = "sqs")]
    async fn remote_queue(&self, name: &str) -> Result<Arc<dyn TaskQueue>, ContextError> {
        let queue = taxi_queue::sqs::SqsQueue::connect(name, &self.settings.region).await?;
        Ok(Arc::new(queue))
    }

    #[cfg(not(feature = "sqs"))]
    #[allow(clippy::unused_async)]
    async fn remote_queue(&self, name: &str) -> Result<Arc<dyn TaskQueue>, ContextError> {
        Err(ContextError::QueueUnavailable {
            name: name.to_string(),
        })
    }

    pub fn geo(&self) -> Result<Arc<GeoIndex>, ContextError> {
        Ok(Arc::new(GeoIndex::load(&self.settings.districts)?))
    }

    pub async fn orchestrator(&self) -> Result<Orchestrator, ContextError> {
        Ok(
            Orchestrator::new(self.source_store().await?, self.geo()?, self.stat_store()?)
                .with_batch_size(self.settings.batch_size)
                .with_idempotent_commits(self.settings.idempotent_commits)
                .with_cancellation(self.cancel.clone()),
        )
    }
}
