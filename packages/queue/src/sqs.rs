//! Amazon SQS backend.
//!
//! A received message is immediately re-hidden for the task's own timeout
//! (`ChangeMessageVisibility`), so the queue's default visibility timeout
//! only covers the gap between receive and decode. Messages that don't
//! decode as tasks are deleted on receipt.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::types::QueueAttributeName;

use crate::{Delivery, QueueDepth, QueueError, Task, TaskQueue};

/// Longest long-poll SQS accepts.
const MAX_WAIT_SECS: u64 = 20;

/// Task queue backed by one SQS queue.
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    name: String,
    url: String,
}

fn service_error(
    queue: &str,
    operation: &'static str,
    e: impl std::error::Error + Send + Sync + 'static,
) -> QueueError {
    QueueError::Service {
        queue: queue.to_string(),
        operation,
        source: Box::new(e),
    }
}

impl SqsQueue {
    /// Resolves the URL of queue `name` in `region`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Service`] if the queue does not exist or the
    /// lookup fails.
    pub async fn connect(name: &str, region: &str) -> Result<Self, QueueError> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        let client = aws_sdk_sqs::Client::new(&config);

        let output = client
            .get_queue_url()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| service_error(name, "GetQueueUrl", e))?;
        let url = output.queue_url().unwrap_or_default().to_string();
        log::info!("Connected to queue {name} ({url})");

        Ok(Self {
            client,
            name: name.to_string(),
            url,
        })
    }

    async fn delete_receipt(&self, receipt: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| service_error(&self.name, "DeleteMessage", e))?;
        Ok(())
    }

    async fn set_visibility(&self, task: &Task, seconds: u64) -> Result<(), QueueError> {
        let delivery = task.delivery()?;
        self.client
            .change_message_visibility()
            .queue_url(&self.url)
            .receipt_handle(&delivery.receipt)
            .visibility_timeout(i32::try_from(seconds).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(|e| service_error(&self.name, "ChangeMessageVisibility", e))?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for SqsQueue {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(&self.url)
            .message_body(task.encode())
            .send()
            .await
            .map_err(|e| service_error(&self.name, "SendMessage", e))?;
        log::debug!("{task} => create");
        Ok(())
    }

    async fn lease(&self, max_wait: Duration) -> Result<Option<Task>, QueueError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let wait = remaining.as_secs().min(MAX_WAIT_SECS);
            let output = self
                .client
                .receive_message()
                .queue_url(&self.url)
                .max_number_of_messages(1)
                .wait_time_seconds(i32::try_from(wait).unwrap_or(0))
                .send()
                .await
                .map_err(|e| service_error(&self.name, "ReceiveMessage", e))?;

            let Some(message) = output.messages().first() else {
                log::debug!("{}: no more tasks", self.name);
                return Ok(None);
            };

            let delivery = Delivery {
                message_id: message.message_id().unwrap_or_default().to_string(),
                receipt: message.receipt_handle().unwrap_or_default().to_string(),
            };
            match Task::from_delivery(message.body().unwrap_or_default(), delivery.clone()) {
                Ok(task) => {
                    log::debug!("{task} => hold");
                    self.set_visibility(&task, task.timeout_secs).await?;
                    return Ok(Some(task));
                }
                Err(e) => {
                    log::warn!("Deleting message {}: {e}", delivery.message_id);
                    self.delete_receipt(&delivery.receipt).await?;
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn extend_lease(&self, task: &Task, seconds: u64) -> Result<(), QueueError> {
        self.set_visibility(task, seconds).await
    }

    async fn delete(&self, task: &Task) -> Result<(), QueueError> {
        let delivery = task.delivery()?;
        self.delete_receipt(&delivery.receipt).await?;
        log::debug!("{task} ({}) => delete", delivery.message_id);
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(&self.url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| service_error(&self.name, "GetQueueAttributes", e))?;

        let count = |name: &QueueAttributeName| {
            output
                .attributes()
                .and_then(|attrs| attrs.get(name))
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Ok(QueueDepth {
            visible: count(&QueueAttributeName::ApproximateNumberOfMessages),
            in_flight: count(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
        })
    }

    async fn purge(&self) -> Result<(), QueueError> {
        log::warn!("{} => purge", self.name);
        self.client
            .purge_queue()
            .queue_url(&self.url)
            .send()
            .await
            .map_err(|e| service_error(&self.name, "PurgeQueue", e))?;
        Ok(())
    }
}
