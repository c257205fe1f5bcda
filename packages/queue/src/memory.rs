//! Single-process lease queue.
//!
//! Leases are tracked against `tokio::time::Instant`, so tests can drive
//! expiry with a paused clock.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::{Delivery, QueueDepth, QueueError, Task, TaskQueue};

struct Message {
    id: String,
    body: String,
}

struct Lease {
    message: Message,
    receipt: String,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    visible: VecDeque<Message>,
    leased: HashMap<String, Lease>,
}

impl State {
    /// Moves expired leases back to the visible queue.
    fn expire(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(lease) = self.leased.remove(&id) {
                log::debug!("message {id} lease expired => visible");
                self.visible.push_back(lease.message);
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.leased.values().map(|lease| lease.deadline).min()
    }

    fn take(&mut self, now: Instant) -> Option<Task> {
        while let Some(message) = self.visible.pop_front() {
            let receipt = uuid::Uuid::new_v4().to_string();
            let delivery = Delivery {
                message_id: message.id.clone(),
                receipt: receipt.clone(),
            };
            let task = match Task::from_delivery(&message.body, delivery) {
                Ok(task) => task,
                Err(e) => {
                    log::warn!("Dropping message {}: {e}", message.id);
                    continue;
                }
            };
            self.leased.insert(
                message.id.clone(),
                Lease {
                    message,
                    receipt,
                    deadline: now + task.timeout(),
                },
            );
            return Some(task);
        }
        None
    }

    fn held(&mut self, task: &Task) -> Result<&mut Lease, QueueError> {
        let delivery = task.delivery()?;
        match self.leased.get_mut(&delivery.message_id) {
            Some(lease) if lease.receipt == delivery.receipt => Ok(lease),
            _ => Err(QueueError::StaleReceipt {
                message_id: delivery.message_id.clone(),
            }),
        }
    }
}

/// In-process [`TaskQueue`].
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    fn name(&self) -> String {
        "memory".to_string()
    }

    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            body: task.encode(),
        };
        log::debug!("{task} => enqueue {}", message.id);
        self.state.lock().await.visible.push_back(message);
        self.notify.notify_one();
        Ok(())
    }

    async fn lease(&self, max_wait: Duration) -> Result<Option<Task>, QueueError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let wake = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.expire(now);
                if let Some(task) = state.take(now) {
                    log::debug!("{task} => lease");
                    return Ok(Some(task));
                }
                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_expiry()
                    .map_or(deadline, |expiry| expiry.min(deadline))
            };

            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn extend_lease(&self, task: &Task, seconds: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.expire(now);
        state.held(task)?.deadline = now + Duration::from_secs(seconds);
        log::debug!("{task} => hold {seconds}s");
        Ok(())
    }

    async fn delete(&self, task: &Task) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.expire(Instant::now());
        state.held(task)?;
        if let Some(delivery) = &task.delivery {
            state.leased.remove(&delivery.message_id);
        }
        log::debug!("{task} => delete");
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut state = self.state.lock().await;
        state.expire(Instant::now());
        Ok(QueueDepth {
            visible: state.visible.len() as u64,
            in_flight: state.leased.len() as u64,
        })
    }

    async fn purge(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        log::warn!(
            "memory queue => purge ({} visible, {} leased)",
            state.visible.len(),
            state.leased.len()
        );
        state.visible.clear();
        state.leased.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use taxi_trip_models::{Category, Period};

    use super::*;

    fn task(start: u64, timeout_secs: u64) -> Task {
        Task::new(
            Category::Green,
            Period::new(2016, 3).unwrap(),
            start,
            start + 100,
            timeout_secs,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn leased_task_returns_only_after_timeout() {
        let queue = MemoryQueue::new();
        queue.enqueue(&task(0, 10)).await.unwrap();

        let first = queue.lease(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(
            queue.depth().await.unwrap(),
            QueueDepth {
                visible: 0,
                in_flight: 1
            }
        );

        assert!(queue.lease(Duration::from_secs(5)).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        let second = queue.lease(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.start, first.start);
        assert_eq!(
            second.delivery.as_ref().unwrap().message_id,
            first.delivery.as_ref().unwrap().message_id
        );
        assert_ne!(second.delivery, first.delivery);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_task_is_gone_for_good() {
        let queue = MemoryQueue::new();
        queue.enqueue(&task(0, 10)).await.unwrap();

        let leased = queue.lease(Duration::ZERO).await.unwrap().unwrap();
        queue.delete(&leased).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(queue.lease(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_wait_expires_without_tasks() {
        let queue = MemoryQueue::new();
        let before = Instant::now();
        assert!(queue.lease(Duration::from_secs(3)).await.unwrap().is_none());
        assert!(Instant::now() - before >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_lease_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.lease(Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.enqueue(&task(7, 10)).await.unwrap();

        let leased = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(leased.start, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn extended_lease_outlives_original_timeout() {
        let queue = MemoryQueue::new();
        queue.enqueue(&task(0, 10)).await.unwrap();
        let leased = queue.lease(Duration::ZERO).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        queue.extend_lease(&leased, 10).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(queue.lease(Duration::ZERO).await.unwrap().is_none());
        queue.delete(&leased).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_receipt_is_stale() {
        let queue = MemoryQueue::new();
        queue.enqueue(&task(0, 10)).await.unwrap();
        let first = queue.lease(Duration::ZERO).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let second = queue.lease(Duration::ZERO).await.unwrap().unwrap();

        assert!(matches!(
            queue.delete(&first).await,
            Err(QueueError::StaleReceipt { .. })
        ));
        queue.delete(&second).await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_message_is_dropped_not_redelivered() {
        let queue = MemoryQueue::new();
        queue.state.lock().await.visible.push_back(Message {
            id: "garbage".to_string(),
            body: "yellow,2016".to_string(),
        });
        queue.enqueue(&task(0, 10)).await.unwrap();

        let leased = queue.lease(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(leased.start, 0);
        assert_eq!(
            queue.depth().await.unwrap(),
            QueueDepth {
                visible: 0,
                in_flight: 1
            }
        );
        queue.delete(&leased).await.unwrap();
        assert!(queue.lease(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unleased_task_cannot_be_deleted() {
        let queue = MemoryQueue::new();
        assert!(matches!(
            queue.delete(&task(0, 10)).await,
            Err(QueueError::NotLeased { .. })
        ));
    }

    #[tokio::test]
    async fn purge_empties_queue() {
        let queue = MemoryQueue::new();
        for start in [0, 100, 200] {
            queue.enqueue(&task(start, 10)).await.unwrap();
        }
        queue.lease(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(
            queue.depth().await.unwrap(),
            QueueDepth {
                visible: 2,
                in_flight: 1
            }
        );

        queue.purge().await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }
}
