//! Work queues with acknowledgement and redelivery

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use transfers_types::{Error, Result};

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Identifies the delivery for [`WorkQueue::ack`] and [`WorkQueue::nack`]
    pub tag: u64,
    /// The message was delivered before and not acknowledged
    pub redelivered: bool,
    /// Message body
    pub payload: Vec<u8>,
}

/// A durable queue with at-least-once delivery.
///
/// A message stays owned by the queue until it is acknowledged. Consumers hold
/// at most the prefetch limit of unacknowledged deliveries at a time.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a message
    async fn publish(&self, payload: Vec<u8>) -> Result<()>;

    /// Wait for the next message; `None` once the queue is closed
    async fn next(&self) -> Result<Option<Delivery>>;

    /// Processing finished, drop the message
    async fn ack(&self, tag: u64) -> Result<()>;

    /// Processing was abandoned; with `requeue` the message is delivered again
    async fn nack(&self, tag: u64, requeue: bool) -> Result<()>;

    /// Stop handing out messages and wake every waiting consumer
    async fn close(&self);
}

struct Unacked {
    payload: Vec<u8>,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct State {
    ready: VecDeque<(Vec<u8>, bool)>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    closed: bool,
}

/// In-process queue with a prefetch limit
pub struct MemoryQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    prefetch: Arc<Semaphore>,
}

impl MemoryQueue {
    /// Create a queue allowing `prefetch` unacknowledged deliveries
    pub fn new(name: impl Into<String>, prefetch: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            prefetch: Arc::new(Semaphore::new(prefetch.max(1))),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::queue(format!("{} queue lock poisoned", self.name)))
    }

    /// Messages waiting for delivery
    pub fn ready_count(&self) -> usize {
        self.state().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Delivered messages not yet acknowledged
    pub fn unacked_count(&self) -> usize {
        self.state().map(|s| s.unacked.len()).unwrap_or(0)
    }

    /// Put every unacknowledged delivery back on the queue, as a broker does
    /// when a consumer connection drops. Returns the number requeued.
    pub fn recover(&self) -> Result<usize> {
        let mut state = self.state()?;
        let mut tags: Vec<u64> = state.unacked.keys().copied().collect();
        tags.sort_unstable();
        for tag in &tags {
            if let Some(entry) = state.unacked.remove(tag) {
                state.ready.push_back((entry.payload, true));
            }
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(tags.len())
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let mut state = self.state()?;
        if state.closed {
            return Err(Error::queue(format!("{} queue is closed", self.name)));
        }
        state.ready.push_back((payload, false));
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn next(&self) -> Result<Option<Delivery>> {
        let permit = Arc::clone(&self.prefetch)
            .acquire_owned()
            .await
            .map_err(|_| Error::queue(format!("{} queue is closed", self.name)))?;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state()?;
                if let Some((payload, redelivered)) = state.ready.pop_front() {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    state.unacked.insert(
                        tag,
                        Unacked {
                            payload: payload.clone(),
                            _permit: permit,
                        },
                    );
                    // Another consumer may be waiting for the rest.
                    if !state.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Ok(Some(Delivery {
                        tag,
                        redelivered,
                        payload,
                    }));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        self.state()?
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| Error::queue(format!("unknown delivery tag {tag}")))
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.state()?;
        let entry = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| Error::queue(format!("unknown delivery tag {tag}")))?;
        if requeue && !state.closed {
            state.ready.push_back((entry.payload, true));
            drop(state);
            self.notify.notify_one();
        } else {
            debug!(queue = %self.name, tag, "Dropped rejected message");
        }
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut state) = self.state() {
            state.closed = true;
        }
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_and_ack() {
        let queue = MemoryQueue::new("parents", 4);
        queue.publish(b"a".to_vec()).await.unwrap();
        queue.publish(b"b".to_vec()).await.unwrap();

        let first = queue.next().await.unwrap().unwrap();
        let second = queue.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"a");
        assert_eq!(second.payload, b"b");
        assert!(!first.redelivered);
        assert_eq!(queue.unacked_count(), 2);

        queue.ack(first.tag).await.unwrap();
        queue.ack(second.tag).await.unwrap();
        assert_eq!(queue.unacked_count(), 0);
        assert!(queue.ack(first.tag).await.is_err());
    }

    #[tokio::test]
    async fn test_nack_requeue_marks_redelivered() {
        let queue = MemoryQueue::new("children", 1);
        queue.publish(b"x".to_vec()).await.unwrap();

        let delivery = queue.next().await.unwrap().unwrap();
        queue.nack(delivery.tag, true).await.unwrap();
        let again = queue.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.payload, b"x");

        queue.nack(again.tag, false).await.unwrap();
        assert_eq!(queue.ready_count(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked() {
        let queue = MemoryQueue::new("children", 1);
        queue.publish(b"1".to_vec()).await.unwrap();
        queue.publish(b"2".to_vec()).await.unwrap();

        let first = queue.next().await.unwrap().unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.next()).await;
        assert!(blocked.is_err());

        queue.ack(first.tag).await.unwrap();
        let second = queue.next().await.unwrap().unwrap();
        assert_eq!(second.payload, b"2");
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_woken() {
        let queue = Arc::new(MemoryQueue::new("parents", 2));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.publish(b"late".to_vec()).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn test_close_releases_consumers() {
        let queue = Arc::new(MemoryQueue::new("parents", 2));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.close().await;

        assert!(consumer.await.unwrap().unwrap().is_none());
        assert!(queue.publish(b"late".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_recover_redelivers_unacked() {
        let queue = MemoryQueue::new("children", 4);
        queue.publish(b"1".to_vec()).await.unwrap();
        let _lost = queue.next().await.unwrap().unwrap();

        assert_eq!(queue.recover().unwrap(), 1);
        let again = queue.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.payload, b"1");
    }
}
