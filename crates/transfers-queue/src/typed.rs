//! JSON task snapshots on top of a [`WorkQueue`]

use crate::queue::WorkQueue;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;
use transfers_types::{Error, Result};

/// A decoded delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<T> {
    /// Delivery tag to acknowledge
    pub tag: u64,
    /// Seen before without an acknowledgement
    pub redelivered: bool,
    /// Decoded body
    pub body: T,
}

/// Typed view over a queue carrying JSON encoded `T`
pub struct TaskQueue<T> {
    inner: Arc<dyn WorkQueue>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned + Send> TaskQueue<T> {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn WorkQueue>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Publish one snapshot
    pub async fn publish(&self, body: &T) -> Result<()> {
        let payload = serde_json::to_vec(body).map_err(|e| Error::Serialization {
            message: e.to_string(),
        })?;
        self.inner.publish(payload).await
    }

    /// Next decodable message. Undecodable payloads are rejected without requeue.
    pub async fn next(&self) -> Result<Option<Message<T>>> {
        loop {
            let Some(delivery) = self.inner.next().await? else {
                return Ok(None);
            };
            match serde_json::from_slice(&delivery.payload) {
                Ok(body) => {
                    return Ok(Some(Message {
                        tag: delivery.tag,
                        redelivered: delivery.redelivered,
                        body,
                    }))
                }
                Err(e) => {
                    warn!(tag = delivery.tag, "Discarding undecodable message: {}", e);
                    self.inner.nack(delivery.tag, false).await?;
                }
            }
        }
    }

    /// Acknowledge a message
    pub async fn ack(&self, tag: u64) -> Result<()> {
        self.inner.ack(tag).await
    }

    /// Reject a message
    pub async fn nack(&self, tag: u64, requeue: bool) -> Result<()> {
        self.inner.nack(tag, requeue).await
    }

    /// Close the underlying queue
    pub async fn close(&self) {
        self.inner.close().await;
    }
}
