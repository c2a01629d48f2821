//! Fan-out channel for control signals
//!
//! Every worker subscribes and filters by top task id locally.

use tokio::sync::broadcast;
use tracing::{debug, warn};
use transfers_types::ControlMessage;

/// Broadcast channel for [`ControlMessage`]s
#[derive(Debug, Clone)]
pub struct ControlChannel {
    sender: broadcast::Sender<ControlMessage>,
}

impl ControlChannel {
    /// Create a channel buffering up to `capacity` messages per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver `message` to every current subscriber. Returns how many received it.
    pub fn publish(&self, message: ControlMessage) -> usize {
        let task_id = message.task_id;
        match self.sender.send(message) {
            Ok(receivers) => {
                debug!(%task_id, receivers, "Published control message");
                receivers
            }
            // Nobody is listening, so nothing is in flight either.
            Err(_) => 0,
        }
    }

    /// Start receiving messages published from now on
    pub fn subscribe(&self) -> ControlSubscriber {
        ControlSubscriber {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiving end of a [`ControlChannel`]
#[derive(Debug)]
pub struct ControlSubscriber {
    receiver: broadcast::Receiver<ControlMessage>,
}

impl ControlSubscriber {
    /// Next message, `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Control subscriber lagged, messages were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let channel = ControlChannel::new(8);
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();

        let task_id = Uuid::new_v4();
        assert_eq!(channel.publish(ControlMessage::cancel(task_id, "t1")), 2);
        assert_eq!(first.recv().await.unwrap().task_id, task_id);
        assert_eq!(second.recv().await.unwrap().task_id, task_id);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let channel = ControlChannel::new(8);
        assert_eq!(channel.publish(ControlMessage::cancel(Uuid::new_v4(), "t1")), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_receiving() {
        let channel = ControlChannel::new(1);
        let mut subscriber = channel.subscribe();
        let last = Uuid::new_v4();
        channel.publish(ControlMessage::cancel(Uuid::new_v4(), "t1"));
        channel.publish(ControlMessage::cancel(last, "t1"));
        assert_eq!(subscriber.recv().await.unwrap().task_id, last);
    }
}
