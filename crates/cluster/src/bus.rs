//! Change bus delivering watch notifications.

use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::OwnerReference;
use crate::types::{ObjectKey, ResourceKind};

/// Default buffered notifications per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Updated,
    StatusChanged,
    Deleted,
}

/// A single watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: ResourceKind,
    pub change: ChangeKind,
    pub key: ObjectKey,
    /// UID of the object the event is about, when it has one.
    pub uid: Option<Uuid>,
    /// Controller owner of the object, for owned kinds.
    pub owner: Option<OwnerReference>,
}

impl WatchEvent {
    /// Notification about an Echo.
    pub fn echo(change: ChangeKind, key: ObjectKey, uid: Uuid) -> Self {
        Self {
            kind: ResourceKind::Echo,
            change,
            key,
            uid: Some(uid),
            owner: None,
        }
    }

    /// Notification about a job owned by `owner`.
    pub fn job(change: ChangeKind, key: ObjectKey, owner: OwnerReference) -> Self {
        Self {
            kind: ResourceKind::Job,
            change,
            key,
            uid: None,
            owner: Some(owner),
        }
    }
}

/// Pub/sub fan-out of watch notifications.
#[derive(Debug)]
pub struct ChangeBus {
    sender: broadcast::Sender<WatchEvent>,
}

impl ChangeBus {
    /// Create a bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Publishing with no subscribers is not an error; watches that start
    /// later resync from the store instead.
    pub fn publish(&self, event: WatchEvent) {
        trace!(kind = %event.kind, key = %event.key, change = ?event.change, "Publishing watch event");
        let _ = self.sender.send(event);
    }

    /// Open a new subscription.
    pub fn subscribe(&self) -> WatchSubscription {
        WatchSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// Subscription handle for receiving watch events.
pub struct WatchSubscription {
    receiver: broadcast::Receiver<WatchEvent>,
}

impl WatchSubscription {
    /// Receive the next event.
    ///
    /// # Errors
    ///
    /// Returns `Error::Lagged` when the subscriber fell behind and events were
    /// dropped, and `Error::ChannelClosed` once the bus is gone.
    pub async fn recv(&mut self) -> Result<WatchEvent> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Lagged(skipped) => Error::Lagged { skipped },
            broadcast::error::RecvError::Closed => Error::ChannelClosed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() -> Result<()> {
        let bus = ChangeBus::default();
        let mut sub = bus.subscribe();
        let key = ObjectKey::new("default", "hello");

        bus.publish(WatchEvent::echo(ChangeKind::Created, key.clone(), Uuid::new_v4()));

        let event = sub.recv().await?;
        assert_eq!(event.key, key);
        assert_eq!(event.kind, ResourceKind::Echo);
        Ok(())
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_told() {
        let bus = ChangeBus::new(1);
        let mut sub = bus.subscribe();
        for i in 0..3 {
            bus.publish(WatchEvent::echo(
                ChangeKind::Updated,
                ObjectKey::new("default", format!("e{i}")),
                Uuid::new_v4(),
            ));
        }
        assert!(matches!(sub.recv().await, Err(Error::Lagged { .. })));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = ChangeBus::default();
        bus.publish(WatchEvent::echo(
            ChangeKind::Deleted,
            ObjectKey::new("default", "gone"),
            Uuid::new_v4(),
        ));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
