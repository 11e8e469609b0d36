//! Fan-out of the merged event stream to filtered subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Event, EventFilter};

/// Capacity of each subscriber's channel.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 32;

/// Identifies one subscription for [`Broadcaster::unsubscribe`].
pub type SubscriptionId = Uuid;

struct Subscriber {
    tx: mpsc::Sender<Event>,
    filter: Option<EventFilter>,
}

/// Delivers each event to every matching subscriber.
///
/// The broadcaster owns the subscriber channels: `unsubscribe` removes the
/// entry and drops the sender, closing the receiver exactly once. A slow
/// subscriber never blocks the broadcaster or its peers - a full channel
/// means the event is dropped for that subscriber only.
pub struct Broadcaster {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a subscriber receiving all events.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<Event>) {
        self.subscribe_filtered(None)
    }

    /// Registers a subscriber with an optional filter predicate.
    ///
    /// A `None` filter passes every event.
    pub fn subscribe_filtered(
        &self,
        filter: Option<EventFilter>,
    ) -> (SubscriptionId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = Uuid::new_v4();
        self.subscribers.write().insert(id, Subscriber { tx, filter });
        log::debug!("[Broadcaster] subscriber {id} registered");
        (id, rx)
    }

    /// Removes a subscription and closes its channel.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.subscribers.write().remove(&id).is_some() {
            log::debug!("[Broadcaster] subscriber {id} removed");
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Delivers `event` to every matching subscriber without blocking.
    pub fn broadcast(&self, event: &Event) {
        let subscribers = self.subscribers.read();
        for (id, subscriber) in subscribers.iter() {
            if let Some(filter) = &subscriber.filter {
                if !filter(event) {
                    continue;
                }
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "[Broadcaster] dropping {} for slow subscriber {id}",
                        event.event_type
                    );
                }
                // Receiver already gone; the owner will unsubscribe.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Spawns the driver task pumping the merged upstream into the broadcaster.
///
/// The driver terminates on cancellation or when the upstream closes.
pub fn spawn_driver(
    broadcaster: Arc<Broadcaster>,
    mut upstream: mpsc::Receiver<Event>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = upstream.recv() => {
                    match event {
                        Some(event) => {
                            tracing::trace!(event_type = %event.event_type, "broadcast");
                            broadcaster.broadcast(&event);
                        }
                        None => break,
                    }
                }
            }
        }
        log::debug!("[Broadcaster] driver stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{filter_from_query, EventType};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn filtered_subscriber_receives_only_matching_events() {
        let broadcaster = Broadcaster::new();
        let (_id, mut rx) =
            broadcaster.subscribe_filtered(filter_from_query(Some("audio.updated"), None));

        broadcaster.broadcast(&Event::new(EventType::PlayerUpdated, json!(null)));
        broadcaster.broadcast(&Event::new(EventType::AudioUpdated, json!({"x": 1})));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::AudioUpdated);
        assert_eq!(received.data["x"], 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err(),
            "only one event should pass the filter"
        );
    }

    #[tokio::test]
    async fn slow_subscriber_drops_without_blocking_peers() {
        let broadcaster = Broadcaster::new();
        let (_slow_id, mut slow_rx) = broadcaster.subscribe();
        let (_fast_id, mut fast_rx) = broadcaster.subscribe();

        // Overfill the slow subscriber's channel; broadcast must not block.
        let total = SUBSCRIBER_CHANNEL_CAPACITY + 8;
        for i in 0..total {
            broadcaster.broadcast(&Event::new(EventType::AudioUpdated, json!(i)));
        }

        let mut fast_count = 0;
        while fast_rx.try_recv().is_ok() {
            fast_count += 1;
        }
        // The fast subscriber also has a bounded channel; it keeps at most
        // the channel capacity, but nothing beyond capacity reached the
        // slow one either.
        assert_eq!(fast_count, SUBSCRIBER_CHANNEL_CAPACITY);

        let mut slow_count = 0;
        while slow_rx.try_recv().is_ok() {
            slow_count += 1;
        }
        assert_eq!(slow_count, SUBSCRIBER_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_channel() {
        let broadcaster = Broadcaster::new();
        let (id, mut rx) = broadcaster.subscribe();
        broadcaster.unsubscribe(id);
        assert!(rx.recv().await.is_none());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn driver_pumps_upstream_until_close() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (tx, upstream) = mpsc::channel(4);
        spawn_driver(Arc::clone(&broadcaster), upstream, CancellationToken::new());

        let (_id, mut rx) = broadcaster.subscribe();
        tx.send(Event::new(EventType::ServiceUpdated, json!("a")))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::ServiceUpdated);
        drop(tx);
    }
}
