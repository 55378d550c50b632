//! A typed, in-process publish/subscribe bus.
//!
//! Every subscriber gets its own bounded `tokio::mpsc` channel so one slow
//! consumer only ever backpressures itself — `publish` awaits each
//! subscriber's send in turn, so a single stalled subscriber does delay
//! delivery to the others, but never drops an event for them.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::error::BusError;
use crate::types::{FileEvent, ReconcileResult, RememberedPathRemovedEvent};

/// The closed set of event kinds the bus carries. Every subscription
/// currently receives the full stream — there is no per-kind filtering —
/// which models the "wildcard subscriber" case the contract allows.
#[derive(Debug, Clone)]
pub enum Event {
    FileDiscovered(FileEvent),
    FileChanged(FileEvent),
    FileModified(FileEvent),
    PathDeleted { path: String },
    RememberedPathAdded { path: String },
    RememberedPathRemoved(RememberedPathRemovedEvent),
    AnalysisCompleted { path: String, stage: &'static str },
    AnalysisFailed { path: String, stage: &'static str, error: String },
    ReconcileTick,
    ReconcileCompleted(ReconcileResult),
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Event>,
}

/// The bus itself. Cheap to clone via `Arc` at the call site; the bus does
/// not clone itself.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()), next_id: AtomicU64::new(1), closed: AtomicBool::new(false) }
    }

    /// Registers a new subscriber with a channel bounded at `capacity`.
    /// Returns a [`Subscription`] that unregisters itself on drop.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        self.subscribers.lock().push(Subscriber { id, sender });
        Subscription { id, receiver }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Delivers `event` to every live subscriber, awaiting each send so a
    /// full channel backpressures the publisher rather than dropping the
    /// event. Subscribers whose receiver has been dropped are pruned.
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let senders: Vec<(u64, mpsc::Sender<Event>)> =
            self.subscribers.lock().iter().map(|s| (s.id, s.sender.clone())).collect();

        let mut dead = Vec::new();
        for (id, sender) in senders {
            if sender.send(event.clone()).await.is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            self.subscribers.lock().retain(|s| !dead.contains(&s.id));
        }
        Ok(())
    }

    /// Marks the bus closed. Existing subscriptions keep draining whatever
    /// is already buffered; further [`EventBus::publish`] calls fail with
    /// [`BusError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A live subscription. Dropping it unregisters the subscriber from future
/// publishes (the channel simply has no more senders).
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(4);
        let mut b = bus.subscribe(4);

        bus.publish(Event::PathDeleted { path: "/tmp/x".into() }).await.unwrap();

        assert!(matches!(a.recv().await, Some(Event::PathDeleted { .. })));
        assert!(matches!(b.recv().await, Some(Event::PathDeleted { .. })));
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_next_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe(1);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);

        bus.publish(Event::PathDeleted { path: "/tmp/x".into() }).await.unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let bus = EventBus::new();
        bus.close();
        let err = bus.publish(Event::PathDeleted { path: "/tmp/x".into() }).await.unwrap_err();
        assert_eq!(err, BusError::Closed);
    }

    #[tokio::test]
    async fn slow_subscriber_backpressures_without_losing_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(1);

        bus.publish(Event::PathDeleted { path: "/a".into() }).await.unwrap();
        let publish_second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            bus.publish(Event::PathDeleted { path: "/b".into() }),
        )
        .await;
        assert!(publish_second.is_err(), "second publish should block on the full channel");

        assert!(matches!(sub.recv().await, Some(Event::PathDeleted { path, .. }) if path == "/a"));
    }
}
