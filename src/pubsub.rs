//! Typed publish/subscribe broker.
//!
//! Each subscriber owns an unbounded queue, so `publish` never waits on a slow
//! or absent consumer. Events published by one producer reach every subscriber
//! in publish order; there is no ordering guarantee across producers.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

/// What happened to the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// Envelope delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: T,
}

pub type SubscriptionId = u64;

struct Inner<T> {
    subscribers: RwLock<HashMap<SubscriptionId, mpsc::UnboundedSender<Event<T>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<T> Inner<T> {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<SubscriptionId, mpsc::UnboundedSender<Event<T>>>> {
        match self.subscribers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(
        &self,
    ) -> RwLockWriteGuard<'_, HashMap<SubscriptionId, mpsc::UnboundedSender<Event<T>>>> {
        match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Fan-out broker for one event type.
///
/// Cloning is cheap; all clones share the same subscriber list.
pub struct Broker<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Broker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Broker<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a new subscriber. After shutdown the returned stream is
    /// already closed.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            // The closed check happens under the write lock so it cannot race
            // with `shutdown` clearing the map.
            let mut subscribers = self.inner.write();
            if !self.inner.closed.load(Ordering::SeqCst) {
                subscribers.insert(id, tx);
            }
        }
        Subscription {
            id,
            rx,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `payload` to every current subscriber. No-op after shutdown.
    pub fn publish(&self, kind: EventKind, payload: T) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut dead = Vec::new();
        {
            let subscribers = self.inner.read();
            for (id, tx) in subscribers.iter() {
                let event = Event {
                    kind,
                    payload: payload.clone(),
                };
                if tx.send(event).is_err() {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.inner.write();
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }

    /// Stop delivery to one subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.write().remove(&id);
    }

    /// Close every subscriber stream; later publishes are dropped.
    pub fn shutdown(&self) {
        let mut subscribers = self.inner.write();
        self.inner.closed.store(true, Ordering::SeqCst);
        subscribers.clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.read().len()
    }
}

/// Receiving half of a subscription. Implements [`Stream`].
///
/// Dropping it unsubscribes.
pub struct Subscription<T> {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Event<T>>,
    broker: Weak<Inner<T>>,
}

impl<T> Subscription<T> {
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event; `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event<T>> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.broker.upgrade() {
            inner.write().remove(&self.id);
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Event<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() {
        let broker = Broker::new();
        let mut first = broker.subscribe();
        let mut second = broker.subscribe();

        for n in 0..5 {
            broker.publish(EventKind::Created, n);
        }

        for sub in [&mut first, &mut second] {
            let mut seen = Vec::new();
            for _ in 0..5 {
                seen.push(sub.recv().await.expect("event").payload);
            }
            assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn publish_without_draining_never_blocks() {
        let broker = Broker::new();
        let _idle = broker.subscribe();
        for n in 0..10_000 {
            broker.publish(EventKind::Updated, n);
        }
        assert_eq!(broker.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_closes_stream_after_drain() {
        let broker = Broker::new();
        let mut sub = broker.subscribe();
        broker.publish(EventKind::Created, "a");
        broker.unsubscribe(sub.id());
        broker.publish(EventKind::Created, "b");

        assert_eq!(sub.recv().await.map(|e| e.payload), Some("a"));
        assert!(sub.recv().await.is_none());
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_all_streams_and_ignores_later_publishes() {
        let broker = Broker::new();
        let sub = broker.subscribe();
        broker.shutdown();
        broker.publish(EventKind::Created, 1);

        let collected: Vec<_> = sub.collect().await;
        assert!(collected.is_empty());
        assert!(broker.is_closed());

        let mut late = broker.subscribe();
        assert!(late.recv().await.is_none());
    }

    #[test]
    fn dropped_subscription_is_removed() {
        let broker: Broker<u8> = Broker::new();
        let sub = broker.subscribe();
        assert_eq!(broker.subscriber_count(), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[test]
    fn concurrent_subscribe_and_publish_do_not_corrupt_state() {
        let broker: Broker<usize> = Broker::new();
        let mut handles = Vec::new();
        for worker in 0..4 {
            let broker = broker.clone();
            handles.push(std::thread::spawn(move || {
                for n in 0..200 {
                    let sub = broker.subscribe();
                    broker.publish(EventKind::Updated, worker * 1000 + n);
                    drop(sub);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert_eq!(broker.subscriber_count(), 0);
    }
}
