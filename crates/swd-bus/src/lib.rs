//! In-process event bus: one broadcast topic per order.
//!
//! Publishers (workers) fire-and-forget; subscribers (the subscription
//! service) receive best-effort. The bus is **not** the source of truth —
//! every message reflects a state already persisted, and a reconnecting
//! client recovers anything lost via backfill.
//!
//! Topics are refcounted: the physical broadcast channel lives while at
//! least one [`TopicSubscription`] is held, and is removed when the last
//! guard drops. Publishing to an order nobody watches is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use uuid::Uuid;

use swd_schemas::OrderEvent;

/// Buffered events per topic. A subscriber that lags further than this
/// loses messages (and sees them again only through the order row).
const TOPIC_CAPACITY: usize = 256;

struct Topic {
    tx: broadcast::Sender<OrderEvent>,
    refs: usize,
}

/// Cloneable handle to the process-wide bus.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<Uuid, Topic>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event on its order's topic. Fire-and-forget: without an
    /// active topic (or with zero receivers) the event is dropped.
    pub fn publish(&self, event: &OrderEvent) {
        let topics = self.topics.lock().expect("bus lock poisoned");
        if let Some(topic) = topics.get(&event.order_id) {
            let _ = topic.tx.send(event.clone());
        }
    }

    /// Register a listener on an order's topic, creating the topic on first
    /// use. The returned guard unsubscribes on drop.
    pub fn subscribe(&self, order_id: Uuid) -> TopicSubscription {
        let mut topics = self.topics.lock().expect("bus lock poisoned");
        let topic = topics.entry(order_id).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(TOPIC_CAPACITY);
            Topic { tx, refs: 0 }
        });
        topic.refs += 1;
        TopicSubscription {
            order_id,
            rx: topic.tx.subscribe(),
            bus: self.clone(),
        }
    }

    /// Number of live topics (tests / observability).
    pub fn topic_count(&self) -> usize {
        self.topics.lock().expect("bus lock poisoned").len()
    }

    fn release(&self, order_id: Uuid) {
        let mut topics = self.topics.lock().expect("bus lock poisoned");
        if let Some(topic) = topics.get_mut(&order_id) {
            topic.refs -= 1;
            if topic.refs == 0 {
                topics.remove(&order_id);
            }
        }
    }
}

/// A live subscription to one order's topic. Dropping it releases the
/// refcount and removes the topic when it was the last holder.
pub struct TopicSubscription {
    order_id: Uuid,
    rx: broadcast::Receiver<OrderEvent>,
    bus: EventBus,
}

impl TopicSubscription {
    /// Next event, in publish order. Returns `None` when the topic closed.
    /// A lagged receiver skips ahead rather than erroring — the stream
    /// contract is best-effort and the database is authoritative.
    pub async fn recv(&mut self) -> Option<OrderEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn order_id(&self) -> Uuid {
        self.order_id
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.bus.release(self.order_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
