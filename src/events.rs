//! Topic subscriptions: a light observer keyed by event topic.
//!
//! Delivery is same-thread, synchronous and post-commit; the engine fires
//! callbacks only after the underlying store transaction has committed. A
//! panicking callback is caught and logged so it cannot corrupt engine
//! state or starve the remaining subscribers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Notification topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Activities,
    Groups,
    Sections,
    SyncReset,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Activities => "activities",
            Topic::Groups => "groups",
            Topic::Sections => "sections",
            Topic::SyncReset => "syncReset",
        }
    }
}

/// Zero-argument subscriber callback.
pub type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Opaque handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registry of topic subscribers.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: u64,
    subscribers: HashMap<u64, (Topic, Callback)>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, topic: Topic, callback: Callback) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, (topic, callback));
        SubscriptionId(id)
    }

    /// Returns true when the subscription existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id.0).is_some()
    }

    /// Snapshot the callbacks for a topic. Callers invoke them outside the
    /// registry lock so a callback may itself subscribe or unsubscribe.
    pub fn callbacks_for(&self, topic: Topic) -> Vec<Callback> {
        self.subscribers
            .values()
            .filter(|(t, _)| *t == topic)
            .map(|(_, cb)| Arc::clone(cb))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

/// Invoke a snapshot of callbacks, catching panics per subscriber.
pub fn deliver(topic: Topic, callbacks: &[Callback]) {
    for cb in callbacks {
        if catch_unwind(AssertUnwindSafe(|| cb())).is_err() {
            log::warn!(
                "[Events] Subscriber for '{}' panicked; continuing",
                topic.as_str()
            );
        }
    }
}
