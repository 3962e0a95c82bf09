//! In-process event bus with wildcard subscriptions.
//!
//! Subscribers register a pattern: an exact event name
//! (`orderbook.updated`), a prefix wildcard (`orderbook.*`), or `*` for
//! everything. Dispatch fans out over `tokio::sync::broadcast` channels,
//! so a lagging subscriber loses its oldest undelivered events instead of
//! blocking publishers.

use crate::events::EventEnvelope;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Default per-subscriber buffer depth.
const DEFAULT_CAPACITY: usize = 256;

struct Subscription {
    pattern: String,
    tx: broadcast::Sender<EventEnvelope>,
}

/// Cheaply clonable handle to the process-wide bus.
#[derive(Clone)]
pub struct EventBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus with the given per-subscriber buffer depth.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            capacity,
        }
    }

    /// Subscribes to events matching `pattern`.
    ///
    /// Patterns are an exact name, a `prefix.*` wildcard, or `*`.
    pub fn subscribe(&self, pattern: impl Into<String>) -> broadcast::Receiver<EventEnvelope> {
        let pattern = pattern.into();
        let (tx, rx) = broadcast::channel(self.capacity);
        self.subscriptions
            .write()
            .push(Subscription { pattern, tx });
        rx
    }

    /// Publishes an envelope to every matching subscriber.
    ///
    /// Never blocks. Subscribers whose receivers have all been dropped are
    /// pruned lazily on the next publish.
    pub fn publish(&self, event: EventEnvelope) {
        let mut delivered = 0usize;
        {
            let subs = self.subscriptions.read();
            for sub in subs.iter() {
                if pattern_matches(&sub.pattern, &event.event_type) {
                    // send fails only when no receiver is alive.
                    if sub.tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        self.subscriptions
            .write()
            .retain(|s| s.tx.receiver_count() > 0);
        trace!(
            event_type = %event.event_type,
            delivered,
            "published event"
        );
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

/// Matches an event name against a subscription pattern.
fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    pattern == event_type
}
