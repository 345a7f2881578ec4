//! Typed event bus with bounded per-entity history
//!
//! Every guard owns a bus and publishes immutable events describing what it
//! just did. Consumers subscribe per event kind or as wildcards; delivery is
//! synchronous on the publishing thread. A consumer failure is contained: it
//! is caught, logged, and never reaches the guard's call path or the other
//! consumers.
//!
//! Published events are also retained in a bounded FIFO ring per entity name
//! so observers that attach late can read what happened. The ring drops the
//! oldest event when full and never blocks a publisher.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Contract every bus event satisfies.
pub trait BusEvent: Clone + Send + 'static {
    /// Discriminant used for per-kind subscriptions.
    type Kind: Copy + PartialEq + Send + Sync + fmt::Debug + 'static;

    /// Name of the guard or registry entry this event belongs to.
    fn entity_name(&self) -> &str;

    /// The event's kind tag.
    fn kind(&self) -> Self::Kind;
}

type Consumer<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscription<E: BusEvent> {
    filter: Option<E::Kind>,
    consumer: Consumer<E>,
}

/// Publish/subscribe bus for one event type.
pub struct EventBus<E: BusEvent> {
    subscriptions: RwLock<Vec<Subscription<E>>>,
    history: Mutex<HashMap<String, VecDeque<E>>>,
    history_capacity: usize,
}

impl<E: BusEvent> EventBus<E> {
    /// Default number of events retained per entity name.
    pub const DEFAULT_HISTORY_CAPACITY: usize = 128;

    /// Create a bus with the default history capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a bus retaining up to `capacity` events per entity name.
    /// A capacity of zero disables history retention entirely.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            history_capacity: capacity,
        }
    }

    /// Subscribe to every event published on this bus.
    pub fn on_event<F>(&self, consumer: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscriptions.write().push(Subscription {
            filter: None,
            consumer: Arc::new(consumer),
        });
    }

    /// Subscribe to events of one kind only.
    pub fn on_kind<F>(&self, kind: E::Kind, consumer: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscriptions.write().push(Subscription {
            filter: Some(kind),
            consumer: Arc::new(consumer),
        });
    }

    /// Number of registered consumers.
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// True when at least one consumer is registered.
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Publish an event: append it to the entity's history ring, then
    /// deliver to matching consumers.
    ///
    /// Delivery happens outside the subscription lock so a consumer may
    /// itself subscribe without deadlocking.
    pub fn publish(&self, event: E) {
        if self.history_capacity > 0 {
            let mut history = self.history.lock();
            let ring = history.entry(event.entity_name().to_string()).or_default();
            if ring.len() == self.history_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        let matching: Vec<Consumer<E>> = {
            let subs = self.subscriptions.read();
            subs.iter()
                .filter(|s| s.filter.is_none() || s.filter == Some(event.kind()))
                .map(|s| Arc::clone(&s.consumer))
                .collect()
        };

        for consumer in matching {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| consumer(&event)));
            if delivered.is_err() {
                tracing::warn!(
                    entity = event.entity_name(),
                    kind = ?event.kind(),
                    "event consumer panicked during delivery; consumer skipped"
                );
            }
        }
    }

    /// Buffered events for `name`, oldest first.
    pub fn recent_events(&self, name: &str) -> Vec<E> {
        self.history
            .lock()
            .get(name)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the buffered history for `name`.
    pub fn clear_history(&self, name: &str) {
        self.history.lock().remove(name);
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("history_capacity", &self.history_capacity)
            .finish()
    }
}
