//! Typed publish/subscribe with explicit unsubscribe tokens.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::warn;

/// Events routed by topic name.
pub trait Topic {
    /// Name handlers subscribe to.
    fn topic(&self) -> &str;
}

/// Token returned by [`EventBus::on`] and [`EventBus::on_any`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    by_topic: HashMap<String, Vec<(SubscriptionId, Handler<E>)>>,
    wildcard: Vec<(SubscriptionId, Handler<E>)>,
}

/// Topic to ordered handler list. Handlers run in subscription order.
pub struct EventBus<E> {
    next_id: AtomicU64,
    registry: Mutex<Registry<E>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            registry: Mutex::new(Registry {
                by_topic: HashMap::new(),
                wildcard: Vec::new(),
            }),
        }
    }
}

impl<E: Topic> EventBus<E> {
    /// Bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a single topic.
    pub fn on<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.registry()
            .by_topic
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Subscribe to every topic.
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.registry().wildcard.push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns `false` if the token was unknown.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry();
        if let Some(position) = registry.wildcard.iter().position(|(sub, _)| *sub == id) {
            registry.wildcard.remove(position);
            return true;
        }
        for handlers in registry.by_topic.values_mut() {
            if let Some(position) = handlers.iter().position(|(sub, _)| *sub == id) {
                handlers.remove(position);
                return true;
            }
        }
        false
    }

    /// Deliver `event` to topic subscribers, then to wildcard subscribers.
    ///
    /// Handlers run outside the registry lock so they may subscribe or unsubscribe. A panicking
    /// handler is logged and skipped.
    pub fn publish(&self, event: &E) {
        let handlers: Vec<Handler<E>> = {
            let registry = self.registry();
            registry
                .by_topic
                .get(event.topic())
                .into_iter()
                .flatten()
                .chain(registry.wildcard.iter())
                .map(|(_, handler)| handler.clone())
                .collect()
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(topic = event.topic(), "event handler panicked");
            }
        }
    }

    /// Number of handlers that would receive an event on `topic`.
    pub fn handler_count(&self, topic: &str) -> usize {
        let registry = self.registry();
        registry.by_topic.get(topic).map_or(0, Vec::len) + registry.wildcard.len()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Ping(&'static str);

    impl Topic for Ping {
        fn topic(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second"] {
            let seen = seen.clone();
            bus.on("tick", move |_: &Ping| seen.lock().unwrap().push(label));
        }
        let wildcard_seen = seen.clone();
        bus.on_any(move |_: &Ping| wildcard_seen.lock().unwrap().push("any"));

        bus.publish(&Ping("tick"));
        bus.publish(&Ping("other"));

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "any", "any"]);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));

        let c1 = count.clone();
        let first = bus.on("tick", move |_: &Ping| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        bus.on("tick", move |_: &Ping| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        assert!(bus.off(first));
        assert!(!bus.off(first));
        bus.publish(&Ping("tick"));

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(bus.handler_count("tick"), 1);
    }

    #[test]
    fn panicking_handler_does_not_break_delivery() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicU64::new(0));

        bus.on("tick", |_: &Ping| panic!("boom"));
        let d = delivered.clone();
        bus.on("tick", move |_: &Ping| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&Ping("tick"));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
