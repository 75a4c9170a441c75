//! Typed, synchronous publish/subscribe for storage mutations.
//!
//! Handlers run on the emitting call stack in subscription order, so events
//! arrive in mutation order. A handler must not write the key whose change it
//! is handling; nothing enforces this.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, error};

use tracker_core::{MaterialMap, NavigationState, Project};

/// A completed storage mutation with old and new values.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageEvent {
    MaterialChanged {
        name: String,
        old: u64,
        new: u64,
    },
    /// Every material record was removed; `old` holds the readable quantities.
    InventoryReset {
        old: MaterialMap,
    },
    ProjectAdded(Project),
    ProjectRemoved(Project),
    ProjectUpdated {
        old: Project,
        new: Project,
    },
    NavigationChanged {
        old: NavigationState,
        new: NavigationState,
    },
    PriorityChanged {
        project: String,
        old: Option<u32>,
        new: Option<u32>,
    },
    DependenciesChanged {
        project: String,
        old: Vec<String>,
        new: Vec<String>,
    },
    PreferenceChanged {
        name: String,
        old: Option<Value>,
        new: Option<Value>,
    },
    /// Keys rewritten wholesale by a restore or migration.
    Restored {
        source: String,
        keys: usize,
    },
}

impl StorageEvent {
    /// Stable event name for logs and string-keyed consumers.
    pub fn name(&self) -> &'static str {
        match self {
            StorageEvent::MaterialChanged { .. } => "material-changed",
            StorageEvent::InventoryReset { .. } => "inventory-reset",
            StorageEvent::ProjectAdded(_) => "project-added",
            StorageEvent::ProjectRemoved(_) => "project-removed",
            StorageEvent::ProjectUpdated { .. } => "project-updated",
            StorageEvent::NavigationChanged { .. } => "navigation-changed",
            StorageEvent::PriorityChanged { .. } => "priority-changed",
            StorageEvent::DependenciesChanged { .. } => "dependencies-changed",
            StorageEvent::PreferenceChanged { .. } => "preference-changed",
            StorageEvent::Restored { .. } => "storage-restored",
        }
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

/// Event bus owned by the storage facade. Clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<(SubscriptionId, Handler)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.push((id, Arc::new(handler)));
        id
    }

    /// Returns false when `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Deliver `event` to every subscriber. A panicking handler is logged and skipped.
    pub fn emit(&self, event: &StorageEvent) {
        // Handlers are cloned out so one may subscribe or unsubscribe while running.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        debug!(event = event.name(), handlers = handlers.len(), "emit");
        for handler in handlers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
            if result.is_err() {
                error!(event = event.name(), "storage event handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn delivers_in_order_to_all_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |e| seen.lock().unwrap().push(format!("{tag}:{}", e.name())));
        }
        bus.emit(&StorageEvent::InventoryReset {
            old: MaterialMap::new(),
        });
        bus.emit(&StorageEvent::MaterialChanged {
            name: "Plywood".into(),
            old: 0,
            new: 1,
        });
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "a:inventory-reset",
                "b:inventory-reset",
                "a:material-changed",
                "b:material-changed"
            ]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&StorageEvent::InventoryReset {
            old: MaterialMap::new(),
        });
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&StorageEvent::InventoryReset {
            old: MaterialMap::new(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        bus.subscribe(|_| panic!("boom"));
        let c = Arc::clone(&count);
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&StorageEvent::InventoryReset {
            old: MaterialMap::new(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
