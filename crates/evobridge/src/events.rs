//! Typed event dispatch for worker notifications.
//!
//! Worker-defined event names are open-ended, so [`EventName`] enumerates
//! the names this bridge knows about and keeps an `Other` escape hatch for
//! the rest. Dispatch is by owned subscriber list per name; names nobody
//! subscribed to are dropped, not buffered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// A known or worker-defined event name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    /// Worker announced itself after boot.
    ServerStarted,
    /// Evolution-engine progress notification.
    EngineProgress,
    /// Evolution run finished.
    EngineCompleted,
    /// Terminal lifecycle notification: the worker process is gone.
    /// Published locally by the bridge, exactly once per worker.
    WorkerExited,
    Other(String),
}

impl EventName {
    pub fn parse(name: &str) -> Self {
        match name {
            "server.started" => Self::ServerStarted,
            "engine.progress" => Self::EngineProgress,
            "engine.completed" => Self::EngineCompleted,
            "worker.exited" => Self::WorkerExited,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ServerStarted => "server.started",
            Self::EngineProgress => "engine.progress",
            Self::EngineCompleted => "engine.completed",
            Self::WorkerExited => "worker.exited",
            Self::Other(name) => name,
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

struct Entry {
    id: u64,
    handler: EventHandler,
}

/// Handle returned by [`EventBus::subscribe`], consumed by
/// [`EventBus::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    name: EventName,
    id: u64,
}

/// Synchronous pub/sub keyed by [`EventName`].
pub struct EventBus {
    subscribers: Mutex<HashMap<EventName, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, name: EventName, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            id,
            handler: Arc::new(handler),
        };
        let mut subscribers = self.lock();
        subscribers.entry(name.clone()).or_default().push(entry);
        Subscription { name, id }
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut subscribers = self.lock();
        let Some(entries) = subscribers.get_mut(&subscription.name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != subscription.id);
        let removed = entries.len() < before;
        if entries.is_empty() {
            subscribers.remove(&subscription.name);
        }
        removed
    }

    /// Invoke every handler registered for `name`, in registration order.
    ///
    /// The lock is released before handlers run, so a handler may
    /// subscribe or unsubscribe freely; a handler removed mid-publish
    /// still sees the event that was already in flight.
    pub fn publish(&self, name: &EventName, data: &Value) -> usize {
        let handlers: Vec<EventHandler> = {
            let subscribers = self.lock();
            subscribers
                .get(name)
                .map(|entries| entries.iter().map(|e| Arc::clone(&e.handler)).collect())
                .unwrap_or_default()
        };
        for handler in &handlers {
            handler(data);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self, name: &EventName) -> usize {
        self.lock().get(name).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EventName, Vec<Entry>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
