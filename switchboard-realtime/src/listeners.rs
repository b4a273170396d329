//! Per-event listener registry

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`ListenerRegistry::on`], needed to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(ListenerId, Handler)>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, handler: Handler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Returns whether the listener was registered
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    /// Invoke every handler for `event`; returns how many ran.
    ///
    /// Handlers run outside the lock so they may register or unregister.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let handlers: Vec<Handler> = match self.handlers.read().get(event) {
            Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn count(&self, event: &str) -> usize {
        self.handlers.read().get(event).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }
}
