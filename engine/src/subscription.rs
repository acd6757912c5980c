//! Per-path change subscribers.
//!
//! Subscribers register a callback under a document path (the root path for
//! whole-document interest). Registration order is preserved for invocation
//! order. Removal is by [`SubscriptionId`] and/or path.

use crate::path::{self, Path};
use serde_json::Value;

/// Identifies one registered subscriber.
pub type SubscriptionId = u64;

/// Callback invoked with a copy of the value at the subscribed path, `None`
/// when the path no longer resolves.
pub type SubscriptionCallback = Box<dyn FnMut(Option<Value>)>;

struct Entry {
    id: SubscriptionId,
    path: Path,
    callback: SubscriptionCallback,
}

/// Ordered registry of path subscribers.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Entry>,
    next_id: SubscriptionId,
}

impl SubscriptionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no subscribers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reserve an id without registering; used when registration is deferred
    /// until the record becomes ready.
    pub fn reserve_id(&mut self) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register `callback` under `path` with a fresh id.
    pub fn add(&mut self, path: Path, callback: SubscriptionCallback) -> SubscriptionId {
        let id = self.reserve_id();
        self.add_with_id(id, path, callback);
        id
    }

    /// Register `callback` under a previously reserved id.
    pub fn add_with_id(&mut self, id: SubscriptionId, path: Path, callback: SubscriptionCallback) {
        self.entries.push(Entry { id, path, callback });
    }

    /// Remove subscribers matching the given criteria. An id removes that
    /// one registration; a path alone removes every registration under it.
    /// With neither, nothing is removed.
    pub fn remove(&mut self, path: Option<&Path>, id: Option<SubscriptionId>) {
        match (path, id) {
            (_, Some(id)) => self.entries.retain(|e| e.id != id),
            (Some(path), None) => self.entries.retain(|e| &e.path != path),
            (None, None) => {}
        }
    }

    /// Remove every subscriber.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Invoke the subscriber `id` once with the current value of its path.
    pub fn invoke(&mut self, id: SubscriptionId, document: &Value) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            let value = path::get_value(document, &entry.path).cloned();
            (entry.callback)(value);
        }
    }

    /// Compare `old` and `new` at every subscribed path and invoke, in
    /// registration order, each subscriber whose resolved value changed.
    /// Change detection is structural equality.
    pub fn notify_changed(&mut self, old: &Value, new: &Value) {
        for entry in &mut self.entries {
            let before = path::get_value(old, &entry.path);
            let after = path::get_value(new, &entry.path);
            if before != after {
                (entry.callback)(after.cloned());
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("len", &self.entries.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}
