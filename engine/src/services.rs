//! Collaborator interfaces the engine depends on.
//!
//! The engine performs no I/O of its own. Every outbound effect - network
//! sends, offline persistence, timeout and timer registration, dirty-flag
//! tracking, merge resolution - goes through one of these traits, injected
//! through [`Services`]. Completions of asynchronous requests re-enter the
//! engine through its explicit `on_*` methods, driven by whatever runtime
//! (or test) owns the record.
//!
//! Mock and in-memory implementations live here so tests and embedders can
//! wire a record without a real transport.

use crate::message::{RecordAction, RecordMessage};
use crate::Version;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

/// Handle to a registered response timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutHandle(pub u64);

/// Handle to a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// A timeout awaiting a specific response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseTimeout {
    /// The action whose response is awaited.
    pub action: RecordAction,
    /// The record name the response concerns.
    pub name: String,
    /// How long to wait before the registry reports the timeout. Expiry
    /// policy lives in the registry, not the engine.
    pub duration: Duration,
}

/// A conflict handed to the merge strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequest {
    /// Record name.
    pub name: String,
    /// Local version at conflict time, `None` before first sync.
    pub local_version: Option<Version>,
    /// Local document at conflict time.
    pub local_data: Value,
    /// Authoritative remote version.
    pub remote_version: Version,
    /// Authoritative remote document.
    pub remote_data: Value,
}

/// Network connection to the record server.
pub trait Connection {
    /// Whether the connection is currently established.
    fn is_connected(&self) -> bool;

    /// Send a protocol message.
    fn send(&self, message: RecordMessage);

    /// Register interest in connection lifecycle signals for `name`. The
    /// driver delivers them via `RecordCore::on_connection_reestablished`
    /// and `RecordCore::on_connection_lost`.
    fn watch_lifecycle(&self, name: &str);

    /// Release the lifecycle interest registered for `name`.
    fn unwatch_lifecycle(&self, name: &str);
}

/// Durable offline storage for record documents.
pub trait Storage {
    /// Request the stored version and data for `name`. The result is
    /// delivered by the driver via `RecordCore::on_storage_loaded`.
    fn load(&self, name: &str);

    /// Persist `data` at `version` for `name`.
    fn store(&self, name: &str, version: Version, data: &Value);

    /// Remove any stored state for `name`.
    fn remove(&self, name: &str);
}

/// Registry of response timeouts keyed by (action, record name).
pub trait TimeoutRegistry {
    /// Register a timeout; returns a handle for cancellation.
    fn add(&self, timeout: ResponseTimeout) -> TimeoutHandle;

    /// Cancel the timeout matching a received response message.
    fn remove(&self, action: RecordAction, name: &str);

    /// Cancel a timeout by handle.
    fn clear(&self, handle: TimeoutHandle);
}

/// Registry of one-shot timers.
pub trait TimerRegistry {
    /// Schedule a timer; expiry is delivered by the driver via
    /// `RecordCore::on_timer_fired` with the returned handle.
    fn add(&self, duration: Duration) -> TimerHandle;

    /// Cancel a scheduled timer.
    fn remove(&self, handle: TimerHandle);

    /// Run `task` at the next idle opportunity. Used to keep even trivial
    /// completions (no-op writes) asynchronous from the caller's view.
    fn request_idle(&self, task: Box<dyn FnOnce()>);
}

/// Tracks which records hold offline modifications awaiting reconciliation.
pub trait DirtyTracker {
    /// Whether `name` was modified while offline.
    fn is_dirty(&self, name: &str) -> bool;

    /// Mark or clear the dirty flag for `name`.
    fn set_dirty(&self, name: &str, dirty: bool);
}

/// Pluggable conflict resolution.
pub trait MergeResolver {
    /// Select the merge strategy used for `name`.
    fn set_strategy(&self, name: &str, strategy: &str);

    /// Resolve a version conflict. The outcome is delivered by the driver
    /// via `RecordCore::on_record_recovered`.
    fn merge(&self, request: MergeRequest);
}

/// The full set of injected collaborators, shared across records.
#[derive(Clone)]
pub struct Services {
    /// Network connection.
    pub connection: Rc<dyn Connection>,
    /// Offline storage.
    pub storage: Rc<dyn Storage>,
    /// Response timeouts.
    pub timeouts: Rc<dyn TimeoutRegistry>,
    /// One-shot timers.
    pub timers: Rc<dyn TimerRegistry>,
    /// Offline-modification tracking.
    pub dirty: Rc<dyn DirtyTracker>,
    /// Conflict resolution.
    pub merges: Rc<dyn MergeResolver>,
}

// ---------------------------------------------------------------------------
// Mock / in-memory implementations
// ---------------------------------------------------------------------------

/// A mock connection recording everything sent through it.
#[derive(Default)]
pub struct MockConnection {
    connected: Cell<bool>,
    sent: RefCell<Vec<RecordMessage>>,
    watched: RefCell<Vec<String>>,
    unwatched: RefCell<Vec<String>>,
}

impl MockConnection {
    /// A connected mock.
    pub fn new() -> Self {
        let conn = Self::default();
        conn.connected.set(true);
        conn
    }

    /// Flip the connected flag.
    pub fn set_connected(&self, connected: bool) {
        self.connected.set(connected);
    }

    /// All messages sent so far.
    pub fn sent(&self) -> Vec<RecordMessage> {
        self.sent.borrow().clone()
    }

    /// Drain the sent messages.
    pub fn take_sent(&self) -> Vec<RecordMessage> {
        self.sent.borrow_mut().drain(..).collect()
    }

    /// How many times lifecycle interest was registered for `name`.
    pub fn watch_count(&self, name: &str) -> usize {
        self.watched.borrow().iter().filter(|n| *n == name).count()
    }

    /// How many times lifecycle interest was released for `name`.
    pub fn unwatch_count(&self, name: &str) -> usize {
        self.unwatched.borrow().iter().filter(|n| *n == name).count()
    }
}

impl Connection for MockConnection {
    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn send(&self, message: RecordMessage) {
        self.sent.borrow_mut().push(message);
    }

    fn watch_lifecycle(&self, name: &str) {
        self.watched.borrow_mut().push(name.to_string());
    }

    fn unwatch_lifecycle(&self, name: &str) {
        self.unwatched.borrow_mut().push(name.to_string());
    }
}

/// In-memory storage recording load requests for the test driver to answer.
#[derive(Default)]
pub struct MemoryStorage {
    records: RefCell<HashMap<String, (Version, Value)>>,
    load_requests: RefCell<Vec<String>>,
    removed: RefCell<Vec<String>>,
}

impl MemoryStorage {
    /// An empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a stored record.
    pub fn insert(&self, name: impl Into<String>, version: Version, data: Value) {
        self.records.borrow_mut().insert(name.into(), (version, data));
    }

    /// The stored version/data for `name`, if any.
    pub fn stored(&self, name: &str) -> Option<(Version, Value)> {
        self.records.borrow().get(name).cloned()
    }

    /// Drain the pending load requests.
    pub fn take_load_requests(&self) -> Vec<String> {
        self.load_requests.borrow_mut().drain(..).collect()
    }

    /// Names removed so far.
    pub fn removed(&self) -> Vec<String> {
        self.removed.borrow().clone()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, name: &str) {
        self.load_requests.borrow_mut().push(name.to_string());
    }

    fn store(&self, name: &str, version: Version, data: &Value) {
        self.insert(name, version, data.clone());
    }

    fn remove(&self, name: &str) {
        self.records.borrow_mut().remove(name);
        self.removed.borrow_mut().push(name.to_string());
    }
}

/// A mock timeout registry tracking live and released handles.
#[derive(Default)]
pub struct MockTimeoutRegistry {
    next: Cell<u64>,
    active: RefCell<Vec<(TimeoutHandle, RecordAction, String)>>,
    cleared: RefCell<Vec<TimeoutHandle>>,
    removed: RefCell<Vec<(RecordAction, String)>>,
}

impl MockTimeoutRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timeouts still registered.
    pub fn active_count(&self) -> usize {
        self.active.borrow().len()
    }

    /// Actions of the timeouts still registered.
    pub fn active_actions(&self) -> Vec<RecordAction> {
        self.active.borrow().iter().map(|(_, a, _)| *a).collect()
    }

    /// Handles released via `clear`, in release order.
    pub fn cleared(&self) -> Vec<TimeoutHandle> {
        self.cleared.borrow().clone()
    }

    /// (action, name) pairs cancelled via `remove`.
    pub fn removed(&self) -> Vec<(RecordAction, String)> {
        self.removed.borrow().clone()
    }
}

impl TimeoutRegistry for MockTimeoutRegistry {
    fn add(&self, timeout: ResponseTimeout) -> TimeoutHandle {
        let handle = TimeoutHandle(self.next.get());
        self.next.set(self.next.get() + 1);
        self.active
            .borrow_mut()
            .push((handle, timeout.action, timeout.name));
        handle
    }

    fn remove(&self, action: RecordAction, name: &str) {
        self.active
            .borrow_mut()
            .retain(|(_, a, n)| !(*a == action && n == name));
        self.removed.borrow_mut().push((action, name.to_string()));
    }

    fn clear(&self, handle: TimeoutHandle) {
        self.active.borrow_mut().retain(|(h, _, _)| *h != handle);
        self.cleared.borrow_mut().push(handle);
    }
}

/// A mock timer registry. Idle tasks run immediately unless deferred.
pub struct MockTimerRegistry {
    next: Cell<u64>,
    active: RefCell<Vec<(TimerHandle, Duration)>>,
    removed: RefCell<Vec<TimerHandle>>,
    defer_idle: Cell<bool>,
    idle_tasks: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl MockTimerRegistry {
    /// A registry that runs idle tasks inline.
    pub fn new() -> Self {
        Self {
            next: Cell::new(0),
            active: RefCell::new(Vec::new()),
            removed: RefCell::new(Vec::new()),
            defer_idle: Cell::new(false),
            idle_tasks: RefCell::new(Vec::new()),
        }
    }

    /// Queue idle tasks instead of running them inline.
    pub fn defer_idle(&self) {
        self.defer_idle.set(true);
    }

    /// Run all queued idle tasks in submission order.
    pub fn run_idle_tasks(&self) {
        let tasks: Vec<_> = self.idle_tasks.borrow_mut().drain(..).collect();
        for task in tasks {
            task();
        }
    }

    /// Timers still scheduled.
    pub fn active(&self) -> Vec<(TimerHandle, Duration)> {
        self.active.borrow().clone()
    }

    /// Handles cancelled so far.
    pub fn removed(&self) -> Vec<TimerHandle> {
        self.removed.borrow().clone()
    }
}

impl Default for MockTimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerRegistry for MockTimerRegistry {
    fn add(&self, duration: Duration) -> TimerHandle {
        let handle = TimerHandle(self.next.get());
        self.next.set(self.next.get() + 1);
        self.active.borrow_mut().push((handle, duration));
        handle
    }

    fn remove(&self, handle: TimerHandle) {
        self.active.borrow_mut().retain(|(h, _)| *h != handle);
        self.removed.borrow_mut().push(handle);
    }

    fn request_idle(&self, task: Box<dyn FnOnce()>) {
        if self.defer_idle.get() {
            self.idle_tasks.borrow_mut().push(task);
        } else {
            task();
        }
    }
}

/// In-memory dirty tracker.
#[derive(Default)]
pub struct MemoryDirtyTracker {
    dirty: RefCell<HashSet<String>>,
}

impl MemoryDirtyTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DirtyTracker for MemoryDirtyTracker {
    fn is_dirty(&self, name: &str) -> bool {
        self.dirty.borrow().contains(name)
    }

    fn set_dirty(&self, name: &str, dirty: bool) {
        if dirty {
            self.dirty.borrow_mut().insert(name.to_string());
        } else {
            self.dirty.borrow_mut().remove(name);
        }
    }
}

/// A mock merge resolver recording requests for the test driver to resolve.
#[derive(Default)]
pub struct MockMergeResolver {
    strategies: RefCell<HashMap<String, String>>,
    requests: RefCell<Vec<MergeRequest>>,
}

impl MockMergeResolver {
    /// An empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// The strategy selected for `name`, if any.
    pub fn strategy(&self, name: &str) -> Option<String> {
        self.strategies.borrow().get(name).cloned()
    }

    /// Drain the pending merge requests.
    pub fn take_requests(&self) -> Vec<MergeRequest> {
        self.requests.borrow_mut().drain(..).collect()
    }
}

impl MergeResolver for MockMergeResolver {
    fn set_strategy(&self, name: &str, strategy: &str) {
        self.strategies
            .borrow_mut()
            .insert(name.to_string(), strategy.to_string());
    }

    fn merge(&self, request: MergeRequest) {
        self.requests.borrow_mut().push(request);
    }
}

/// A fully wired mock service set, keeping the concrete handles accessible
/// for assertions while exposing them as [`Services`] to the engine.
pub struct MockServices {
    /// Mock connection.
    pub connection: Rc<MockConnection>,
    /// In-memory storage.
    pub storage: Rc<MemoryStorage>,
    /// Mock timeout registry.
    pub timeouts: Rc<MockTimeoutRegistry>,
    /// Mock timer registry.
    pub timers: Rc<MockTimerRegistry>,
    /// In-memory dirty tracker.
    pub dirty: Rc<MemoryDirtyTracker>,
    /// Mock merge resolver.
    pub merges: Rc<MockMergeResolver>,
}

impl MockServices {
    /// A connected mock environment.
    pub fn new() -> Self {
        Self {
            connection: Rc::new(MockConnection::new()),
            storage: Rc::new(MemoryStorage::new()),
            timeouts: Rc::new(MockTimeoutRegistry::new()),
            timers: Rc::new(MockTimerRegistry::new()),
            dirty: Rc::new(MemoryDirtyTracker::new()),
            merges: Rc::new(MockMergeResolver::new()),
        }
    }

    /// The trait-object view handed to the engine.
    pub fn services(&self) -> Services {
        Services {
            connection: self.connection.clone(),
            storage: self.storage.clone(),
            timeouts: self.timeouts.clone(),
            timers: self.timers.clone(),
            dirty: self.dirty.clone(),
            merges: self.merges.clone(),
        }
    }
}

impl Default for MockServices {
    fn default() -> Self {
        Self::new()
    }
}
