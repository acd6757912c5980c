//! The record synchronization core.
//!
//! A [`RecordCore`] owns one named document: its version, data, subscribers
//! and pending writes. Application calls (`get`, `set`, `subscribe`,
//! `delete`) enter here; inbound protocol messages enter through
//! [`RecordCore::handle`]; asynchronous completions from the injected
//! services re-enter through the `on_*` methods. A lifecycle state machine
//! decides which transitions are currently legal, and a handler tag on each
//! fired transition runs the matching side effects.

use crate::completion::{Completion, CompletionHandle};
use crate::config::RecordOptions;
use crate::error::{Error, Result};
use crate::event::{EventListener, RecordEvent};
use crate::machine::{StateMachine, Transition};
use crate::message::{RecordAction, RecordMessage};
use crate::path::{self, Path};
use crate::services::{MergeRequest, ResponseTimeout, Services, TimeoutHandle, TimerHandle};
use crate::subscription::{SubscriptionCallback, SubscriptionId, SubscriptionRegistry};
use crate::Version;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, error, trace, warn};

/// Lifecycle states of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Initial,
    Subscribing,
    LoadingOffline,
    Resubscribing,
    Ready,
    Merging,
    Deleting,
    Deleted,
    Unsubscribing,
    Unsubscribed,
}

/// Actions fired against the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleAction {
    Subscribe,
    Load,
    Loaded,
    Resubscribe,
    ReadResponse,
    Subscribed,
    Resubscribed,
    InvalidVersion,
    Merged,
    Delete,
    Deleted,
    DeleteSuccess,
    Unsubscribe,
    UnsubscribeAck,
}

/// Side-effect tags attached to transition rows, executed by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleHandler {
    OnSubscribing,
    OnResubscribing,
    OnOfflineLoading,
    AbortOfflineLoading,
    OnReady,
    OnDeleted,
    OnUnsubscribed,
}

type LifecycleMachine = StateMachine<RecordState, LifecycleAction, LifecycleHandler>;

fn lifecycle_machine() -> LifecycleMachine {
    use LifecycleAction as A;
    use LifecycleHandler as H;
    use RecordState as S;

    let row = |action, from, to, handler| Transition {
        action,
        from,
        to,
        handler,
    };

    StateMachine::new(
        S::Initial,
        vec![
            row(A::Subscribe, S::Initial, S::Subscribing, Some(H::OnSubscribing)),
            row(A::Load, S::Initial, S::LoadingOffline, Some(H::OnOfflineLoading)),
            row(A::Loaded, S::LoadingOffline, S::Ready, Some(H::OnReady)),
            row(A::Resubscribe, S::LoadingOffline, S::Resubscribing, Some(H::AbortOfflineLoading)),
            row(A::ReadResponse, S::Subscribing, S::Ready, Some(H::OnReady)),
            row(A::Subscribed, S::Resubscribing, S::Ready, None),
            row(A::Resubscribe, S::Initial, S::Resubscribing, Some(H::OnResubscribing)),
            row(A::Resubscribe, S::Ready, S::Resubscribing, Some(H::OnResubscribing)),
            row(A::Resubscribe, S::Unsubscribing, S::Resubscribing, Some(H::OnResubscribing)),
            row(A::Resubscribed, S::Resubscribing, S::Ready, None),
            row(A::InvalidVersion, S::Resubscribing, S::Merging, None),
            row(A::Merged, S::Merging, S::Ready, None),
            row(A::Delete, S::Ready, S::Deleting, None),
            row(A::Deleted, S::Ready, S::Deleted, Some(H::OnDeleted)),
            row(A::DeleteSuccess, S::Deleting, S::Deleted, Some(H::OnDeleted)),
            row(A::Unsubscribe, S::Ready, S::Unsubscribing, None),
            row(A::Subscribe, S::Unsubscribing, S::Ready, None),
            row(A::UnsubscribeAck, S::Unsubscribing, S::Unsubscribed, Some(H::OnUnsubscribed)),
            row(A::InvalidVersion, S::Ready, S::Merging, None),
        ],
        vec![S::Deleted, S::Unsubscribed],
    )
}

/// Arguments to [`RecordCore::set`].
pub struct SetArgs {
    /// Path within the document; `None` targets the whole document.
    pub path: Option<String>,
    /// New value; `None` erases the value at `path`.
    pub data: Option<Value>,
    /// Optional per-write completion, resolved on server acknowledgment or
    /// local failure.
    pub completion: Option<Completion<Result<()>>>,
}

impl SetArgs {
    /// Replace the whole document.
    pub fn update(data: Value) -> Self {
        Self {
            path: None,
            data: Some(data),
            completion: None,
        }
    }

    /// Write one path.
    pub fn patch(path: impl Into<String>, data: Value) -> Self {
        Self {
            path: Some(path.into()),
            data: Some(data),
            completion: None,
        }
    }

    /// Delete one path.
    pub fn erase(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            data: None,
            completion: None,
        }
    }

    /// Attach a write callback.
    pub fn with_callback(mut self, callback: impl FnOnce(Result<()>) + 'static) -> Self {
        self.completion = Some(Completion::callback(callback));
        self
    }
}

/// Arguments to [`RecordCore::subscribe`].
pub struct SubscribeArgs {
    /// Path to watch; `None` watches the whole document.
    pub path: Option<String>,
    /// Change callback, invoked with a copy of the value at the path.
    pub callback: SubscriptionCallback,
    /// Deliver the current value once, as soon as the record is ready.
    pub trigger_now: bool,
}

struct PendingWrite {
    path: Path,
    data: Option<Value>,
    completion: Option<Completion<Result<()>>>,
}

enum ReadyTask {
    Notify(Completion<()>),
    Register {
        id: SubscriptionId,
        path: Path,
        callback: SubscriptionCallback,
    },
    Discard,
    SendDelete,
}

/// One named, versioned document kept consistent with the server.
pub struct RecordCore {
    name: String,
    services: Services,
    options: RecordOptions,
    machine: LifecycleMachine,
    version: Option<Version>,
    data: Value,
    is_ready: bool,
    references: usize,
    has_provider: bool,
    pending_writes: Vec<PendingWrite>,
    subscriptions: SubscriptionRegistry,
    ready_queue: Vec<ReadyTask>,
    delete_response: Option<Completion<Result<()>>>,
    write_acks: HashMap<u64, Completion<Result<()>>>,
    next_write_ack: u64,
    discard_timer: Option<TimerHandle>,
    subscribe_timeout: Option<TimeoutHandle>,
    response_timeout: Option<TimeoutHandle>,
    delete_timeout: Option<TimeoutHandle>,
    event_listeners: Vec<EventListener>,
    on_complete: Option<Box<dyn FnOnce(&str)>>,
}

impl RecordCore {
    /// Create a record core for `name`. `on_complete` is invoked with the
    /// record name once the record reaches a terminal state and has released
    /// its resources; it is the hand-back point to whatever registry owns
    /// record identity.
    pub fn new(
        name: impl Into<String>,
        services: Services,
        options: RecordOptions,
        on_complete: impl FnOnce(&str) + 'static,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidName);
        }
        Ok(Self {
            name,
            services,
            options,
            machine: lifecycle_machine(),
            version: None,
            data: Value::Object(Map::new()),
            is_ready: false,
            references: 1,
            has_provider: false,
            pending_writes: Vec::new(),
            subscriptions: SubscriptionRegistry::new(),
            ready_queue: Vec::new(),
            delete_response: None,
            write_acks: HashMap::new(),
            next_write_ack: 0,
            discard_timer: None,
            subscribe_timeout: None,
            response_timeout: None,
            delete_timeout: None,
            event_listeners: Vec::new(),
            on_complete: Some(Box::new(on_complete)),
        })
    }

    /// Begin the lifecycle: subscribe when connected and clean, reconcile
    /// via head probe when connected with offline edits pending, or load
    /// from offline storage when disconnected.
    pub fn start(&mut self) {
        self.services.connection.watch_lifecycle(&self.name);
        if self.services.connection.is_connected() {
            if self.services.dirty.is_dirty(&self.name) {
                // the local copy must be recovered before the head probe
                // can be answered; resubscribe fires from on_storage_loaded
                self.services.storage.load(&self.name);
            } else {
                self.drive(LifecycleAction::Subscribe);
            }
        } else {
            self.drive(LifecycleAction::Load);
        }
    }

    /// Record name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RecordState {
        self.machine.state()
    }

    /// Current document version, `None` before first sync.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Whether the record has completed its initial load or subscription.
    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    /// Whether a remote data provider currently serves this record.
    pub fn has_provider(&self) -> bool {
        self.has_provider
    }

    /// A copy of the document (or the value at `path`), `None` when the
    /// path does not resolve.
    pub fn get(&self, path: Option<&str>) -> Result<Option<Value>> {
        let path = Path::parse_opt(path)?;
        Ok(path::get_value(&self.data, &path).cloned())
    }

    /// Apply a local write. Scalars require a path; writes made before the
    /// record is ready are queued and replayed in order once it is. A write
    /// that leaves the document structurally unchanged resolves its
    /// completion successfully without notifying subscribers or touching
    /// the network.
    pub fn set(&mut self, args: SetArgs) -> Result<()> {
        let SetArgs {
            path,
            data,
            completion,
        } = args;
        if path.is_none() && !matches!(data, Some(Value::Object(_) | Value::Array(_))) {
            return Err(Error::ScalarWithoutPath);
        }
        let whole_document = path.is_none();
        let parsed = Path::parse_opt(path.as_deref())?;
        if self.check_destroyed("set") {
            if let Some(completion) = completion {
                completion.complete(Err(Error::AlreadyDestroyed));
            }
            return Ok(());
        }
        if !self.is_ready {
            self.pending_writes.push(PendingWrite {
                path: parsed,
                data,
                completion,
            });
            return Ok(());
        }

        let new_data = path::set_value(&self.data, &parsed, data.as_ref());
        if new_data == self.data {
            if let Some(completion) = completion {
                self.services
                    .timers
                    .request_idle(Box::new(move || completion.complete(Ok(()))));
            }
            return Ok(());
        }

        self.apply_change(new_data);
        if self.services.connection.is_connected() {
            self.send_update(&parsed, whole_document, data, completion);
        } else {
            if let Some(completion) = completion {
                completion.complete(Err(Error::ClientOffline));
            }
            self.save_update();
        }
        Ok(())
    }

    /// Like [`set`](Self::set), returning a handle that resolves when the
    /// write is acknowledged (or fails locally).
    pub fn set_with_ack(&mut self, mut args: SetArgs) -> Result<CompletionHandle<Result<()>>> {
        let (completion, handle) = Completion::shared();
        args.completion = Some(completion);
        self.set(args)?;
        Ok(handle)
    }

    /// Register a change subscriber. With `trigger_now` the callback is
    /// deferred until the record is ready, then invoked once with the
    /// current value before any change notifications. Returns an id for
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&mut self, args: SubscribeArgs) -> Result<SubscriptionId> {
        let path = Path::parse_opt(args.path.as_deref())?;
        if self.check_destroyed("subscribe") {
            return Ok(self.subscriptions.reserve_id());
        }
        if args.trigger_now && !self.is_ready {
            let id = self.subscriptions.reserve_id();
            self.ready_queue.push(ReadyTask::Register {
                id,
                path,
                callback: args.callback,
            });
            return Ok(id);
        }
        let id = self.subscriptions.add(path, args.callback);
        if args.trigger_now {
            self.subscriptions.invoke(id, &self.data);
        }
        Ok(id)
    }

    /// Remove subscriber registrations: by id, or every registration under
    /// a path. Purely local, no network effect.
    pub fn unsubscribe(&mut self, path: Option<&str>, id: Option<SubscriptionId>) -> Result<()> {
        let parsed = match path {
            Some(raw) => Some(Path::parse(raw)?),
            None => None,
        };
        if self.check_destroyed("unsubscribe") {
            return Ok(());
        }
        self.subscriptions.remove(parsed.as_ref(), id);
        Ok(())
    }

    /// Drop one reference. When the count reaches zero (after readiness) a
    /// grace timer starts; unless a renewed subscribe cancels it, its expiry
    /// completes the unsubscribe.
    pub fn discard(&mut self) {
        if self.check_destroyed("discard") {
            return;
        }
        if self.is_ready {
            self.run_discard();
        } else {
            self.ready_queue.push(ReadyTask::Discard);
        }
        self.drive(LifecycleAction::Unsubscribe);
    }

    /// Delete the record on the server. Online-only: fails without a state
    /// transition when disconnected. Returns a handle resolved by the
    /// server's confirmation or denial.
    pub fn delete(&mut self) -> Result<CompletionHandle<Result<()>>> {
        if !self.services.connection.is_connected() {
            return Err(Error::OfflineDelete);
        }
        let (completion, handle) = Completion::shared();
        if self.check_destroyed("delete") {
            completion.complete(Err(Error::AlreadyDestroyed));
            return Ok(handle);
        }
        self.drive(LifecycleAction::Delete);
        self.delete_response = Some(completion);
        if self.is_ready {
            self.send_delete();
        } else {
            self.ready_queue.push(ReadyTask::SendDelete);
        }
        Ok(handle)
    }

    /// Callback variant of [`delete`](Self::delete). A disconnected client
    /// is reported through the callback, asynchronously.
    pub fn delete_with(&mut self, callback: impl FnOnce(Result<()>) + 'static) {
        if !self.services.connection.is_connected() {
            self.services
                .timers
                .request_idle(Box::new(move || callback(Err(Error::OfflineDelete))));
            return;
        }
        if self.check_destroyed("delete") {
            return;
        }
        self.drive(LifecycleAction::Delete);
        self.delete_response = Some(Completion::callback(callback));
        if self.is_ready {
            self.send_delete();
        } else {
            self.ready_queue.push(ReadyTask::SendDelete);
        }
    }

    /// Select the merge strategy used to resolve this record's conflicts.
    pub fn set_merge_strategy(&self, strategy: &str) {
        self.services.merges.set_strategy(&self.name, strategy);
    }

    /// Invoke `callback` once, the first time the record is ready (or
    /// immediately if it already is).
    pub fn when_ready_with(&mut self, callback: impl FnOnce() + 'static) {
        if self.is_ready {
            callback();
            return;
        }
        self.ready_queue
            .push(ReadyTask::Notify(Completion::callback(move |()| callback())));
    }

    /// Handle variant of [`when_ready_with`](Self::when_ready_with).
    pub fn when_ready(&mut self) -> CompletionHandle<()> {
        let (completion, handle) = Completion::shared();
        if self.is_ready {
            completion.complete(());
        } else {
            self.ready_queue.push(ReadyTask::Notify(completion));
        }
        handle
    }

    /// Register a listener for lifecycle events.
    pub fn on_event(&mut self, listener: impl FnMut(&RecordEvent) + 'static) {
        self.event_listeners.push(Box::new(listener));
    }

    /// Current reference count.
    pub fn usages(&self) -> usize {
        self.references
    }

    /// Overwrite the reference count. Setting it to exactly 1 cancels any
    /// pending discard and forces the record back toward ready; other
    /// values only store the count.
    pub fn set_usages(&mut self, usages: usize) {
        self.references = usages;
        if self.references == 1 {
            if let Some(timer) = self.discard_timer.take() {
                self.services.timers.remove(timer);
            }
            self.drive(LifecycleAction::Subscribe);
        }
    }

    // -- inbound protocol --------------------------------------------------

    /// Route an inbound protocol message for this record.
    pub fn handle(&mut self, message: RecordMessage) {
        if message.is_ack {
            self.acknowledge(message.action);
            return;
        }
        if message.is_write() {
            if self.machine.state() == RecordState::Merging {
                // a conflicting update crossed our read request; the
                // read response carries the full state, wait for it
                return;
            }
            self.apply_update(message);
            return;
        }
        match message.action {
            RecordAction::DeleteSuccess => {
                if let Some(timeout) = self.delete_timeout.take() {
                    self.services.timeouts.clear(timeout);
                }
                self.drive(LifecycleAction::DeleteSuccess);
                if let Some(response) = self.delete_response.take() {
                    response.complete(Ok(()));
                }
            }
            RecordAction::Deleted => {
                self.drive(LifecycleAction::Deleted);
            }
            RecordAction::VersionExists => {
                // deliberately ignored; conflicts surface through the
                // version sequence check in apply_update instead
                trace!(record = %self.name, "VERSION_EXISTS ignored");
            }
            RecordAction::MessageDenied | RecordAction::MessagePermissionError => {
                self.handle_denial(message);
            }
            RecordAction::SubscriptionHasProvider | RecordAction::SubscriptionHasNoProvider => {
                self.has_provider = message.action == RecordAction::SubscriptionHasProvider;
                let has_provider = self.has_provider;
                self.emit(RecordEvent::ProviderChanged(has_provider));
            }
            RecordAction::ReadResponse => self.handle_read_response(message),
            RecordAction::HeadResponse => self.handle_head_response(message),
            other => {
                debug!(record = %self.name, action = ?other, "unsolicited message ignored");
            }
        }
    }

    /// Completion of a [`Storage::load`](crate::services::Storage::load)
    /// request; `None` when nothing is stored under this name.
    pub fn on_storage_loaded(&mut self, stored: Option<(Version, Value)>) {
        match self.machine.state() {
            RecordState::Initial => {
                // dirty record on a live connection: adopt the offline copy,
                // then reconcile against the server's head
                if let Some((version, data)) = stored {
                    self.version = Some(version);
                    self.data = data;
                }
                self.drive(LifecycleAction::Resubscribe);
            }
            RecordState::LoadingOffline => match stored {
                Some((version, data)) => {
                    self.version = Some(version);
                    self.data = data;
                    self.drive(LifecycleAction::Loaded);
                }
                None => {
                    self.data = Value::Object(Map::new());
                    self.version = Some(1);
                    self.services.dirty.set_dirty(&self.name, true);
                    self.services.storage.store(&self.name, 1, &self.data);
                    self.drive(LifecycleAction::Loaded);
                }
            },
            state => {
                trace!(record = %self.name, ?state, "stale storage load ignored");
            }
        }
    }

    /// The connection came back; reconcile local state with the server.
    pub fn on_connection_reestablished(&mut self) {
        self.drive(LifecycleAction::Resubscribe);
    }

    /// The connection dropped; persist the current document offline.
    pub fn on_connection_lost(&mut self) {
        self.save_to_offline();
    }

    /// Outcome of a merge requested through the merge resolver. A resolver
    /// error is logged, not fatal: the remote version is adopted either way
    /// and the record corrects itself on the next update.
    pub fn on_record_recovered(
        &mut self,
        error: Option<&str>,
        merged_data: Value,
        remote_version: Version,
        remote_data: Value,
    ) {
        if let Some(error) = error {
            error!(record = %self.name, %error, "merge strategy failed");
        }
        self.version = Some(remote_version);
        if self.data == remote_data {
            return;
        }
        if merged_data == remote_data {
            self.apply_change(remote_data);
        } else {
            // the merged result is applied locally only; the server keeps
            // the remote version until the next local write
            self.apply_change(merged_data);
        }
        self.drive(LifecycleAction::Merged);
    }

    /// Server verdict on a correlated write.
    pub fn on_write_ack(&mut self, correlation_id: u64, error: Option<String>) {
        if let Some(completion) = self.write_acks.remove(&correlation_id) {
            match error {
                Some(reason) => completion.complete(Err(Error::MessageDenied { reason })),
                None => completion.complete(Ok(())),
            }
        } else {
            trace!(record = %self.name, correlation_id, "write ack without a pending write");
        }
    }

    /// Expiry of a timer registered by this record.
    pub fn on_timer_fired(&mut self, handle: TimerHandle) {
        if self.discard_timer == Some(handle) {
            self.discard_timer = None;
            self.drive(LifecycleAction::UnsubscribeAck);
        } else {
            trace!(record = %self.name, ?handle, "stale timer ignored");
        }
    }

    // -- state machine -----------------------------------------------------

    fn drive(&mut self, action: LifecycleAction) {
        if let Some(fired) = self.machine.transition(action) {
            if let Some(handler) = fired.handler {
                self.run_handler(handler);
            }
            self.emit(RecordEvent::StateChanged(fired.to));
        }
    }

    fn run_handler(&mut self, handler: LifecycleHandler) {
        match handler {
            LifecycleHandler::OnSubscribing => self.on_subscribing(),
            LifecycleHandler::OnResubscribing => self.on_resubscribing(),
            LifecycleHandler::OnOfflineLoading => self.services.storage.load(&self.name),
            // the in-flight load answers into a non-loading state and is
            // dropped there; proceed as a plain resubscribe
            LifecycleHandler::AbortOfflineLoading => self.on_resubscribing(),
            LifecycleHandler::OnReady => self.on_ready(),
            LifecycleHandler::OnDeleted => {
                self.emit(RecordEvent::Deleted);
                self.destroy();
            }
            LifecycleHandler::OnUnsubscribed => self.on_unsubscribed(),
        }
    }

    fn on_subscribing(&mut self) {
        self.subscribe_timeout = Some(self.services.timeouts.add(ResponseTimeout {
            action: RecordAction::Subscribe,
            name: self.name.clone(),
            duration: self.options.read_timeout,
        }));
        self.response_timeout = Some(self.services.timeouts.add(ResponseTimeout {
            action: RecordAction::ReadResponse,
            name: self.name.clone(),
            duration: self.options.read_timeout,
        }));
        self.services
            .connection
            .send(RecordMessage::subscribe(&self.name));
        self.services.connection.send(RecordMessage::read(&self.name));
    }

    fn on_resubscribing(&mut self) {
        if let Some(timer) = self.discard_timer.take() {
            self.services.timers.remove(timer);
        }
        self.subscribe_timeout = Some(self.services.timeouts.add(ResponseTimeout {
            action: RecordAction::Subscribe,
            name: self.name.clone(),
            duration: self.options.read_timeout,
        }));
        self.response_timeout = Some(self.services.timeouts.add(ResponseTimeout {
            action: RecordAction::HeadResponse,
            name: self.name.clone(),
            duration: self.options.read_timeout,
        }));
        self.services
            .connection
            .send(RecordMessage::subscribe(&self.name));
        self.services.connection.send(RecordMessage::head(&self.name));
    }

    fn on_ready(&mut self) {
        if let Some(timeout) = self.response_timeout.take() {
            self.services.timeouts.clear(timeout);
        }
        self.apply_pending_writes();
        self.is_ready = true;
        let tasks = std::mem::take(&mut self.ready_queue);
        for task in tasks {
            match task {
                ReadyTask::Notify(completion) => completion.complete(()),
                ReadyTask::Register { id, path, callback } => {
                    self.subscriptions.add_with_id(id, path, callback);
                    self.subscriptions.invoke(id, &self.data);
                }
                ReadyTask::Discard => self.run_discard(),
                ReadyTask::SendDelete => self.send_delete(),
            }
        }
    }

    fn apply_pending_writes(&mut self) {
        let writes = std::mem::take(&mut self.pending_writes);
        if writes.is_empty() {
            return;
        }
        let mut completions = Vec::new();
        let old_data = self.data.clone();
        let mut new_data = old_data.clone();
        for write in writes {
            new_data = path::set_value(&new_data, &write.path, write.data.as_ref());
            if let Some(completion) = write.completion {
                completions.push(completion);
            }
        }
        if new_data == old_data {
            for completion in completions {
                completion.complete(Ok(()));
            }
            return;
        }
        self.apply_change(new_data.clone());
        if self.services.connection.is_connected() {
            // the queued writes collapse into one update, and so do their
            // completions
            let completion = if completions.is_empty() {
                None
            } else {
                Some(Completion::callback(move |result: Result<()>| {
                    for completion in completions {
                        completion.complete(result.clone());
                    }
                }))
            };
            self.send_update(&Path::root(), true, Some(new_data), completion);
        } else {
            for completion in completions {
                completion.complete(Err(Error::ClientOffline));
            }
            self.save_update();
        }
    }

    fn on_unsubscribed(&mut self) {
        if self.services.connection.is_connected() {
            self.services
                .connection
                .send(RecordMessage::unsubscribe(&self.name));
        }
        self.emit(RecordEvent::Discarded);
        self.destroy();
    }

    // -- outbound ----------------------------------------------------------

    fn send_update(
        &mut self,
        path: &Path,
        whole_document: bool,
        data: Option<Value>,
        completion: Option<Completion<Result<()>>>,
    ) {
        // a dirty record already advanced its version when the offline
        // write was persisted
        let next = if self.services.dirty.is_dirty(&self.name) {
            self.services.dirty.set_dirty(&self.name, false);
            self.version.unwrap_or(1)
        } else {
            self.version.unwrap_or(0) + 1
        };
        self.version = Some(next);

        let mut message = if whole_document {
            RecordMessage::update(&self.name, next, data.unwrap_or(Value::Null))
        } else if let Some(data) = data {
            RecordMessage::patch(&self.name, next, path.to_string(), data)
        } else {
            RecordMessage::erase(&self.name, next, path.to_string())
        };
        if let Some(completion) = completion {
            let id = self.next_write_ack;
            self.next_write_ack += 1;
            self.write_acks.insert(id, completion);
            message = message.with_correlation(id);
        }
        self.services.connection.send(message);
    }

    fn send_create_update(&mut self) {
        self.services.connection.send(RecordMessage::create_and_update(
            &self.name,
            1,
            self.data.clone(),
        ));
        self.services.dirty.set_dirty(&self.name, false);
    }

    fn send_read(&mut self) {
        self.services.connection.send(RecordMessage::read(&self.name));
    }

    fn send_delete(&mut self) {
        if self.services.connection.is_connected() {
            self.delete_timeout = Some(self.services.timeouts.add(ResponseTimeout {
                action: RecordAction::Delete,
                name: self.name.clone(),
                duration: self.options.delete_timeout,
            }));
            self.services
                .connection
                .send(RecordMessage::delete(&self.name));
        } else {
            // connection dropped between the delete call and readiness
            self.services.storage.remove(&self.name);
            self.drive(LifecycleAction::DeleteSuccess);
            if let Some(response) = self.delete_response.take() {
                response.complete(Ok(()));
            }
        }
    }

    fn save_update(&mut self) {
        if !self.services.dirty.is_dirty(&self.name) {
            self.version = Some(self.version.unwrap_or(0) + 1);
            self.services.dirty.set_dirty(&self.name, true);
        }
        self.save_to_offline();
    }

    fn save_to_offline(&mut self) {
        if let Some(version) = self.version {
            self.services.storage.store(&self.name, version, &self.data);
        }
    }

    // -- inbound helpers ---------------------------------------------------

    fn acknowledge(&mut self, action: RecordAction) {
        self.services.timeouts.remove(action, &self.name);
        match action {
            RecordAction::Subscribe => self.subscribe_timeout = None,
            RecordAction::ReadResponse | RecordAction::HeadResponse => {
                self.response_timeout = None;
            }
            RecordAction::Delete => self.delete_timeout = None,
            _ => {}
        }
    }

    fn apply_update(&mut self, message: RecordMessage) {
        let Some(remote_version) = message.version else {
            warn!(record = %self.name, action = ?message.action, "write without a version ignored");
            return;
        };
        if let Some(local) = self.version {
            if local + 1 != remote_version {
                self.drive(LifecycleAction::InvalidVersion);
                if message.action == RecordAction::Patch {
                    // a partial payload cannot seed a merge; fetch the full
                    // document and resolve against the read response
                    self.send_read();
                } else {
                    self.recover_record(Some(remote_version), message.data);
                }
                return;
            }
        }
        self.version = Some(remote_version);
        let path = match Path::parse_opt(message.path.as_deref()) {
            Ok(path) => path,
            Err(err) => {
                warn!(record = %self.name, %err, "write with an invalid path ignored");
                return;
            }
        };
        let new_data = match message.action {
            RecordAction::Patch => path::set_value(&self.data, &path, message.data.as_ref()),
            RecordAction::Erase => path::set_value(&self.data, &path, None),
            _ => message.data.unwrap_or(Value::Null),
        };
        self.apply_change(new_data);
    }

    fn handle_read_response(&mut self, message: RecordMessage) {
        if self.machine.state() == RecordState::Merging {
            self.recover_record(message.version, message.data);
            self.services.dirty.set_dirty(&self.name, false);
            return;
        }
        self.version = message.version;
        self.apply_change(message.data.unwrap_or(Value::Null));
        self.drive(LifecycleAction::ReadResponse);
    }

    /// A head probe answered; compare the local dirty/clean status against
    /// the server's reported version and reconcile.
    fn handle_head_response(&mut self, message: RecordMessage) {
        let remote = message.version;
        if self.services.dirty.is_dirty(&self.name) {
            match (self.version, remote) {
                // created while offline: the server has never seen it
                (Some(1), None) => {
                    self.drive(LifecycleAction::Subscribed);
                    self.send_create_update();
                }
                // exactly one unacknowledged offline write: resend it
                (Some(local), Some(remote)) if local == remote + 1 => {
                    let data = self.data.clone();
                    self.send_update(&Path::root(), true, Some(data), None);
                    self.drive(LifecycleAction::Resubscribed);
                }
                // both sides moved; needs a full read and a merge
                _ => {
                    self.drive(LifecycleAction::InvalidVersion);
                    self.send_read();
                }
            }
        } else {
            match (self.version, remote) {
                // deleted and recreated remotely; transient, updates follow
                (Some(local), Some(remote)) if remote < local => {
                    debug!(record = %self.name, local, remote, "remote version behind local, awaiting updates");
                }
                // deleted remotely while we hold a clean copy; same transient
                // window as a behind version, so wait for updates
                (Some(local), None) => {
                    debug!(record = %self.name, local, "remote version unknown, awaiting updates");
                }
                (local, remote) if local == remote => {
                    self.drive(LifecycleAction::Resubscribed);
                }
                _ => {
                    self.drive(LifecycleAction::InvalidVersion);
                    self.send_read();
                }
            }
        }
    }

    fn handle_denial(&mut self, message: RecordMessage) {
        if matches!(
            message.original_action,
            Some(RecordAction::Subscribe | RecordAction::Read | RecordAction::Head)
        ) {
            self.services
                .timeouts
                .remove(RecordAction::Subscribe, &self.name);
            self.subscribe_timeout = None;
            self.services
                .timeouts
                .remove(RecordAction::ReadResponse, &self.name);
            self.services
                .timeouts
                .remove(RecordAction::HeadResponse, &self.name);
            self.response_timeout = None;
        }
        self.emit(RecordEvent::Error {
            code: message.action,
            original_action: message.original_action,
        });
        if message.original_action == Some(RecordAction::Delete) {
            let reason = match message.action {
                RecordAction::MessagePermissionError => "MESSAGE_PERMISSION_ERROR",
                _ => "MESSAGE_DENIED",
            };
            if let Some(response) = self.delete_response.take() {
                response.complete(Err(Error::MessageDenied {
                    reason: reason.to_string(),
                }));
            }
        }
    }

    fn recover_record(&mut self, remote_version: Option<Version>, remote_data: Option<Value>) {
        let Some(remote_version) = remote_version else {
            warn!(record = %self.name, "conflict without a remote version, cannot merge");
            return;
        };
        self.services.merges.merge(MergeRequest {
            name: self.name.clone(),
            local_version: self.version,
            local_data: self.data.clone(),
            remote_version,
            remote_data: remote_data.unwrap_or(Value::Null),
        });
    }

    // -- local state -------------------------------------------------------

    /// Replace the document wholesale and notify every subscriber whose
    /// resolved value changed. Previously handed-out copies stay valid.
    fn apply_change(&mut self, new_data: Value) {
        if self.machine.is_in_terminal_state() {
            return;
        }
        let old_data = std::mem::replace(&mut self.data, new_data);
        self.subscriptions.notify_changed(&old_data, &self.data);
    }

    fn run_discard(&mut self) {
        self.references = self.references.saturating_sub(1);
        if self.references == 0 {
            self.discard_timer = Some(self.services.timers.add(self.options.discard_timeout));
        }
    }

    fn check_destroyed(&self, method: &str) -> bool {
        if self.machine.is_in_terminal_state() {
            error!(record = %self.name, method, "operation on a destroyed record ignored");
            return true;
        }
        false
    }

    fn emit(&mut self, event: RecordEvent) {
        for listener in &mut self.event_listeners {
            listener(&event);
        }
    }

    /// Release every external resource exactly once and hand the name back
    /// to the owner. Late completions from released sources find only
    /// emptied registries and `None` handles.
    fn destroy(&mut self) {
        if let Some(timer) = self.discard_timer.take() {
            self.services.timers.remove(timer);
        }
        for timeout in [
            self.subscribe_timeout.take(),
            self.response_timeout.take(),
            self.delete_timeout.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.services.timeouts.clear(timeout);
        }
        self.services.connection.unwatch_lifecycle(&self.name);
        self.subscriptions.clear();
        self.event_listeners.clear();
        self.is_ready = false;
        if let Some(complete) = self.on_complete.take() {
            complete(&self.name);
        }
    }
}

impl std::fmt::Debug for RecordCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCore")
            .field("name", &self.name)
            .field("state", &self.machine.state())
            .field("version", &self.version)
            .field("is_ready", &self.is_ready)
            .field("references", &self.references)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{DirtyTracker, MockServices};
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn new_record(mocks: &MockServices) -> RecordCore {
        RecordCore::new("doc", mocks.services(), RecordOptions::default(), |_| {}).unwrap()
    }

    fn read_response(version: Version, data: Value) -> RecordMessage {
        RecordMessage {
            version: Some(version),
            data: Some(data),
            ..RecordMessage::new(RecordAction::ReadResponse, "doc")
        }
    }

    fn head_response(version: Option<Version>) -> RecordMessage {
        RecordMessage {
            version,
            ..RecordMessage::new(RecordAction::HeadResponse, "doc")
        }
    }

    fn ready_record(mocks: &MockServices, version: Version, data: Value) -> RecordCore {
        let mut record = new_record(mocks);
        record.start();
        record.handle(read_response(version, data));
        mocks.connection.take_sent();
        record
    }

    #[test]
    fn empty_name_is_rejected() {
        let mocks = MockServices::new();
        let record = RecordCore::new("", mocks.services(), RecordOptions::default(), |_| {});
        assert_eq!(record.err(), Some(Error::InvalidName));
    }

    #[test]
    fn subscribe_flow_reaches_ready() {
        let mocks = MockServices::new();
        let mut record = new_record(&mocks);
        record.start();

        assert_eq!(record.state(), RecordState::Subscribing);
        let sent = mocks.connection.take_sent();
        assert_eq!(sent[0].action, RecordAction::Subscribe);
        assert_eq!(sent[1].action, RecordAction::Read);
        assert_eq!(mocks.connection.watch_count("doc"), 1);

        record.handle(read_response(4, json!({"a": 1})));
        assert_eq!(record.state(), RecordState::Ready);
        assert!(record.is_ready());
        assert_eq!(record.version(), Some(4));
        assert_eq!(record.get(None).unwrap(), Some(json!({"a": 1})));
        // the read-response timeout was released
        assert!(!mocks
            .timeouts
            .active_actions()
            .contains(&RecordAction::ReadResponse));
    }

    #[test]
    fn get_returns_copies() {
        let mocks = MockServices::new();
        let record = ready_record(&mocks, 1, json!({"a": {"b": 5}}));
        assert_eq!(record.get(Some("a.b")).unwrap(), Some(json!(5)));
        assert_eq!(record.get(Some("missing")).unwrap(), None);
    }

    #[test]
    fn set_sends_update_with_next_version() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 3, json!({"a": 1}));

        record.set(SetArgs::update(json!({"a": 2}))).unwrap();
        let sent = mocks.connection.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, RecordAction::Update);
        assert_eq!(sent[0].version, Some(4));
        assert_eq!(record.version(), Some(4));
        assert_eq!(record.get(None).unwrap(), Some(json!({"a": 2})));
    }

    #[test]
    fn set_patch_and_erase_messages() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({"a": 1, "b": 2}));

        record.set(SetArgs::patch("a", json!(9))).unwrap();
        record.set(SetArgs::erase("b")).unwrap();
        let sent = mocks.connection.take_sent();
        assert_eq!(sent[0].action, RecordAction::Patch);
        assert_eq!(sent[0].path.as_deref(), Some("a"));
        assert_eq!(sent[1].action, RecordAction::Erase);
        assert_eq!(sent[1].version, Some(3));
        assert_eq!(record.get(None).unwrap(), Some(json!({"a": 9})));
    }

    #[test]
    fn scalar_without_path_is_an_argument_error() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({}));
        assert_eq!(
            record.set(SetArgs {
                path: None,
                data: Some(json!(5)),
                completion: None
            }),
            Err(Error::ScalarWithoutPath)
        );
    }

    #[test]
    fn root_array_is_a_valid_document() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({}));

        record.set(SetArgs::update(json!([1, 2, 3]))).unwrap();
        let sent = mocks.connection.take_sent();
        assert_eq!(sent[0].action, RecordAction::Update);
        assert_eq!(sent[0].version, Some(2));
        assert_eq!(record.get(None).unwrap(), Some(json!([1, 2, 3])));
    }

    #[test]
    fn noop_set_resolves_without_side_effects() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 2, json!({"a": 1}));

        let notified = Rc::new(Cell::new(0));
        let captured = Rc::clone(&notified);
        record
            .subscribe(SubscribeArgs {
                path: None,
                callback: Box::new(move |_| captured.set(captured.get() + 1)),
                trigger_now: false,
            })
            .unwrap();

        let handle = record
            .set_with_ack(SetArgs::patch("a", json!(1)))
            .unwrap();
        assert_eq!(handle.try_take(), Some(Ok(())));
        assert!(mocks.connection.sent().is_empty());
        assert_eq!(notified.get(), 0);
        assert_eq!(record.version(), Some(2));
    }

    #[test]
    fn pending_writes_coalesce_into_one_update() {
        let mocks = MockServices::new();
        let mut record = new_record(&mocks);
        record.start();
        mocks.connection.take_sent();

        record.set(SetArgs::patch("a", json!(1))).unwrap();
        record.set(SetArgs::patch("b", json!(2))).unwrap();
        record.set(SetArgs::patch("a", json!(3))).unwrap();
        assert!(mocks.connection.sent().is_empty());

        record.handle(read_response(7, json!({})));
        let sent = mocks.connection.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, RecordAction::Update);
        assert_eq!(sent[0].version, Some(8));
        assert_eq!(sent[0].data, Some(json!({"a": 3, "b": 2})));
        assert_eq!(record.get(None).unwrap(), Some(json!({"a": 3, "b": 2})));
    }

    #[test]
    fn offline_set_persists_and_marks_dirty() {
        let mocks = MockServices::new();
        mocks.connection.set_connected(false);
        mocks.storage.insert("doc", 5, json!({"a": 1}));
        let mut record = new_record(&mocks);
        record.start();
        assert_eq!(mocks.storage.take_load_requests(), vec!["doc".to_string()]);
        record.on_storage_loaded(Some((5, json!({"a": 1}))));
        assert_eq!(record.state(), RecordState::Ready);

        let offline_error = Rc::new(RefCell::new(None));
        let captured = Rc::clone(&offline_error);
        record
            .set(
                SetArgs::patch("a", json!(2))
                    .with_callback(move |result| *captured.borrow_mut() = Some(result)),
            )
            .unwrap();

        assert_eq!(*offline_error.borrow(), Some(Err(Error::ClientOffline)));
        assert_eq!(record.version(), Some(6));
        assert!(mocks.dirty.is_dirty("doc"));
        assert_eq!(mocks.storage.stored("doc"), Some((6, json!({"a": 2}))));
        assert!(mocks.connection.sent().is_empty());

        // a second offline write does not advance the version again
        record.set(SetArgs::patch("a", json!(3))).unwrap();
        assert_eq!(record.version(), Some(6));
    }

    #[test]
    fn offline_create_initializes_empty_dirty_document() {
        let mocks = MockServices::new();
        mocks.connection.set_connected(false);
        let mut record = new_record(&mocks);
        record.start();
        assert_eq!(record.state(), RecordState::LoadingOffline);

        record.on_storage_loaded(None);
        assert_eq!(record.state(), RecordState::Ready);
        assert_eq!(record.version(), Some(1));
        assert_eq!(record.get(None).unwrap(), Some(json!({})));
        assert!(mocks.dirty.is_dirty("doc"));
        assert_eq!(mocks.storage.stored("doc"), Some((1, json!({}))));
    }

    #[test]
    fn sequential_update_applies_and_notifies() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 2, json!({"a": 1}));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let captured = Rc::clone(&seen);
        record
            .subscribe(SubscribeArgs {
                path: Some("a".into()),
                callback: Box::new(move |v| captured.borrow_mut().push(v)),
                trigger_now: false,
            })
            .unwrap();

        record.handle(RecordMessage::patch("doc", 3, "a", json!(2)));
        assert_eq!(record.version(), Some(3));
        assert_eq!(seen.borrow().as_slice(), &[Some(json!(2))]);
    }

    #[test]
    fn version_gap_patch_requests_full_read() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 2, json!({"a": 1}));

        record.handle(RecordMessage::patch("doc", 5, "a", json!(9)));
        assert_eq!(record.state(), RecordState::Merging);
        // the partial payload was not applied
        assert_eq!(record.get(Some("a")).unwrap(), Some(json!(1)));
        assert_eq!(record.version(), Some(2));
        let sent = mocks.connection.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, RecordAction::Read);
        assert!(mocks.merges.take_requests().is_empty());
    }

    #[test]
    fn version_gap_update_invokes_merge_resolver() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 2, json!({"a": 1}));

        record.handle(RecordMessage::update("doc", 5, json!({"a": 9})));
        assert_eq!(record.state(), RecordState::Merging);
        let requests = mocks.merges.take_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].local_version, Some(2));
        assert_eq!(requests[0].local_data, json!({"a": 1}));
        assert_eq!(requests[0].remote_version, 5);
        assert_eq!(requests[0].remote_data, json!({"a": 9}));

        record.on_record_recovered(None, json!({"a": 5}), 5, json!({"a": 9}));
        assert_eq!(record.state(), RecordState::Ready);
        assert_eq!(record.version(), Some(5));
        assert_eq!(record.get(None).unwrap(), Some(json!({"a": 5})));
        // the merged result is not pushed to the server
        assert!(mocks.connection.sent().is_empty());
    }

    #[test]
    fn recovery_with_equal_local_and_remote_stays_merging() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 2, json!({"a": 1}));

        record.handle(RecordMessage::update("doc", 5, json!({"a": 1})));
        record.on_record_recovered(None, json!({"a": 1}), 5, json!({"a": 1}));
        assert_eq!(record.version(), Some(5));
        assert_eq!(record.state(), RecordState::Merging);
    }

    #[test]
    fn updates_while_merging_are_ignored() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 2, json!({"a": 1}));
        record.handle(RecordMessage::update("doc", 5, json!({"a": 9})));
        assert_eq!(record.state(), RecordState::Merging);

        record.handle(RecordMessage::patch("doc", 3, "a", json!(7)));
        assert_eq!(record.get(Some("a")).unwrap(), Some(json!(1)));
        assert_eq!(record.version(), Some(2));
    }

    #[test]
    fn read_response_while_merging_routes_to_recovery() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 2, json!({"a": 1}));
        record.handle(RecordMessage::patch("doc", 5, "a", json!(9)));
        mocks.connection.take_sent();

        record.handle(read_response(6, json!({"a": 6})));
        assert_eq!(record.state(), RecordState::Merging);
        let requests = mocks.merges.take_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].remote_version, 6);
        assert!(!mocks.dirty.is_dirty("doc"));

        record.on_record_recovered(None, json!({"a": 6}), 6, json!({"a": 6}));
        assert_eq!(record.state(), RecordState::Ready);
        assert_eq!(record.get(Some("a")).unwrap(), Some(json!(6)));
    }

    #[test]
    fn version_exists_changes_nothing() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 2, json!({"a": 1}));

        record.handle(RecordMessage::new(RecordAction::VersionExists, "doc"));
        assert_eq!(record.state(), RecordState::Ready);
        assert_eq!(record.version(), Some(2));
        assert!(mocks.connection.sent().is_empty());
        assert!(mocks.merges.take_requests().is_empty());
    }

    #[test]
    fn provider_messages_update_flag_and_emit() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({}));
        let events = Rc::new(RefCell::new(Vec::new()));
        let captured = Rc::clone(&events);
        record.on_event(move |event| captured.borrow_mut().push(event.clone()));

        record.handle(RecordMessage::new(
            RecordAction::SubscriptionHasProvider,
            "doc",
        ));
        assert!(record.has_provider());
        record.handle(RecordMessage::new(
            RecordAction::SubscriptionHasNoProvider,
            "doc",
        ));
        assert!(!record.has_provider());
        assert_eq!(
            events.borrow().as_slice(),
            &[
                RecordEvent::ProviderChanged(true),
                RecordEvent::ProviderChanged(false)
            ]
        );
    }

    #[test]
    fn subscribe_with_trigger_now_waits_for_readiness() {
        let mocks = MockServices::new();
        let mut record = new_record(&mocks);
        record.start();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let captured = Rc::clone(&seen);
        record
            .subscribe(SubscribeArgs {
                path: Some("a.b".into()),
                callback: Box::new(move |v| captured.borrow_mut().push(v)),
                trigger_now: true,
            })
            .unwrap();
        assert!(seen.borrow().is_empty());

        record.handle(read_response(1, json!({"a": {"b": 5}})));
        assert_eq!(seen.borrow().as_slice(), &[Some(json!(5))]);

        // no further invocation until the path actually changes
        record.handle(RecordMessage::patch("doc", 2, "c", json!(1)));
        assert_eq!(seen.borrow().len(), 1);
        record.handle(RecordMessage::patch("doc", 3, "a.b", json!(6)));
        assert_eq!(seen.borrow().as_slice(), &[Some(json!(5)), Some(json!(6))]);
    }

    #[test]
    fn unsubscribe_by_id_stops_notifications() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({"a": 1}));
        let seen = Rc::new(Cell::new(0));
        let captured = Rc::clone(&seen);
        let id = record
            .subscribe(SubscribeArgs {
                path: Some("a".into()),
                callback: Box::new(move |_| captured.set(captured.get() + 1)),
                trigger_now: false,
            })
            .unwrap();

        record.handle(RecordMessage::patch("doc", 2, "a", json!(2)));
        assert_eq!(seen.get(), 1);

        record.unsubscribe(None, Some(id)).unwrap();
        record.handle(RecordMessage::patch("doc", 3, "a", json!(3)));
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn when_ready_fires_exactly_once() {
        let mocks = MockServices::new();
        let mut record = new_record(&mocks);
        record.start();

        let handle = record.when_ready();
        assert!(!handle.is_complete());
        record.handle(read_response(1, json!({})));
        assert_eq!(handle.try_take(), Some(()));

        // already ready: resolves immediately
        assert!(record.when_ready().is_complete());
    }

    #[test]
    fn write_ack_round_trip() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({"a": 1}));

        let handle = record
            .set_with_ack(SetArgs::patch("a", json!(2)))
            .unwrap();
        let sent = mocks.connection.take_sent();
        let correlation = sent[0].correlation_id.unwrap();
        assert!(!handle.is_complete());

        record.on_write_ack(correlation, None);
        assert_eq!(handle.try_take(), Some(Ok(())));

        let handle = record
            .set_with_ack(SetArgs::patch("a", json!(3)))
            .unwrap();
        let sent = mocks.connection.take_sent();
        record.on_write_ack(
            sent[0].correlation_id.unwrap(),
            Some("MESSAGE_DENIED".into()),
        );
        assert_eq!(
            handle.try_take(),
            Some(Err(Error::MessageDenied {
                reason: "MESSAGE_DENIED".into()
            }))
        );
    }

    #[test]
    fn delete_offline_fails_without_transition() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({}));
        mocks.connection.set_connected(false);

        assert_eq!(record.delete().err(), Some(Error::OfflineDelete));
        assert_eq!(record.state(), RecordState::Ready);
        assert!(mocks.connection.sent().is_empty());
    }

    #[test]
    fn delete_success_resolves_and_destroys() {
        let mocks = MockServices::new();
        let destroyed = Rc::new(RefCell::new(None));
        let captured = Rc::clone(&destroyed);
        let mut record = RecordCore::new("doc", mocks.services(), RecordOptions::default(), {
            move |name| *captured.borrow_mut() = Some(name.to_string())
        })
        .unwrap();
        record.start();
        record.handle(read_response(1, json!({})));
        mocks.connection.take_sent();

        let handle = record.delete().unwrap();
        assert_eq!(record.state(), RecordState::Deleting);
        let sent = mocks.connection.take_sent();
        assert_eq!(sent[0].action, RecordAction::Delete);

        record.handle(RecordMessage::new(RecordAction::DeleteSuccess, "doc"));
        assert_eq!(record.state(), RecordState::Deleted);
        assert_eq!(handle.try_take(), Some(Ok(())));
        assert_eq!(destroyed.borrow().as_deref(), Some("doc"));
        assert_eq!(mocks.timeouts.active_count(), 0);
        assert_eq!(mocks.connection.unwatch_count("doc"), 1);
    }

    #[test]
    fn denied_delete_rejects_the_completion() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({}));
        let handle = record.delete().unwrap();

        record.handle(RecordMessage {
            original_action: Some(RecordAction::Delete),
            ..RecordMessage::new(RecordAction::MessageDenied, "doc")
        });
        assert_eq!(
            handle.try_take(),
            Some(Err(Error::MessageDenied {
                reason: "MESSAGE_DENIED".into()
            }))
        );
        // denial is not a confirmation; the record is not destroyed
        assert_eq!(record.state(), RecordState::Deleting);
    }

    #[test]
    fn server_initiated_delete_destroys_the_record() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({}));
        let events = Rc::new(RefCell::new(Vec::new()));
        let captured = Rc::clone(&events);
        record.on_event(move |event| captured.borrow_mut().push(event.clone()));

        record.handle(RecordMessage::new(RecordAction::Deleted, "doc"));
        assert_eq!(record.state(), RecordState::Deleted);
        assert!(events.borrow().contains(&RecordEvent::Deleted));
    }

    #[test]
    fn discard_starts_grace_timer_and_timer_unsubscribes() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({}));
        let events = Rc::new(RefCell::new(Vec::new()));
        let captured = Rc::clone(&events);
        record.on_event(move |event| captured.borrow_mut().push(event.clone()));

        record.discard();
        assert_eq!(record.state(), RecordState::Unsubscribing);
        assert_eq!(record.usages(), 0);
        let timers = mocks.timers.active();
        assert_eq!(timers.len(), 1);

        record.on_timer_fired(timers[0].0);
        assert_eq!(record.state(), RecordState::Unsubscribed);
        assert!(events.borrow().contains(&RecordEvent::Discarded));
        let sent = mocks.connection.take_sent();
        assert!(sent.iter().any(|m| m.action == RecordAction::Unsubscribe));
    }

    #[test]
    fn set_usages_one_cancels_pending_discard() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({}));
        record.discard();
        let timer = mocks.timers.active()[0].0;

        record.set_usages(1);
        assert_eq!(record.state(), RecordState::Ready);
        assert_eq!(mocks.timers.removed(), vec![timer]);

        // the stale timer can no longer unsubscribe the record
        record.on_timer_fired(timer);
        assert_eq!(record.state(), RecordState::Ready);
    }

    #[test]
    fn set_usages_above_one_only_stores_the_count() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({}));
        record.discard();
        record.set_usages(3);
        assert_eq!(record.usages(), 3);
        assert_eq!(record.state(), RecordState::Unsubscribing);
    }

    #[test]
    fn terminal_record_absorbs_operations() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 1, json!({"a": 1}));
        record.handle(RecordMessage::new(RecordAction::Deleted, "doc"));
        assert_eq!(record.state(), RecordState::Deleted);

        assert_eq!(record.set(SetArgs::patch("a", json!(2))), Ok(()));
        assert_eq!(record.get(Some("a")).unwrap(), Some(json!(1)));
        assert!(mocks.connection.sent().is_empty());
        record.discard();
        assert_eq!(record.state(), RecordState::Deleted);
    }

    #[test]
    fn connection_lost_persists_and_reconnect_resubscribes() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 3, json!({"a": 1}));

        mocks.connection.set_connected(false);
        record.on_connection_lost();
        assert_eq!(mocks.storage.stored("doc"), Some((3, json!({"a": 1}))));

        mocks.connection.set_connected(true);
        record.on_connection_reestablished();
        assert_eq!(record.state(), RecordState::Resubscribing);
        let sent = mocks.connection.take_sent();
        assert_eq!(sent[0].action, RecordAction::Subscribe);
        assert_eq!(sent[1].action, RecordAction::Head);
    }

    #[test]
    fn head_response_clean_and_equal_goes_ready() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 3, json!({"a": 1}));
        record.on_connection_reestablished();
        mocks.connection.take_sent();

        record.handle(head_response(Some(3)));
        assert_eq!(record.state(), RecordState::Ready);
        assert!(mocks.connection.sent().is_empty());
    }

    #[test]
    fn head_response_remote_behind_waits_for_updates() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 5, json!({"a": 1}));
        record.on_connection_reestablished();
        mocks.connection.take_sent();

        record.handle(head_response(Some(2)));
        assert_eq!(record.state(), RecordState::Resubscribing);
        assert!(mocks.connection.sent().is_empty());
    }

    #[test]
    fn head_response_clean_remote_unknown_waits_for_updates() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 5, json!({"a": 1}));
        record.on_connection_reestablished();
        mocks.connection.take_sent();

        record.handle(head_response(None));
        assert_eq!(record.state(), RecordState::Resubscribing);
        assert!(mocks.connection.sent().is_empty());
    }

    #[test]
    fn head_response_clean_divergence_reads_and_merges() {
        let mocks = MockServices::new();
        let mut record = ready_record(&mocks, 3, json!({"a": 1}));
        record.on_connection_reestablished();
        mocks.connection.take_sent();

        record.handle(head_response(Some(7)));
        assert_eq!(record.state(), RecordState::Merging);
        let sent = mocks.connection.take_sent();
        assert_eq!(sent[0].action, RecordAction::Read);
    }

    #[test]
    fn head_response_offline_creation_pushes_create() {
        let mocks = MockServices::new();
        mocks.connection.set_connected(false);
        let mut record = new_record(&mocks);
        record.start();
        record.on_storage_loaded(None);
        record.set(SetArgs::patch("a", json!(1))).unwrap();

        mocks.connection.set_connected(true);
        record.on_connection_reestablished();
        mocks.connection.take_sent();
        record.handle(head_response(None));

        assert_eq!(record.state(), RecordState::Ready);
        let sent = mocks.connection.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, RecordAction::CreateAndUpdate);
        assert_eq!(sent[0].version, Some(1));
        assert_eq!(sent[0].data, Some(json!({"a": 1})));
        assert!(!mocks.dirty.is_dirty("doc"));
    }

    #[test]
    fn head_response_one_unacked_write_resends_update() {
        let mocks = MockServices::new();
        mocks.connection.set_connected(false);
        mocks.storage.insert("doc", 4, json!({"a": 1}));
        let mut record = new_record(&mocks);
        record.start();
        record.on_storage_loaded(Some((4, json!({"a": 1}))));
        record.set(SetArgs::patch("a", json!(2))).unwrap();
        assert_eq!(record.version(), Some(5));

        mocks.connection.set_connected(true);
        record.on_connection_reestablished();
        mocks.connection.take_sent();
        record.handle(head_response(Some(4)));

        assert_eq!(record.state(), RecordState::Ready);
        let sent = mocks.connection.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, RecordAction::Update);
        assert_eq!(sent[0].version, Some(5));
        assert_eq!(sent[0].data, Some(json!({"a": 2})));
        assert!(!mocks.dirty.is_dirty("doc"));
        assert!(mocks.connection.sent().iter().all(|m| m.action != RecordAction::Read));
    }

    #[test]
    fn head_response_dirty_divergence_reads_and_merges() {
        let mocks = MockServices::new();
        mocks.connection.set_connected(false);
        mocks.storage.insert("doc", 4, json!({"a": 1}));
        let mut record = new_record(&mocks);
        record.start();
        record.on_storage_loaded(Some((4, json!({"a": 1}))));
        record.set(SetArgs::patch("a", json!(2))).unwrap();

        mocks.connection.set_connected(true);
        record.on_connection_reestablished();
        mocks.connection.take_sent();
        record.handle(head_response(Some(9)));

        assert_eq!(record.state(), RecordState::Merging);
        let sent = mocks.connection.take_sent();
        assert_eq!(sent[0].action, RecordAction::Read);
    }

    #[test]
    fn dirty_start_on_live_connection_recovers_from_storage() {
        let mocks = MockServices::new();
        mocks.dirty.set_dirty("doc", true);
        mocks.storage.insert("doc", 4, json!({"a": 2}));
        let mut record = new_record(&mocks);
        record.start();

        assert_eq!(record.state(), RecordState::Initial);
        assert_eq!(mocks.storage.take_load_requests(), vec!["doc".to_string()]);

        record.on_storage_loaded(Some((4, json!({"a": 2}))));
        assert_eq!(record.state(), RecordState::Resubscribing);
        assert_eq!(record.version(), Some(4));
        let sent = mocks.connection.take_sent();
        assert_eq!(sent[1].action, RecordAction::Head);
    }

    #[test]
    fn reconnect_during_offline_load_discards_the_load() {
        let mocks = MockServices::new();
        mocks.connection.set_connected(false);
        let mut record = new_record(&mocks);
        record.start();
        assert_eq!(record.state(), RecordState::LoadingOffline);

        mocks.connection.set_connected(true);
        record.on_connection_reestablished();
        assert_eq!(record.state(), RecordState::Resubscribing);

        // the load completes late and must not disturb the resubscribe
        record.on_storage_loaded(Some((9, json!({"stale": true}))));
        assert_eq!(record.state(), RecordState::Resubscribing);
        assert_eq!(record.version(), None);
    }

    #[test]
    fn acks_release_their_timeouts() {
        let mocks = MockServices::new();
        let mut record = new_record(&mocks);
        record.start();
        assert_eq!(mocks.timeouts.active_count(), 2);

        record.handle(RecordMessage {
            is_ack: true,
            ..RecordMessage::new(RecordAction::Subscribe, "doc")
        });
        assert_eq!(mocks.timeouts.active_count(), 1);
        assert_eq!(
            mocks.timeouts.active_actions(),
            vec![RecordAction::ReadResponse]
        );
    }
}
