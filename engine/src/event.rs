//! Public events emitted by a record.

use crate::message::RecordAction;
use crate::record::RecordState;

/// Events a record delivers to registered listeners, in addition to the
/// per-path data notifications handled by subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    /// The lifecycle state machine moved to a new state.
    StateChanged(RecordState),
    /// The record was discarded (fully unsubscribed) and destroyed.
    Discarded,
    /// The record was deleted and destroyed.
    Deleted,
    /// The server denied a request.
    Error {
        /// Denial code reported by the server.
        code: RecordAction,
        /// The action that was denied.
        original_action: Option<RecordAction>,
    },
    /// A remote data provider appeared or disappeared for this record.
    ProviderChanged(bool),
}

/// Listener invoked for every emitted [`RecordEvent`].
pub type EventListener = Box<dyn FnMut(&RecordEvent)>;
