//! # Tether Engine
//!
//! The record-synchronization core of a real-time data client: it keeps a
//! single named, versioned JSON document consistent between a local offline
//! cache and a remote authoritative server, across connect/disconnect
//! cycles, concurrent writers, and version conflicts.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches the network, storage, or timers
//!   itself; every outbound effect goes through injected [`Services`]
//! - **Single-threaded**: all calls happen on one logical thread; async
//!   completions re-enter through explicit `on_*` methods
//! - **Fail closed**: a record in a terminal state absorbs every further
//!   operation, logged but never raised
//! - **Value semantics**: documents are replaced wholesale and handed out
//!   as copies; change detection is structural equality, never identity
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`RecordCore`] owns one document:
//! - `name` identifies it, `version` sequences its writes
//! - local mutations ([`RecordCore::set`]) apply optimistically and are
//!   sent, queued, or persisted offline depending on readiness and
//!   connectivity
//! - inbound server writes apply only when their version is exactly
//!   `local + 1`; anything else routes through conflict recovery
//!
//! ### Lifecycle
//!
//! A table-driven [`StateMachine`] gates every transition: subscribe, load
//! from offline storage, resubscribe after reconnect, merge, delete,
//! unsubscribe. Actions that do not apply to the current phase are ignored.
//!
//! ### Conflicts
//!
//! A version gap moves the record to a merging state; the full remote
//! document is fetched if needed, handed to the pluggable
//! [`MergeResolver`], and the result applied locally.
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{
//!     MockServices, RecordAction, RecordCore, RecordMessage, RecordOptions, SetArgs,
//! };
//! use serde_json::json;
//!
//! let mocks = MockServices::new();
//! let mut record = RecordCore::new(
//!     "users/alice",
//!     mocks.services(),
//!     RecordOptions::default(),
//!     |_name| {},
//! )
//! .unwrap();
//!
//! // subscribing sends SUBSCRIBE + READ; the read response makes it ready
//! record.start();
//! record.handle(RecordMessage {
//!     version: Some(1),
//!     data: Some(json!({"name": "Alice"})),
//!     ..RecordMessage::new(RecordAction::ReadResponse, "users/alice")
//! });
//! assert!(record.is_ready());
//!
//! // local writes apply immediately and go out with the next version
//! record.set(SetArgs::patch("name", json!("Alicia"))).unwrap();
//! assert_eq!(record.version(), Some(2));
//! assert_eq!(record.get(Some("name")).unwrap(), Some(json!("Alicia")));
//! ```

pub mod completion;
pub mod config;
pub mod error;
pub mod event;
pub mod machine;
pub mod message;
pub mod path;
pub mod record;
pub mod services;
pub mod subscription;

// Re-export main types at crate root
pub use completion::{Completion, CompletionHandle};
pub use config::RecordOptions;
pub use error::{Error, Result};
pub use event::{EventListener, RecordEvent};
pub use machine::{Fired, StateMachine, Transition};
pub use message::{RecordAction, RecordMessage};
pub use path::{get_value, set_value, Path, Segment};
pub use record::{RecordCore, RecordState, SetArgs, SubscribeArgs};
pub use services::{
    Connection, DirtyTracker, MemoryDirtyTracker, MemoryStorage, MergeRequest, MergeResolver,
    MockConnection, MockMergeResolver, MockServices, MockTimeoutRegistry, MockTimerRegistry,
    ResponseTimeout, Services, Storage, TimeoutHandle, TimeoutRegistry, TimerHandle,
    TimerRegistry,
};
pub use subscription::{SubscriptionCallback, SubscriptionId, SubscriptionRegistry};

/// Type aliases for clarity
pub type RecordName = String;
pub type Version = u64;
