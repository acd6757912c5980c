//! Record protocol messages.
//!
//! Conceptual message shape, not a wire format: framing and encoding live in
//! the transport, which consumes and produces [`RecordMessage`] values.

use crate::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Verbs of the record protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordAction {
    Subscribe,
    Unsubscribe,
    UnsubscribeAck,
    Read,
    ReadResponse,
    Head,
    HeadResponse,
    Patch,
    Update,
    Erase,
    CreateAndUpdate,
    Delete,
    DeleteSuccess,
    Deleted,
    VersionExists,
    MessageDenied,
    MessagePermissionError,
    SubscriptionHasProvider,
    SubscriptionHasNoProvider,
}

/// A single record protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMessage {
    /// Protocol verb.
    pub action: RecordAction,
    /// Record name the message concerns.
    pub name: String,
    /// Document version carried by the message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Document path for partial operations (PATCH/ERASE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Document payload, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Whether this message acknowledges a prior request.
    #[serde(default)]
    pub is_ack: bool,
    /// For denials and acks: the action of the original request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_action: Option<RecordAction>,
    /// Write-acknowledgment correlation id, set when the sender expects a
    /// per-write completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<u64>,
}

impl RecordMessage {
    /// A bare message carrying only a verb and a name.
    pub fn new(action: RecordAction, name: impl Into<String>) -> Self {
        Self {
            action,
            name: name.into(),
            version: None,
            path: None,
            data: None,
            is_ack: false,
            original_action: None,
            correlation_id: None,
        }
    }

    /// Subscription request.
    pub fn subscribe(name: impl Into<String>) -> Self {
        Self::new(RecordAction::Subscribe, name)
    }

    /// Unsubscribe notification.
    pub fn unsubscribe(name: impl Into<String>) -> Self {
        Self::new(RecordAction::Unsubscribe, name)
    }

    /// Full-document read request.
    pub fn read(name: impl Into<String>) -> Self {
        Self::new(RecordAction::Read, name)
    }

    /// Version probe request.
    pub fn head(name: impl Into<String>) -> Self {
        Self::new(RecordAction::Head, name)
    }

    /// Whole-document replacement.
    pub fn update(name: impl Into<String>, version: Version, data: Value) -> Self {
        Self {
            version: Some(version),
            data: Some(data),
            ..Self::new(RecordAction::Update, name)
        }
    }

    /// Single-path write.
    pub fn patch(name: impl Into<String>, version: Version, path: impl Into<String>, data: Value) -> Self {
        Self {
            version: Some(version),
            path: Some(path.into()),
            data: Some(data),
            ..Self::new(RecordAction::Patch, name)
        }
    }

    /// Single-path deletion.
    pub fn erase(name: impl Into<String>, version: Version, path: impl Into<String>) -> Self {
        Self {
            version: Some(version),
            path: Some(path.into()),
            ..Self::new(RecordAction::Erase, name)
        }
    }

    /// Create-if-absent push of a record authored offline.
    pub fn create_and_update(name: impl Into<String>, version: Version, data: Value) -> Self {
        Self {
            version: Some(version),
            data: Some(data),
            ..Self::new(RecordAction::CreateAndUpdate, name)
        }
    }

    /// Delete request.
    pub fn delete(name: impl Into<String>) -> Self {
        Self::new(RecordAction::Delete, name)
    }

    /// Attach a write-acknowledgment correlation id.
    pub fn with_correlation(mut self, id: u64) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Whether this message applies document content (PATCH/UPDATE/ERASE).
    pub fn is_write(&self) -> bool {
        matches!(
            self.action,
            RecordAction::Patch | RecordAction::Update | RecordAction::Erase
        )
    }
}
