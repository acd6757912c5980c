//! Configuration for record synchronization.

use std::time::Duration;

/// Tunable timings for a record's protocol interactions.
#[derive(Debug, Clone)]
pub struct RecordOptions {
    /// How long to wait for a read/head response before the timeout registry
    /// reports it.
    pub read_timeout: Duration,
    /// How long to wait for a delete confirmation.
    pub delete_timeout: Duration,
    /// Grace period after the last reference is discarded before the record
    /// unsubscribes for good.
    pub discard_timeout: Duration,
}

impl RecordOptions {
    /// Sets the read-response timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the delete-confirmation timeout.
    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    /// Sets the discard grace period.
    pub fn with_discard_timeout(mut self, timeout: Duration) -> Self {
        self.discard_timeout = timeout;
        self
    }
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(15),
            delete_timeout: Duration::from_secs(15),
            discard_timeout: Duration::from_secs(30),
        }
    }
}
