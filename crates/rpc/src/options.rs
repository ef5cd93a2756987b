//! Call and engine configuration.

use crate::correlation::DEFAULT_ID_SIZE;
use crate::dedup::DEFAULT_CAPACITY;

use std::time::Duration;

/// Per-call settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// How long to wait for the reply, including subscribing and publishing.
    pub timeout: Duration,
    /// Number of random bytes in the correlation id.
    pub id_size: usize,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            id_size: DEFAULT_ID_SIZE,
        }
    }
}

impl CallOptions {
    /// Set the reply timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the correlation id size in bytes.
    #[must_use]
    pub const fn id_size(mut self, id_size: usize) -> Self {
        self.id_size = id_size;
        self
    }
}

/// How callers listen for replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyMode {
    /// One `<topic>/+` subscription per called topic, shared by every call to
    /// it and kept for the lifetime of the engine.
    #[default]
    Shared,
    /// One exact subscription per call, removed when the call ends.
    Dedicated,
}

/// Engine-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcOptions {
    /// Settings used by calls that do not pass their own.
    pub call: CallOptions,
    /// Number of request tokens remembered for replay suppression.
    pub dedup_capacity: usize,
    /// How replies are subscribed to.
    pub reply_mode: ReplyMode,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            call: CallOptions::default(),
            dedup_capacity: DEFAULT_CAPACITY,
            reply_mode: ReplyMode::default(),
        }
    }
}

impl RpcOptions {
    /// Set the default call settings.
    #[must_use]
    pub const fn call(mut self, call: CallOptions) -> Self {
        self.call = call;
        self
    }

    /// Set the replay suppression window.
    #[must_use]
    pub const fn dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    /// Set how replies are subscribed to.
    #[must_use]
    pub const fn reply_mode(mut self, mode: ReplyMode) -> Self {
        self.reply_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RpcOptions::default();

        assert_eq!(options.call.timeout, Duration::from_millis(10_000));
        assert_eq!(options.call.id_size, 16);
        assert_eq!(options.dedup_capacity, 100);
        assert_eq!(options.reply_mode, ReplyMode::Shared);
    }

    #[test]
    fn test_builders() {
        let options = RpcOptions::default()
            .call(CallOptions::default().timeout(Duration::from_millis(50)).id_size(8))
            .reply_mode(ReplyMode::Dedicated)
            .dedup_capacity(5);

        assert_eq!(options.call.timeout, Duration::from_millis(50));
        assert_eq!(options.call.id_size, 8);
        assert_eq!(options.reply_mode, ReplyMode::Dedicated);
        assert_eq!(options.dedup_capacity, 5);
    }
}
