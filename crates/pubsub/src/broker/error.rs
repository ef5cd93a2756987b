use thiserror::Error;

/// Errors reported by a broker connection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The broker connection is not established.
    #[error("broker `{0}` is not connected")]
    NotConnected(String),

    /// Publishing a message failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Subscribing to one or more topics failed.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Unsubscribing from one or more topics failed.
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),

    /// The broker connection has been shut down.
    #[error("broker connection closed")]
    Closed,
}
