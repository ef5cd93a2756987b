//! Error types for RPC calls.

use crate::protocol::RemoteError;

use std::time::Duration;

use ciborium::Value;
use relay_pubsub::Topic;
use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No reply arrived in time. The remote handler may still have run.
    #[error("call to {topic} timed out after {timeout:?}")]
    Timeout {
        /// The topic that was called.
        topic: Topic,
        /// The parameters of the call.
        params: Value,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The remote handler failed.
    #[error("remote handler failed: {0}")]
    Remote(RemoteError),

    /// A message did not follow the request/response format.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Serialization or deserialization failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The generated correlation token is already waiting for a reply.
    #[error("correlation token {0} is already pending")]
    CorrelationCollision(String),

    /// Publishing or subscribing failed.
    #[error(transparent)]
    PubSub(#[from] relay_pubsub::client::Error),

    /// A topic could not be derived.
    #[error(transparent)]
    Topic(#[from] relay_pubsub::topic::Error),

    /// The reply waiter was dropped without an answer.
    #[error("Channel closed")]
    ChannelClosed,
}

/// Protocol-level errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A response carried neither a result nor an error.
    #[error("response has neither `result` nor `error`")]
    EmptyResponse,

    /// A response carried both a result and an error.
    #[error("response has both `result` and `error`")]
    AmbiguousResponse,

    /// A request carried an empty correlation id.
    #[error("request has an empty correlation id")]
    EmptyCorrelationId,
}

/// Codec-related errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),
}
