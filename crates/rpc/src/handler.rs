//! Server-side procedure handlers.

use crate::protocol::RemoteError;

use std::future::Future;

use async_trait::async_trait;
use ciborium::Value;
use relay_pubsub::Topic;
use thiserror::Error;

/// Failure returned by a procedure; sent to the caller as the `error` branch.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    data: Option<Value>,
}

impl HandlerError {
    /// Creates an error with a message.
    pub fn new<K: Into<String>>(message: K) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The structured details, if any.
    #[must_use]
    pub const fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }
}

impl From<HandlerError> for RemoteError {
    fn from(error: HandlerError) -> Self {
        Self {
            message: error.message,
            data: error.data,
        }
    }
}

/// A procedure exposed on a topic filter.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handles one request. `topic` is the concrete topic the request was
    /// published to. Returning `Value::Null` replies with an empty map.
    async fn handle(&self, params: Value, topic: Topic) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into an [`RpcHandler`].
pub struct HandlerFn<F>(F);

/// Wraps an async closure as an [`RpcHandler`].
pub const fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Value, Topic) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> RpcHandler for HandlerFn<F>
where
    F: Fn(Value, Topic) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, params: Value, topic: Topic) -> Result<Value, HandlerError> {
        (self.0)(params, topic).await
    }
}
