use crate::topic::Topic;

use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Error returned by a message handler.
#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Creates a new handler error with the given message.
    pub fn new<K: Into<String>>(message: K) -> Self {
        Self(message.into())
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

/// A trait representing a consumer of messages routed by topic.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles a message published to `topic`.
    async fn handle(&self, topic: Topic, payload: Bytes) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct HandlerFn<F>(F);

/// Wraps an async closure as a [`MessageHandler`].
pub const fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Topic, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Topic, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, topic: Topic, payload: Bytes) -> Result<(), HandlerError> {
        (self.0)(topic, payload).await
    }
}

/// Identity of a registered handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// A handler together with its identity.
///
/// Clones share the identity, so the same `HandlerRef` can be added to and
/// removed from several topics as an exact-match set member.
#[derive(Clone)]
pub struct HandlerRef {
    id: HandlerId,
    handler: Arc<dyn MessageHandler>,
}

impl HandlerRef {
    /// Wraps a handler with a fresh identity.
    pub fn new<H: MessageHandler>(handler: H) -> Self {
        Self::from_arc(Arc::new(handler))
    }

    /// Wraps a shared handler with a fresh identity.
    pub fn from_arc(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            id: HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed)),
            handler,
        }
    }

    /// The identity of this handler.
    #[must_use]
    pub const fn id(&self) -> HandlerId {
        self.id
    }

    /// Invokes the handler.
    ///
    /// # Errors
    /// Returns whatever error the wrapped handler returns.
    pub async fn handle(&self, topic: Topic, payload: Bytes) -> Result<(), HandlerError> {
        self.handler.handle(topic, payload).await
    }
}

impl Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRef").field("id", &self.id).finish()
    }
}

impl PartialEq for HandlerRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for HandlerRef {}
