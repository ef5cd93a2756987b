use crate::error::Error;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relay_pubsub::{HandlerError, MessageHandler, Topic};
use tokio::sync::oneshot;
use tracing::trace;

/// Calls waiting for a reply, keyed by correlation token.
#[derive(Default)]
pub(super) struct PendingCalls {
    waiters: DashMap<String, oneshot::Sender<Bytes>>,
}

impl PendingCalls {
    pub(super) fn register(&self, token: &str) -> Result<oneshot::Receiver<Bytes>, Error> {
        match self.waiters.entry(token.to_string()) {
            Entry::Occupied(_) => Err(Error::CorrelationCollision(token.to_string())),
            Entry::Vacant(slot) => {
                let (sender, receiver) = oneshot::channel();
                slot.insert(sender);
                Ok(receiver)
            }
        }
    }

    /// Hands `payload` to the waiter of `token`. The first reply wins.
    pub(super) fn resolve(&self, token: &str, payload: Bytes) -> bool {
        self.waiters
            .remove(token)
            .is_some_and(|(_, sender)| sender.send(payload).is_ok())
    }

    pub(super) fn forget(&self, token: &str) {
        self.waiters.remove(token);
    }

    pub(super) fn len(&self) -> usize {
        self.waiters.len()
    }
}

/// Removes the waiter when the call ends, however it ends.
pub(super) struct Waiting<'a> {
    pending: &'a PendingCalls,
    token: &'a str,
}

impl<'a> Waiting<'a> {
    pub(super) const fn new(pending: &'a PendingCalls, token: &'a str) -> Self {
        Self { pending, token }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.pending.forget(self.token);
    }
}

/// Routes replies to waiting calls by the last segment of the reply topic.
pub(super) struct ReplyRouter {
    pub(super) pending: std::sync::Arc<PendingCalls>,
}

#[async_trait]
impl MessageHandler for ReplyRouter {
    async fn handle(&self, topic: Topic, payload: Bytes) -> Result<(), HandlerError> {
        if !self.pending.resolve(topic.last_segment(), payload) {
            trace!(%topic, "reply without a waiting call");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn test_token_collision_is_refused() {
        let pending = PendingCalls::default();

        let _receiver = pending.register("abc").unwrap();
        assert_matches!(
            pending.register("abc"),
            Err(Error::CorrelationCollision(token)) if token == "abc"
        );
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_first_reply_wins() {
        let pending = PendingCalls::default();
        let receiver = pending.register("abc").unwrap();

        assert!(pending.resolve("abc", Bytes::from_static(b"one")));
        assert!(!pending.resolve("abc", Bytes::from_static(b"two")));
        assert_eq!(receiver.await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_waiting_guard_forgets() {
        let pending = PendingCalls::default();
        let _receiver = pending.register("abc").unwrap();

        drop(Waiting::new(&pending, "abc"));

        assert_eq!(pending.len(), 0);
        assert!(!pending.resolve("abc", Bytes::new()));
    }

    #[tokio::test]
    async fn test_router_uses_last_segment() {
        let pending = std::sync::Arc::new(PendingCalls::default());
        let receiver = pending.register("tok").unwrap();
        let router = ReplyRouter {
            pending: pending.clone(),
        };

        router
            .handle(Topic::new("svc/echo/tok").unwrap(), Bytes::from_static(b"r"))
            .await
            .unwrap();
        router
            .handle(Topic::new("svc/echo/late").unwrap(), Bytes::new())
            .await
            .unwrap();

        assert_eq!(receiver.await.unwrap(), Bytes::from_static(b"r"));
    }
}
