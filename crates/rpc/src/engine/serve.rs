use crate::dedup::Deduplicator;
use crate::handler::RpcHandler;
use crate::protocol::{CallEnvelope, RemoteError, ResponseEnvelope};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ciborium::Value;
use futures::FutureExt;
use relay_pubsub::{HandlerError, MessageHandler, Publisher, Topic};
use tracing::{debug, error};

/// Serves one registered procedure: decodes requests, suppresses replays,
/// runs the procedure and publishes exactly one reply per request.
pub(super) struct ServeHandler {
    pub(super) publisher: Publisher,
    pub(super) dedup: Arc<Deduplicator>,
    pub(super) procedure: Arc<dyn RpcHandler>,
}

impl ServeHandler {
    async fn invoke(&self, params: Value, topic: &Topic) -> ResponseEnvelope {
        let call = self.procedure.handle(params, topic.clone());
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(result)) => ResponseEnvelope::success(result),
            Ok(Err(e)) => {
                debug!(%topic, "procedure failed: {e}");
                ResponseEnvelope::Error(e.into())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(%topic, "procedure panicked: {message}");
                ResponseEnvelope::Error(RemoteError::new(format!("handler panicked: {message}")))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[async_trait]
impl MessageHandler for ServeHandler {
    async fn handle(&self, topic: Topic, payload: Bytes) -> Result<(), HandlerError> {
        let request = CallEnvelope::decode(&payload)
            .map_err(|e| HandlerError::new(format!("dropping malformed request: {e}")))?;

        let token = request.correlation_id().token();
        if !self.dedup.check_and_record(&token) {
            debug!(%topic, %token, "dropping duplicate request");
            return Ok(());
        }

        let reply_topic = topic
            .child(token.as_str())
            .map_err(|e| HandlerError::new(e.to_string()))?;

        let response = self.invoke(request.params, &topic).await;
        let reply = response
            .encode()
            .map_err(|e| HandlerError::new(format!("cannot encode reply: {e}")))?;

        self.publisher
            .publish(&reply_topic, reply)
            .await
            .map_err(|e| HandlerError::new(format!("cannot publish reply: {e}")))
    }
}
