mod reply;
mod serve;

use reply::{PendingCalls, ReplyRouter, Waiting};
use serve::ServeHandler;

use crate::correlation::CorrelationId;
use crate::dedup::Deduplicator;
use crate::error::{Error, Result};
use crate::handler::RpcHandler;
use crate::options::{CallOptions, ReplyMode, RpcOptions};
use crate::protocol::{CallEnvelope, ResponseEnvelope, codec};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use ciborium::Value;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use relay_pubsub::{HandlerId, HandlerRef, PubSub, SubscribeOptions, Topic, TopicFilter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::timeout;
use tracing::{debug, instrument};

type RouteReady = Shared<BoxFuture<'static, std::result::Result<(), relay_pubsub::client::Error>>>;

// In-flight or settled subscription of one shared reply filter.
struct ReplyRoute {
    generation: u64,
    ready: RouteReady,
}

struct EngineInner {
    pubsub: Arc<PubSub>,
    options: RpcOptions,
    dedup: Arc<Deduplicator>,
    pending: Arc<PendingCalls>,
    reply_handler: HandlerRef,
    reply_routes: Mutex<HashMap<TopicFilter, ReplyRoute>>,
    generations: AtomicU64,
}

/// A procedure registered with [`RpcEngine::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    filter: TopicFilter,
    handler: HandlerId,
}

impl Registration {
    /// The filter the procedure serves.
    #[must_use]
    pub const fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    /// The identity of the subscription handler.
    #[must_use]
    pub const fn handler_id(&self) -> HandlerId {
        self.handler
    }
}

/// Calls and serves procedures over a [`PubSub`] client.
///
/// Clones share the same pending calls, reply routes and replay window.
#[derive(Clone)]
pub struct RpcEngine {
    inner: Arc<EngineInner>,
}

impl RpcEngine {
    /// Creates an engine on top of `pubsub`.
    #[must_use]
    pub fn new(pubsub: Arc<PubSub>, options: RpcOptions) -> Self {
        let pending = Arc::new(PendingCalls::default());
        let reply_handler = HandlerRef::new(ReplyRouter {
            pending: Arc::clone(&pending),
        });

        Self {
            inner: Arc::new(EngineInner {
                pubsub,
                options,
                dedup: Arc::new(Deduplicator::new(options.dedup_capacity)),
                pending,
                reply_handler,
                reply_routes: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// The underlying publish/subscribe client.
    #[must_use]
    pub fn pubsub(&self) -> &Arc<PubSub> {
        &self.inner.pubsub
    }

    /// The engine settings.
    #[must_use]
    pub fn options(&self) -> &RpcOptions {
        &self.inner.options
    }

    /// Number of calls waiting for a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Calls the procedure on `topic` with the default call settings.
    ///
    /// # Errors
    ///
    /// See [`RpcEngine::call_value`]; additionally fails with a codec error if
    /// the parameters or the result do not convert.
    pub async fn call<P, R>(&self, topic: &Topic, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_with(topic, params, self.inner.options.call).await
    }

    /// Calls the procedure on `topic` with explicit call settings.
    ///
    /// # Errors
    ///
    /// See [`RpcEngine::call`].
    pub async fn call_with<P, R>(&self, topic: &Topic, params: &P, options: CallOptions) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = codec::to_value(params)?;
        let result = self.call_value(topic, params, options).await?;
        codec::from_value(&result)
    }

    /// Calls the procedure on `topic` with dynamic parameters.
    ///
    /// The timeout bounds the whole exchange: subscribing for the reply,
    /// publishing the request and waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no reply arrived in time.
    /// - [`Error::Remote`] if the procedure failed.
    /// - [`Error::PubSub`] if subscribing or publishing failed.
    /// - [`Error::Protocol`] or [`Error::Codec`] if the reply is malformed.
    /// - [`Error::CorrelationCollision`] if the generated token is already pending.
    #[instrument(skip(self, params, options), fields(timeout = ?options.timeout))]
    pub async fn call_value(
        &self,
        topic: &Topic,
        params: Value,
        options: CallOptions,
    ) -> Result<Value> {
        let id = CorrelationId::generate(options.id_size);
        let token = id.token();
        let reply_topic = topic.child(token.as_str())?;
        let request = CallEnvelope::new(&id, params.clone()).encode()?;

        let reply = self.inner.pending.register(&token)?;
        let _waiting = Waiting::new(&self.inner.pending, &token);

        let mut dedicated = None;
        let exchange = async {
            match self.inner.options.reply_mode {
                ReplyMode::Shared => self.ensure_reply_route(topic).await?,
                ReplyMode::Dedicated => {
                    // Recorded before awaiting so a timeout mid-subscribe still tears it down.
                    let filter = dedicated.insert(TopicFilter::from(reply_topic.clone()));
                    self.inner
                        .pubsub
                        .subscribe(filter, &self.inner.reply_handler, SubscribeOptions::one_off())
                        .await?;
                }
            }

            self.inner.pubsub.publish(topic, request).await?;
            let payload = reply.await.map_err(|_| Error::ChannelClosed)?;
            Ok::<Bytes, Error>(payload)
        };
        let outcome = timeout(options.timeout, exchange).await;

        if let Some(filter) = dedicated {
            self.inner
                .pubsub
                .unsubscribe(&filter, Some(self.inner.reply_handler.id()))
                .await;
        }

        let Ok(payload) = outcome else {
            debug!(%reply_topic, "call timed out");
            return Err(Error::Timeout {
                topic: topic.clone(),
                params,
                timeout: options.timeout,
            });
        };

        ResponseEnvelope::decode(&payload?)?
            .into_result()
            .map_err(Error::Remote)
    }

    // Subscribes `<topic>/+` once per topic. Concurrent calls share the
    // in-flight subscription; a failed one is forgotten so the next call retries.
    async fn ensure_reply_route(&self, topic: &Topic) -> Result<()> {
        let filter = topic.any();

        let (generation, ready) = {
            let mut routes = self.inner.reply_routes.lock();
            let route = routes.entry(filter.clone()).or_insert_with(|| {
                let pubsub = Arc::clone(&self.inner.pubsub);
                let handler = self.inner.reply_handler.clone();
                let route = filter.clone();
                let ready = async move {
                    pubsub
                        .subscribe(&route, &handler, SubscribeOptions::immediate_persistent())
                        .await
                }
                .boxed()
                .shared();

                ReplyRoute {
                    generation: self.inner.generations.fetch_add(1, Ordering::Relaxed),
                    ready,
                }
            });
            (route.generation, route.ready.clone())
        };

        if let Err(e) = ready.await {
            let mut routes = self.inner.reply_routes.lock();
            if routes
                .get(&filter)
                .is_some_and(|route| route.generation == generation)
            {
                routes.remove(&filter);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Serves `handler` on every topic matching `filter`.
    ///
    /// Each request is answered on `<request topic>/<token>`. Requests whose
    /// correlation id was already processed by this engine are dropped, so
    /// several registrations on overlapping filters answer a request once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PubSub`] if the subscription fails. After a broker
    /// failure the procedure stays registered and is subscribed again when the
    /// broker reconnects. A [`relay_pubsub::debounce::Error::FlushInProgress`]
    /// leaves nothing registered and can be retried.
    #[instrument(skip(self, handler))]
    pub async fn register<H: RpcHandler>(
        &self,
        filter: &TopicFilter,
        handler: H,
    ) -> Result<Registration> {
        let serve = HandlerRef::new(ServeHandler {
            publisher: self.inner.pubsub.publisher(),
            dedup: Arc::clone(&self.inner.dedup),
            procedure: Arc::new(handler),
        });

        self.inner
            .pubsub
            .subscribe(filter, &serve, SubscribeOptions::persistent())
            .await?;
        debug!(%filter, "procedure registered");

        Ok(Registration {
            filter: filter.clone(),
            handler: serve.id(),
        })
    }

    /// Stops serving a registration. Returns whether it was still registered.
    pub async fn unregister(&self, registration: &Registration) -> bool {
        self.inner
            .pubsub
            .unsubscribe(&registration.filter, Some(registration.handler))
            .await
    }
}
