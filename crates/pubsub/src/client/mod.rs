//! Multi-broker publish/subscribe client.

mod error;

pub use error::Error;

use crate::broker::{Broker, BrokerError, BrokerEvent, BrokerEvents};
use crate::debounce::{self, BatchSink, Debouncer};
use crate::dispatcher::Dispatcher;
use crate::handler::{HandlerId, HandlerRef};
use crate::topic::{Topic, TopicFilter};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Configuration for the [`PubSub`] client.
#[derive(Debug, Clone)]
pub struct PubSubOptions {
    /// How long a subscription batch collects topics before it is flushed.
    pub debounce_window: Duration,
    /// Capacity of the connection event channel.
    pub event_capacity: usize,
}

impl Default for PubSubOptions {
    fn default() -> Self {
        Self {
            debounce_window: debounce::DEFAULT_WINDOW,
            event_capacity: 64,
        }
    }
}

impl PubSubOptions {
    /// Set the subscription batching window.
    #[must_use]
    pub const fn debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Set the capacity of the connection event channel.
    #[must_use]
    pub const fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// How a subscription is established and kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Replay the subscription every time a broker (re)connects.
    pub persistent: bool,
    /// Join the shared subscription batch instead of subscribing at once.
    pub debounce: bool,
}

impl SubscribeOptions {
    /// Debounced subscription replayed on every reconnect.
    #[must_use]
    pub const fn persistent() -> Self {
        Self {
            persistent: true,
            debounce: true,
        }
    }

    /// Immediate subscription on the currently connected brokers only.
    #[must_use]
    pub const fn one_off() -> Self {
        Self {
            persistent: false,
            debounce: false,
        }
    }

    /// Immediate subscription that is still replayed on reconnect.
    #[must_use]
    pub const fn immediate_persistent() -> Self {
        Self {
            persistent: true,
            debounce: false,
        }
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self::persistent()
    }
}

/// Connection changes and errors of the underlying brokers, by broker index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The broker connected or reconnected.
    Connected(usize),
    /// The broker lost its connection.
    Disconnected(usize),
    /// The broker reported an error, or replaying its subscriptions failed.
    Error(usize, BrokerError),
}

/// Publishing half of the client.
///
/// Holds only the brokers, so it can be captured by message handlers without
/// keeping the dispatcher that owns those handlers alive.
#[derive(Clone)]
pub struct Publisher {
    brokers: Arc<[Arc<dyn Broker>]>,
}

impl Publisher {
    /// Publishes to the first connected broker, or the first broker if none is
    /// connected.
    ///
    /// # Errors
    /// Returns the broker's error if the publish fails.
    pub async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), Error> {
        let broker = self
            .brokers
            .iter()
            .find(|broker| broker.is_connected())
            .or_else(|| self.brokers.first())
            .ok_or(Error::NoBrokers)?;

        broker.publish(topic, payload).await.map_err(Error::from)
    }

    /// Whether any broker is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.brokers.iter().any(|broker| broker.is_connected())
    }

    fn connected(&self) -> impl Iterator<Item = &Arc<dyn Broker>> {
        self.brokers.iter().filter(|broker| broker.is_connected())
    }

    // Brokers that fail are asked to reconnect; their replay restores the filters.
    async fn subscribe_connected(&self, filters: &[TopicFilter]) -> Result<(), BrokerError> {
        let outcomes = join_all(self.connected().map(|broker| async move {
            let outcome = broker.subscribe(filters).await;
            if let Err(e) = &outcome {
                warn!(broker = broker.name(), "subscribe failed, reconnecting: {e}");
                broker.reconnect();
            }
            outcome
        }))
        .await;

        outcomes.into_iter().collect()
    }

    async fn unsubscribe_connected(&self, filters: &[TopicFilter]) {
        let outcomes = join_all(self.connected().map(|broker| async move {
            (broker.name(), broker.unsubscribe(filters).await)
        }))
        .await;

        for (name, outcome) in outcomes {
            if let Err(e) = outcome {
                warn!(broker = name, "unsubscribe failed: {e}");
            }
        }
    }
}

#[async_trait]
impl BatchSink for Publisher {
    async fn subscribe_batch(&self, topics: Vec<TopicFilter>) -> Result<(), BrokerError> {
        self.subscribe_connected(&topics).await
    }
}

/// Publish/subscribe client over one or more brokers.
///
/// Inbound messages from every broker are routed through one [`Dispatcher`].
/// Persistent subscriptions are remembered and replayed whenever a broker
/// reports that it (re)connected.
pub struct PubSub {
    publisher: Publisher,
    dispatcher: Arc<Dispatcher>,
    debouncer: Debouncer,
    persistent: Arc<Mutex<BTreeSet<TopicFilter>>>,
    events: broadcast::Sender<ClientEvent>,
    shutdown: CancellationToken,
}

impl PubSub {
    /// Creates a client and starts one event pump per broker.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`Error::NoBrokers`] if `brokers` is empty.
    pub fn new(brokers: Vec<Arc<dyn Broker>>, options: PubSubOptions) -> Result<Self, Error> {
        if brokers.is_empty() {
            return Err(Error::NoBrokers);
        }

        let publisher = Publisher {
            brokers: brokers.into(),
        };
        let dispatcher = Arc::new(Dispatcher::new());
        let persistent = Arc::new(Mutex::new(BTreeSet::new()));
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let shutdown = CancellationToken::new();

        for (index, broker) in publisher.brokers.iter().enumerate() {
            let pump = Pump {
                index,
                broker: Arc::clone(broker),
                dispatcher: Arc::clone(&dispatcher),
                persistent: Arc::clone(&persistent),
                events: events.clone(),
            };
            tokio::spawn(pump.run(broker.events(), shutdown.child_token()));
        }

        let debouncer = Debouncer::new(options.debounce_window, Arc::new(publisher.clone()));

        Ok(Self {
            publisher,
            dispatcher,
            debouncer,
            persistent,
            events,
            shutdown,
        })
    }

    /// A cloneable handle that can only publish.
    #[must_use]
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// The dispatcher routing inbound messages.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Number of subscription batches flushed so far.
    #[must_use]
    pub fn batches_flushed(&self) -> u64 {
        self.debouncer.batches_flushed()
    }

    /// Filters replayed on reconnect.
    #[must_use]
    pub fn persistent_topics(&self) -> Vec<TopicFilter> {
        self.persistent.lock().iter().cloned().collect()
    }

    /// Whether any broker is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.publisher.is_connected()
    }

    /// Receives broker connection changes and errors from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Publishes a payload, see [`Publisher::publish`].
    ///
    /// # Errors
    /// Returns the broker's error if the publish fails.
    pub async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), Error> {
        self.publisher.publish(topic, payload).await
    }

    /// Routes messages matching `filter` to `handler` and subscribes the brokers.
    ///
    /// For persistent subscriptions a transport failure leaves the handler in
    /// place; the failing broker reconnects and the replay retries. Only a
    /// fail-fast [`debounce::Error::FlushInProgress`] is rolled back, so the
    /// caller can simply retry. One-off subscriptions are rolled back on any
    /// failure.
    ///
    /// # Errors
    /// Returns the broker or batching error of the subscription.
    #[instrument(skip(self, handler), fields(handler = ?handler.id()))]
    pub async fn subscribe(
        &self,
        filter: &TopicFilter,
        handler: &HandlerRef,
        options: SubscribeOptions,
    ) -> Result<(), Error> {
        if !options.persistent {
            let added = self.dispatcher.subscribe(filter, handler);
            let outcome = self.publisher.subscribe_connected(std::slice::from_ref(filter)).await;
            if let Err(e) = outcome {
                if added {
                    self.unsubscribe(filter, Some(handler.id())).await;
                }
                return Err(e.into());
            }
            return Ok(());
        }

        let recorded = self.persistent.lock().insert(filter.clone());
        let added = self.dispatcher.subscribe(filter, handler);

        if !options.debounce {
            return self
                .publisher
                .subscribe_connected(std::slice::from_ref(filter))
                .await
                .map_err(Error::from);
        }

        match self.debouncer.subscribe(filter.clone()).await {
            Err(debounce::Error::FlushInProgress) => {
                if added {
                    self.dispatcher.unsubscribe(filter, Some(handler.id()));
                }
                if recorded && !self.dispatcher.has_subscribers(filter) {
                    self.persistent.lock().remove(filter);
                }
                debug!(%filter, "subscription batch busy, rolled back");
                Err(debounce::Error::FlushInProgress.into())
            }
            outcome => outcome.map_err(Error::from),
        }
    }

    /// Stops routing to `handler`, or to every handler of `filter` when `None`.
    ///
    /// Routing stops before this returns. Once no handler remains at the path
    /// the filter is forgotten and unsubscribed on the connected brokers;
    /// broker failures are logged only. Returns whether anything was removed.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, filter: &TopicFilter, handler: Option<HandlerId>) -> bool {
        let removed = self.dispatcher.unsubscribe(filter, handler);
        if !removed || self.dispatcher.has_subscribers(filter) {
            return removed;
        }

        self.persistent.lock().remove(filter);
        self.publisher
            .unsubscribe_connected(std::slice::from_ref(filter))
            .await;
        removed
    }

    /// Stops the event pumps. Messages arriving afterwards are not routed.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for PubSub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Pump {
    index: usize,
    broker: Arc<dyn Broker>,
    dispatcher: Arc<Dispatcher>,
    persistent: Arc<Mutex<BTreeSet<TopicFilter>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl Pump {
    async fn run(self, mut stream: BrokerEvents, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = stream.next() => event,
            };

            match event {
                Some(BrokerEvent::Connected) => {
                    info!(broker = self.broker.name(), "broker connected");
                    let _ = self.events.send(ClientEvent::Connected(self.index));
                    self.replay();
                }
                Some(BrokerEvent::Disconnected) => {
                    info!(broker = self.broker.name(), "broker disconnected");
                    let _ = self.events.send(ClientEvent::Disconnected(self.index));
                }
                Some(BrokerEvent::Error(e)) => {
                    warn!(broker = self.broker.name(), "broker error: {e}");
                    let _ = self.events.send(ClientEvent::Error(self.index, e));
                }
                Some(BrokerEvent::Message { topic, payload }) => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    tokio::spawn(async move {
                        dispatcher.dispatch(&topic, payload).await;
                    });
                }
                None => {
                    debug!(broker = self.broker.name(), "broker event stream ended");
                    break;
                }
            }
        }
    }

    fn replay(&self) {
        let filters: Vec<TopicFilter> = self.persistent.lock().iter().cloned().collect();
        if filters.is_empty() {
            return;
        }

        let broker = Arc::clone(&self.broker);
        let events = self.events.clone();
        let index = self.index;
        tokio::spawn(async move {
            debug!(broker = broker.name(), count = filters.len(), "replaying subscriptions");
            if let Err(e) = broker.subscribe(&filters).await {
                warn!(broker = broker.name(), "replay failed, reconnecting: {e}");
                let _ = events.send(ClientEvent::Error(index, e));
                broker.reconnect();
            }
        });
    }
}
