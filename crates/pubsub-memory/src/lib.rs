//! In-memory broker for tests and single-process deployments.
//!
//! Brokers connected to the same [`MemoryHub`] see each other's publishes,
//! the way clients of one real broker would. Each hub is an isolated bus, so
//! tests running in parallel do not interfere. Connections can be taken
//! offline and can be told to fail upcoming operations.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use relay_pubsub::broker::BrokerEvents;
use relay_pubsub::{Broker, BrokerError, BrokerEvent, Topic, TopicFilter};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct HubInner {
    connections: DashMap<u64, Arc<Connection>>,
    next_id: AtomicU64,
}

impl HubInner {
    fn route(&self, topic: &Topic, payload: &Bytes) -> usize {
        let mut delivered = 0;
        for entry in &self.connections {
            let connection = entry.value();
            if !connection.connected.load(Ordering::SeqCst) {
                continue;
            }
            let matched = connection
                .filters
                .lock()
                .iter()
                .any(|filter| filter.matches(topic));
            if !matched {
                continue;
            }

            let copies = if connection.duplicate.load(Ordering::SeqCst) {
                2
            } else {
                1
            };
            for _ in 0..copies {
                let _ = connection.events.send(BrokerEvent::Message {
                    topic: topic.clone(),
                    payload: payload.clone(),
                });
            }
            delivered += 1;
        }
        delivered
    }
}

/// Shared in-process bus.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection that is already established.
    #[must_use]
    pub fn connect<K: Into<String>>(&self, name: K) -> MemoryBroker {
        self.open(name.into(), true)
    }

    /// Opens a connection that stays offline until [`MemoryBroker::go_online`].
    #[must_use]
    pub fn connect_offline<K: Into<String>>(&self, name: K) -> MemoryBroker {
        self.open(name.into(), false)
    }

    /// Number of connections opened on this hub.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    fn open(&self, name: String, connected: bool) -> MemoryBroker {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection {
            name,
            connected: AtomicBool::new(connected),
            filters: Mutex::new(BTreeSet::new()),
            events: broadcast::channel(EVENT_CAPACITY).0,
            faults: Mutex::new(Faults::default()),
            duplicate: AtomicBool::new(false),
            subscribe_delay: Mutex::new(Duration::ZERO),
            subscribe_batches: Mutex::new(Vec::new()),
            unsubscribe_batches: Mutex::new(Vec::new()),
            reconnects: AtomicUsize::new(0),
        });
        self.inner.connections.insert(id, Arc::clone(&connection));
        debug!(name = connection.name, id, connected, "memory broker opened");

        MemoryBroker {
            connection,
            hub: Arc::downgrade(&self.inner),
        }
    }
}

#[derive(Default)]
struct Faults {
    subscribes: usize,
    publishes: usize,
}

struct Connection {
    name: String,
    connected: AtomicBool,
    filters: Mutex<BTreeSet<TopicFilter>>,
    events: broadcast::Sender<BrokerEvent>,
    faults: Mutex<Faults>,
    duplicate: AtomicBool,
    subscribe_delay: Mutex<Duration>,
    subscribe_batches: Mutex<Vec<Vec<TopicFilter>>>,
    unsubscribe_batches: Mutex<Vec<Vec<TopicFilter>>>,
    reconnects: AtomicUsize,
}

impl Connection {
    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected(self.name.clone()))
        }
    }

    fn take_fault(counter: &mut usize) -> bool {
        if *counter == 0 {
            return false;
        }
        *counter -= 1;
        true
    }

    fn go_offline(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.filters.lock().clear();
        let _ = self.events.send(BrokerEvent::Disconnected);
    }

    fn go_online(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(BrokerEvent::Connected);
    }
}

/// One connection to a [`MemoryHub`].
///
/// Clones share the connection, so a test can keep a handle for fault
/// injection while the client owns another.
#[derive(Clone)]
pub struct MemoryBroker {
    connection: Arc<Connection>,
    hub: Weak<HubInner>,
}

impl MemoryBroker {
    /// Establishes an offline connection and announces it.
    pub fn go_online(&self) {
        self.connection.go_online();
    }

    /// Drops the connection. Broker-side subscriptions are lost.
    pub fn disconnect(&self) {
        self.connection.go_offline();
    }

    /// Makes the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.connection.faults.lock().subscribes = count;
    }

    /// Makes the next `count` publish calls fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.connection.faults.lock().publishes = count;
    }

    /// Delivers every matching message twice while enabled.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.connection.duplicate.store(enabled, Ordering::SeqCst);
    }

    /// Holds every subscribe call for `delay` before it takes effect.
    pub fn set_subscribe_delay(&self, delay: Duration) {
        *self.connection.subscribe_delay.lock() = delay;
    }

    /// Reports an asynchronous connection error to the event stream.
    pub fn raise(&self, error: BrokerError) {
        let _ = self.connection.events.send(BrokerEvent::Error(error));
    }

    /// Filters currently subscribed on the connection.
    #[must_use]
    pub fn filters(&self) -> Vec<TopicFilter> {
        self.connection.filters.lock().iter().cloned().collect()
    }

    /// Every subscribe call made on the connection, failed ones included.
    #[must_use]
    pub fn subscribe_batches(&self) -> Vec<Vec<TopicFilter>> {
        self.connection.subscribe_batches.lock().clone()
    }

    /// Every unsubscribe call made on the connection.
    #[must_use]
    pub fn unsubscribe_batches(&self) -> Vec<Vec<TopicFilter>> {
        self.connection.unsubscribe_batches.lock().clone()
    }

    /// How many times the connection was asked to reconnect.
    #[must_use]
    pub fn reconnect_count(&self) -> usize {
        self.connection.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &str {
        &self.connection.name
    }

    fn is_connected(&self) -> bool {
        self.connection.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), BrokerError> {
        self.connection.ensure_connected()?;
        if Connection::take_fault(&mut self.connection.faults.lock().publishes) {
            return Err(BrokerError::Publish(format!("injected failure on {topic}")));
        }

        let hub = self.hub.upgrade().ok_or(BrokerError::Closed)?;
        let delivered = hub.route(topic, &payload);
        trace!(broker = self.name(), %topic, delivered, "published");
        Ok(())
    }

    async fn subscribe(&self, filters: &[TopicFilter]) -> Result<(), BrokerError> {
        self.connection.ensure_connected()?;
        let delay = *self.connection.subscribe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.connection
            .subscribe_batches
            .lock()
            .push(filters.to_vec());
        if Connection::take_fault(&mut self.connection.faults.lock().subscribes) {
            return Err(BrokerError::Subscribe(format!(
                "injected failure on {}",
                self.name()
            )));
        }

        self.connection
            .filters
            .lock()
            .extend(filters.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, filters: &[TopicFilter]) -> Result<(), BrokerError> {
        self.connection.ensure_connected()?;
        self.connection
            .unsubscribe_batches
            .lock()
            .push(filters.to_vec());

        let mut current = self.connection.filters.lock();
        for filter in filters {
            current.remove(filter);
        }
        Ok(())
    }

    fn reconnect(&self) {
        self.connection.reconnects.fetch_add(1, Ordering::SeqCst);
        debug!(broker = self.name(), "reconnecting");
        self.connection.go_offline();
        self.connection.go_online();
    }

    fn events(&self) -> BrokerEvents {
        BroadcastStream::new(self.connection.events.subscribe())
            .filter_map(|event| futures::future::ready(event.ok()))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use std::time::Duration;
    use tokio::time::timeout;

    fn topic(s: &str) -> Topic {
        Topic::new(s).unwrap()
    }

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::new(s).unwrap()
    }

    async fn next_message(events: &mut BrokerEvents) -> Option<(Topic, Bytes)> {
        loop {
            match timeout(Duration::from_millis(100), events.next()).await {
                Ok(Some(BrokerEvent::Message { topic, payload })) => {
                    return Some((topic, payload));
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_connections() {
        let hub = MemoryHub::new();
        let a = hub.connect("a");
        let b = hub.connect("b");
        let mut a_events = a.events();
        let mut b_events = b.events();

        a.subscribe(&[filter("svc/+")]).await.unwrap();
        b.subscribe(&[filter("other")]).await.unwrap();
        b.publish(&topic("svc/echo"), Bytes::from_static(b"hi"))
            .await
            .unwrap();

        assert_eq!(
            next_message(&mut a_events).await,
            Some((topic("svc/echo"), Bytes::from_static(b"hi")))
        );
        assert_eq!(next_message(&mut b_events).await, None);
    }

    #[tokio::test]
    async fn test_hubs_are_isolated() {
        let first = MemoryHub::new().connect("a");
        let second = MemoryHub::new().connect("b");
        let mut events = second.events();

        second.subscribe(&[filter("t")]).await.unwrap();
        first.publish(&topic("t"), Bytes::new()).await.unwrap();

        assert_eq!(next_message(&mut events).await, None);
    }

    #[tokio::test]
    async fn test_offline_connection_refuses_operations() {
        let hub = MemoryHub::new();
        let broker = hub.connect_offline("a");

        assert!(!broker.is_connected());
        assert_matches!(
            broker.publish(&topic("t"), Bytes::new()).await,
            Err(BrokerError::NotConnected(_))
        );
        assert_matches!(
            broker.subscribe(&[filter("t")]).await,
            Err(BrokerError::NotConnected(_))
        );

        broker.go_online();
        assert!(broker.is_connected());
        broker.subscribe(&[filter("t")]).await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let hub = MemoryHub::new();
        let broker = hub.connect("a");
        broker.fail_next_subscribes(1);
        broker.fail_next_publishes(1);

        assert_matches!(
            broker.subscribe(&[filter("t")]).await,
            Err(BrokerError::Subscribe(_))
        );
        assert!(broker.filters().is_empty());
        broker.subscribe(&[filter("t")]).await.unwrap();
        assert_eq!(broker.filters(), vec![filter("t")]);
        assert_eq!(broker.subscribe_batches().len(), 2);

        assert_matches!(
            broker.publish(&topic("t"), Bytes::new()).await,
            Err(BrokerError::Publish(_))
        );
        broker.publish(&topic("t"), Bytes::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_drops_filters_and_announces() {
        let hub = MemoryHub::new();
        let broker = hub.connect("a");
        let mut events = broker.events();
        broker.subscribe(&[filter("t")]).await.unwrap();

        broker.reconnect();

        assert!(broker.filters().is_empty());
        assert_eq!(broker.reconnect_count(), 1);
        assert_matches!(events.next().await, Some(BrokerEvent::Disconnected));
        assert_matches!(events.next().await, Some(BrokerEvent::Connected));
    }

    #[tokio::test]
    async fn test_duplicate_delivery() {
        let hub = MemoryHub::new();
        let broker = hub.connect("a");
        let mut events = broker.events();
        broker.subscribe(&[filter("t")]).await.unwrap();
        broker.set_duplicate_delivery(true);

        broker.publish(&topic("t"), Bytes::new()).await.unwrap();

        assert!(next_message(&mut events).await.is_some());
        assert!(next_message(&mut events).await.is_some());
        assert_eq!(next_message(&mut events).await, None);
    }
}
