mod error;

pub use error::Error as BrokerError;

use crate::topic::{Topic, TopicFilter};

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

/// Events emitted by a broker connection.
#[derive(Clone, Debug)]
pub enum BrokerEvent {
    /// The connection was (re-)established. Broker-side subscriptions may have been lost.
    Connected,

    /// The connection dropped.
    Disconnected,

    /// The connection hit an error outside of any call, such as a socket failure.
    Error(BrokerError),

    /// A message matching one of the connection's subscriptions arrived.
    Message {
        /// The concrete topic the message was published to.
        topic: Topic,
        /// The raw message payload.
        payload: Bytes,
    },
}

/// Stream of events from one broker connection.
pub type BrokerEvents = Pin<Box<dyn Stream<Item = BrokerEvent> + Send>>;

/// A single connection to a publish/subscribe broker.
///
/// Delivery is at-least-once and unordered; matching messages arrive through
/// [`Broker::events`] until the filter is unsubscribed or the connection drops.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// A short name used in logs.
    fn name(&self) -> &str;

    /// Whether the connection is currently established.
    fn is_connected(&self) -> bool;

    /// Publishes a payload to a concrete topic.
    async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribes the connection to every filter in one round trip.
    async fn subscribe(&self, filters: &[TopicFilter]) -> Result<(), BrokerError>;

    /// Removes the connection's subscriptions for the given filters.
    async fn unsubscribe(&self, filters: &[TopicFilter]) -> Result<(), BrokerError>;

    /// Asks the connection to drop and re-establish itself.
    fn reconnect(&self);

    /// Gets a stream of connection events and inbound messages.
    fn events(&self) -> BrokerEvents;
}
