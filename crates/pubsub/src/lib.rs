//! Topic routing and subscription management over one or more pub/sub brokers.
//!
//! The crate is transport-agnostic: brokers are plugged in through the
//! [`broker::Broker`] trait, while this crate owns topic validation, the
//! wildcard dispatcher, subscription batching and the multi-broker client.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Brokers carry messages between nodes.
pub mod broker;

/// Multi-broker client tying dispatcher, debouncer and brokers together.
pub mod client;

/// Batches bursts of subscribe requests into a single broker round trip.
pub mod debounce;

/// Topic trie routing inbound messages to handlers.
pub mod dispatcher;

/// Handlers receive messages routed by the dispatcher.
pub mod handler;

/// Topics are hierarchical names messages are published to.
pub mod topic;

pub use broker::{Broker, BrokerError, BrokerEvent};
pub use client::{ClientEvent, PubSub, PubSubOptions, Publisher, SubscribeOptions};
pub use dispatcher::Dispatcher;
pub use handler::{HandlerError, HandlerId, HandlerRef, MessageHandler, handler_fn};
pub use topic::{Topic, TopicFilter};
