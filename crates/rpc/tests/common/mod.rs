#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use relay_pubsub::{Broker, PubSub, PubSubOptions, Topic, TopicFilter};
use relay_pubsub_memory::{MemoryBroker, MemoryHub};
use relay_rpc::{HandlerError, RpcEngine, RpcHandler, RpcOptions, Value};

/// An engine with one in-memory broker connection.
pub struct Node {
    pub engine: RpcEngine,
    pub broker: MemoryBroker,
}

pub fn node(hub: &MemoryHub, name: &str, options: RpcOptions) -> Node {
    let broker = hub.connect(name);
    let brokers: Vec<Arc<dyn Broker>> = vec![Arc::new(broker.clone())];
    let pubsub = PubSub::new(brokers, PubSubOptions::default()).unwrap();

    Node {
        engine: RpcEngine::new(Arc::new(pubsub), options),
        broker,
    }
}

pub fn topic(s: &str) -> Topic {
    Topic::new(s).unwrap()
}

pub fn filter(s: &str) -> TopicFilter {
    TopicFilter::new(s).unwrap()
}

pub fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::Text(k.to_string()), v))
            .collect(),
    )
}

/// Echoes its parameters and counts invocations.
#[derive(Clone, Default)]
pub struct CountingEcho {
    pub calls: Arc<AtomicUsize>,
}

impl CountingEcho {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RpcHandler for CountingEcho {
    async fn handle(&self, params: Value, _topic: Topic) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(params)
    }
}
