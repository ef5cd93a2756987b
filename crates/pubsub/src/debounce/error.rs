use crate::broker::BrokerError;

use thiserror::Error;

/// Errors settling a debounced subscription.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The open batch is already being flushed; the topic was not added.
    #[error("a subscription batch is being flushed, retry the subscription")]
    FlushInProgress,

    /// The batched subscribe call failed.
    #[error("batched subscribe failed: {0}")]
    Broker(#[from] BrokerError),

    /// The flush task went away without settling the batch.
    #[error("subscription batch was dropped before it settled")]
    Aborted,
}
