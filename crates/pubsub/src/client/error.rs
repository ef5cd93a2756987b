use crate::broker::BrokerError;
use crate::debounce;

use thiserror::Error;

/// Errors surfaced by the [`PubSub`](super::PubSub) client.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The client was built without any broker.
    #[error("at least one broker is required")]
    NoBrokers,

    /// A broker operation failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The debounced subscription could not be completed.
    #[error(transparent)]
    Debounce(#[from] debounce::Error),
}
