//! Request/response calls over publish/subscribe brokers.
//!
//! A caller publishes a CBOR request carrying a random correlation id to the
//! procedure's topic and waits for the reply on `<topic>/<token>`, where the
//! token is the URL-safe base64 rendering of the id. Callees register a
//! handler on a topic filter, suppress requests they have already seen and
//! publish exactly one reply per request.
//!
//! Delivery underneath is at-least-once and unordered, so a call may time out
//! even though the remote handler ran.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod correlation;
pub mod dedup;
mod engine;
pub mod error;
pub mod handler;
pub mod options;
pub mod protocol;

pub use correlation::CorrelationId;
pub use dedup::Deduplicator;
pub use engine::{Registration, RpcEngine};
pub use error::{Error, Result};
pub use handler::{HandlerError, RpcHandler, handler_fn};
pub use options::{CallOptions, ReplyMode, RpcOptions};
pub use protocol::{CallEnvelope, RemoteError, ResponseEnvelope};

pub use ciborium::Value;
