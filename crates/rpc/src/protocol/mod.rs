//! Wire format of requests and responses.
//!
//! Both messages are CBOR maps. A request is `{ id: bytes, params: any }`;
//! a response is either `{ result: any }` or
//! `{ error: { message: text, data?: any } }`.

pub mod codec;
mod envelope;

pub use envelope::{CallEnvelope, RemoteError, ResponseEnvelope};
