use super::codec;
use crate::correlation::CorrelationId;
use crate::error::{ProtocolError, Result};

use bytes::Bytes;
use ciborium::Value;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

fn empty_map() -> Value {
    Value::Map(Vec::new())
}

// A present key always yields `Some`, even when its value is CBOR null.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// A request: correlation id plus call parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Raw correlation id bytes.
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    /// Call parameters; an empty map when the sender omitted them.
    #[serde(default = "empty_map")]
    pub params: Value,
}

impl CallEnvelope {
    /// Creates a request for `id` carrying `params`.
    #[must_use]
    pub fn new(id: &CorrelationId, params: Value) -> Self {
        Self {
            id: id.as_bytes().to_vec(),
            params,
        }
    }

    /// The correlation id of the request.
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId::from_bytes(self.id.clone())
    }

    /// Encodes the request as CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters cannot be serialized.
    pub fn encode(&self) -> Result<Bytes> {
        codec::encode(self)
    }

    /// Decodes a request, rejecting an empty correlation id.
    ///
    /// # Errors
    ///
    /// Returns a codec error for malformed CBOR or a protocol error for an empty id.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let envelope: Self = codec::decode(data)?;
        if envelope.id.is_empty() {
            return Err(ProtocolError::EmptyCorrelationId.into());
        }
        Ok(envelope)
    }
}

/// Failure reported by a remote handler.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    /// Human readable description.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteError {
    /// Creates an error without details.
    pub fn new<K: Into<String>>(message: K) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }
}

/// A response: exactly one of a result or an error.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseEnvelope {
    /// The handler succeeded.
    Result(Value),
    /// The handler failed.
    Error(RemoteError),
}

#[derive(Serialize)]
struct WireResponseRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RemoteError>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RemoteError>,
}

impl ResponseEnvelope {
    /// A successful response; a null result is sent as an empty map.
    #[must_use]
    pub fn success(result: Value) -> Self {
        if matches!(result, Value::Null) {
            Self::Result(empty_map())
        } else {
            Self::Result(result)
        }
    }

    /// Encodes the response as CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if the result cannot be serialized.
    pub fn encode(&self) -> Result<Bytes> {
        let wire = match self {
            Self::Result(result) => WireResponseRef {
                result: Some(result),
                error: None,
            },
            Self::Error(error) => WireResponseRef {
                result: None,
                error: Some(error),
            },
        };
        codec::encode(&wire)
    }

    /// Decodes a response, requiring exactly one of `result` and `error`.
    ///
    /// # Errors
    ///
    /// Returns a codec error for malformed CBOR or a protocol error when the
    /// branches are missing or both present.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let wire: WireResponse = codec::decode(data)?;
        match (wire.result, wire.error) {
            (Some(result), None) => Ok(Self::Result(result)),
            (None, Some(error)) => Ok(Self::Error(error)),
            (Some(_), Some(_)) => Err(ProtocolError::AmbiguousResponse.into()),
            (None, None) => Err(ProtocolError::EmptyResponse.into()),
        }
    }

    /// Converts into the handler's outcome.
    ///
    /// # Errors
    ///
    /// Returns the remote error carried by an error response.
    pub fn into_result(self) -> std::result::Result<Value, RemoteError> {
        match self {
            Self::Result(result) => Ok(result),
            Self::Error(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::{CodecError, Error};

    use assert_matches::assert_matches;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Text(k.to_string()), v))
                .collect(),
        )
    }

    fn entries(data: &[u8]) -> Vec<(Value, Value)> {
        let value: Value = codec::decode(data).unwrap();
        match value {
            Value::Map(entries) => entries,
            other => panic!("expected a map, got {other:?}"),
        }
    }

    fn keys(data: &[u8]) -> Vec<String> {
        entries(data)
            .into_iter()
            .filter_map(|(k, _)| match k {
                Value::Text(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_call_wire_layout() {
        let id = CorrelationId::from_bytes(vec![1, 2, 3]);
        let envelope = CallEnvelope::new(&id, map(vec![("n", Value::from(42))]));

        let encoded = envelope.encode().unwrap();
        assert_eq!(keys(&encoded), vec!["id", "params"]);

        assert_eq!(entries(&encoded)[0].1, Value::Bytes(vec![1, 2, 3]));

        assert_eq!(CallEnvelope::decode(&encoded).unwrap(), envelope);
    }

    #[test]
    fn test_call_without_params_gets_empty_map() {
        let encoded = codec::encode(&map(vec![("id", Value::Bytes(vec![7]))])).unwrap();

        let envelope = CallEnvelope::decode(&encoded).unwrap();
        assert_eq!(envelope.params, Value::Map(Vec::new()));
        assert_eq!(envelope.correlation_id().as_bytes(), &[7]);
    }

    #[test]
    fn test_call_rejects_bad_ids() {
        let empty = codec::encode(&map(vec![("id", Value::Bytes(Vec::new()))])).unwrap();
        assert_matches!(
            CallEnvelope::decode(&empty),
            Err(Error::Protocol(ProtocolError::EmptyCorrelationId))
        );

        let missing = codec::encode(&map(vec![("params", Value::Null)])).unwrap();
        assert_matches!(
            CallEnvelope::decode(&missing),
            Err(Error::Codec(CodecError::DeserializationFailed(_)))
        );
    }

    #[test]
    fn test_response_has_one_branch() {
        let ok = ResponseEnvelope::success(Value::from(1)).encode().unwrap();
        assert_eq!(keys(&ok), vec!["result"]);

        let failed = ResponseEnvelope::Error(RemoteError::new("boom")).encode().unwrap();
        assert_eq!(keys(&failed), vec!["error"]);
        assert_eq!(
            ResponseEnvelope::decode(&failed).unwrap(),
            ResponseEnvelope::Error(RemoteError::new("boom"))
        );
    }

    #[test]
    fn test_response_rejects_both_or_neither() {
        let both = codec::encode(&map(vec![
            ("result", Value::from(1)),
            ("error", map(vec![("message", Value::Text("x".to_string()))])),
        ]))
        .unwrap();
        assert_matches!(
            ResponseEnvelope::decode(&both),
            Err(Error::Protocol(ProtocolError::AmbiguousResponse))
        );

        let neither = codec::encode(&map(vec![])).unwrap();
        assert_matches!(
            ResponseEnvelope::decode(&neither),
            Err(Error::Protocol(ProtocolError::EmptyResponse))
        );
    }

    #[test]
    fn test_null_result_is_still_a_result() {
        let encoded = codec::encode(&map(vec![("result", Value::Null)])).unwrap();
        assert_eq!(
            ResponseEnvelope::decode(&encoded).unwrap(),
            ResponseEnvelope::Result(Value::Null)
        );

        assert_eq!(
            ResponseEnvelope::success(Value::Null),
            ResponseEnvelope::Result(Value::Map(Vec::new()))
        );
    }

    #[test]
    fn test_error_data_round_trips() {
        let error = RemoteError {
            message: "bad input".to_string(),
            data: Some(map(vec![("field", Value::Text("n".to_string()))])),
        };

        let encoded = ResponseEnvelope::Error(error.clone()).encode().unwrap();
        assert_eq!(
            ResponseEnvelope::decode(&encoded).unwrap().into_result(),
            Err(error)
        );
    }
}
