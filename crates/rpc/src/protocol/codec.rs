//! CBOR helpers shared by the envelopes and the typed call API.

use crate::error::{CodecError, Result};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Serializes `payload` into the CBOR body of a pub/sub message.
///
/// # Errors
///
/// Fails with [`CodecError::SerializationFailed`].
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes> {
    let mut body = Vec::with_capacity(64);
    ciborium::ser::into_writer(payload, &mut body)
        .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
    Ok(body.into())
}

/// Parses a CBOR message body.
///
/// # Errors
///
/// Fails with [`CodecError::DeserializationFailed`] on truncated or
/// ill-typed input.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let decoded = ciborium::de::from_reader(body)
        .map_err(|e| CodecError::DeserializationFailed(e.to_string()))?;
    Ok(decoded)
}

/// Convert a serializable value into a dynamic CBOR value.
///
/// # Errors
///
/// Returns an error if the value cannot be represented in CBOR.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<ciborium::Value> {
    ciborium::Value::serialized(value)
        .map_err(|e| CodecError::SerializationFailed(e.to_string()))
        .map_err(Into::into)
}

/// Convert a dynamic CBOR value into a typed value.
///
/// # Errors
///
/// Returns an error if the value does not have the expected shape.
pub fn from_value<T: DeserializeOwned>(value: &ciborium::Value) -> Result<T> {
    value
        .deserialized()
        .map_err(|e| CodecError::DeserializationFailed(e.to_string()))
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::Error;

    use assert_matches::assert_matches;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        n: u32,
        name: String,
    }

    #[test]
    fn test_value_conversion() {
        let sample = Sample {
            n: 42,
            name: "x".to_string(),
        };

        let value = to_value(&sample).unwrap();
        assert!(matches!(value, ciborium::Value::Map(_)));
        assert_eq!(from_value::<Sample>(&value).unwrap(), sample);
    }

    #[test]
    fn test_decode_error() {
        let bad_data = vec![0xFF, 0xFF, 0xFF];
        let result: Result<Sample> = decode(&bad_data);
        assert_matches!(result, Err(Error::Codec(CodecError::DeserializationFailed(_))));
    }

    #[test]
    fn test_shape_mismatch() {
        let value = ciborium::Value::Text("not a map".to_string());
        assert_matches!(
            from_value::<Sample>(&value),
            Err(Error::Codec(CodecError::DeserializationFailed(_)))
        );
    }
}
