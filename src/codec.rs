//! Shared wire contract for request and response bodies.
//!
//! Message bodies carry the JSON-encoded payload and nothing else. Correlation
//! ids, reply addresses and delivery flags travel as transport metadata on the
//! [`Envelope`](crate::Envelope).

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{Result, RpcError};

/// Content type attached to every envelope published by this crate.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Serialize a payload into a UTF-8 JSON message body.
pub fn encode<T>(payload: &T) -> Result<Bytes>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(payload)
        .map(Bytes::from)
        .map_err(RpcError::Encode)
}

/// Deserialize a message body into a typed payload.
pub fn decode<T>(body: &[u8]) -> Result<T>
where
    T: DeserializeOwned,
{
    serde_json::from_slice(body).map_err(RpcError::Decode)
}

/// Parse a message body into an untyped JSON value.
pub(crate) fn decode_value(body: &[u8]) -> Result<Value> {
    decode(body)
}

/// Convert an already-parsed JSON value into a typed payload.
pub(crate) fn from_value<T>(value: Value) -> Result<T>
where
    T: DeserializeOwned,
{
    serde_json::from_value(value).map_err(RpcError::Decode)
}
