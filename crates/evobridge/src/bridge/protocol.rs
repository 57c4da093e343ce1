//! Wire protocol types for client-worker communication.
//!
//! One channel pair (stdin/stdout), three record shapes:
//! - **Request** (client to worker): method call with a correlation id
//! - **Response** (worker to client): result XOR error, echoing the id
//! - **Event** (worker to client): unsolicited notification, no id
//!
//! Records are discriminated by shape, not by an envelope tag: events carry
//! `"kind":"event"`, responses carry an id plus exactly one of
//! `result`/`error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// Protocol version carried by every request and response.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Standard error codes the worker may return.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Correlation id for a request.
///
/// The wire format admits both strings and integers; generated ids are
/// UUID v4 strings. Collision rejection is the tracker's job, not the
/// generator's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Int(i64),
    Str(String),
}

impl RequestId {
    pub fn generate() -> Self {
        Self::Str(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

/// Outbound method call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: RequestId,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Parse a request record, as the worker side does.
    ///
    /// Version mismatches are rejected here so handlers only ever see
    /// conforming requests.
    pub fn from_record_value(value: Value) -> Result<Self, DecodeError> {
        let request: Request = serde_json::from_value(value)?;
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(DecodeError::Version(request.protocol_version));
        }
        Ok(request)
    }
}

/// Error object carried by a failure response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Unsolicited notification from the worker.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub name: String,
    pub data: Value,
}

/// A decoded inbound record.
#[derive(Debug, Clone)]
pub enum Incoming {
    Response {
        id: RequestId,
        outcome: Result<Value, RemoteErrorBody>,
    },
    Event(EventRecord),
}

/// Decode one framed record into a response or event.
///
/// Never panics; every malformed shape maps to a [`DecodeError`] the read
/// loop logs and discards, leaving the stream aligned.
pub fn decode_record(record: &[u8]) -> Result<Incoming, DecodeError> {
    let value: Value = serde_json::from_slice(record)?;
    let Value::Object(map) = value else {
        return Err(DecodeError::NotAnObject);
    };

    if map.get("kind").and_then(Value::as_str) == Some("event") {
        let name = map
            .get("name")
            .and_then(Value::as_str)
            .ok_or(DecodeError::EventName)?
            .to_string();
        let data = map.get("data").cloned().unwrap_or(Value::Null);
        return Ok(Incoming::Event(EventRecord { name, data }));
    }

    let Some(raw_id) = map.get("id") else {
        return Err(DecodeError::UnknownShape);
    };
    let id: RequestId =
        serde_json::from_value(raw_id.clone()).map_err(|_| DecodeError::BadId)?;

    match map.get("protocolVersion").and_then(Value::as_str) {
        Some(PROTOCOL_VERSION) => {}
        Some(other) => return Err(DecodeError::Version(other.to_string())),
        None => return Err(DecodeError::Version("<missing>".to_string())),
    }

    // `result: null` is a legitimate success payload, so presence of the
    // key decides the shape, not the value.
    match (map.contains_key("result"), map.contains_key("error")) {
        (true, true) => Err(DecodeError::AmbiguousResponse { id }),
        (false, false) => Err(DecodeError::EmptyResponse { id }),
        (true, false) => Ok(Incoming::Response {
            outcome: Ok(map.get("result").cloned().unwrap_or(Value::Null)),
            id,
        }),
        (false, true) => {
            let body: RemoteErrorBody =
                serde_json::from_value(map.get("error").cloned().unwrap_or(Value::Null))
                    .map_err(|e| DecodeError::ErrorBody(e.to_string()))?;
            Ok(Incoming::Response {
                outcome: Err(body),
                id,
            })
        }
    }
}
