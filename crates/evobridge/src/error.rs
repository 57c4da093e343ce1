//! Error taxonomy for the bridge.
//!
//! Two layers: [`DecodeError`] covers a single malformed record and never
//! reaches request callers (the read loop logs and drops it);
//! [`BridgeError`] is what a pending request settles with. Startup has its
//! own enum because `start()` can fail before any request exists.

use std::time::Duration;

use serde_json::Value;

use crate::bridge::protocol::RequestId;
use crate::client::BridgeState;
use crate::supervisor::SpawnError;

/// Failure of one pending request.
///
/// Cloneable because a crash settles every outstanding request with the
/// same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// The worker answered with an error object.
    #[error("worker error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// No response arrived within the configured window.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the request, or the bridge was stopped while
    /// it was pending.
    #[error("request cancelled")]
    Cancelled,

    /// The worker exited while the request was pending.
    #[error("worker crashed: {detail}")]
    ProcessCrash { detail: String },

    /// The bridge is not in a state that accepts requests.
    #[error("bridge is not running (state: {0})")]
    NotRunning(BridgeState),

    /// An identical id is already outstanding.
    #[error("request id {0} is already in flight")]
    DuplicateId(RequestId),

    /// Writing the request to the worker's stdin failed.
    #[error("failed to write request: {0}")]
    Write(String),

    /// The completion channel vanished without settling. Indicates a bug
    /// in the tracker rather than a protocol condition.
    #[error("request abandoned before completion")]
    Abandoned,

    /// The worker's reply did not match the shape the typed API expects.
    #[error("malformed worker payload: {0}")]
    Payload(String),
}

/// Failure to decode one inbound record.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("unsupported protocol version: {0}")]
    Version(String),

    #[error("event record is missing a name")]
    EventName,

    #[error("id is neither a string nor an integer")]
    BadId,

    #[error("response {id} has neither result nor error")]
    EmptyResponse { id: RequestId },

    #[error("response {id} has both result and error")]
    AmbiguousResponse { id: RequestId },

    #[error("malformed error object: {0}")]
    ErrorBody(String),

    #[error("record is neither a response nor an event")]
    UnknownShape,
}

/// Failure of `start()`.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("cannot start from state {0}")]
    InvalidState(BridgeState),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("worker did not complete the handshake within {0:?}")]
    StartupTimeout(Duration),

    #[error("worker handshake failed: {0}")]
    Handshake(BridgeError),
}
