//! Request/response envelope codec.
//!
//! Envelopes are self-describing JSON documents. Requests discriminate on
//! the `op` field, responses on `succeeded`. The codec is schema-stable:
//! unknown top-level fields are tolerated (so adding envelope fields stays
//! additive), while argument payloads stay strict. Decoding distinguishes
//! an unknown operation from a malformed document so the daemon can answer
//! each with the right error code.

use serde::{Deserialize, Serialize};

use super::types::{Operation, OperationResult};
use crate::elevation::ElevationRequest;

/// Machine-readable error classification carried in failure responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ConnectionClosed,
    MalformedMessage,
    UnknownOperation,
    ElevationRequired,
    ResourceConflict,
    OsOperationFailed,
    Timeout,
}

/// Errors from the envelope codec itself.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),
}

impl EnvelopeError {
    /// The wire error code a daemon reports for this decode failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            EnvelopeError::Malformed(_) => ErrorCode::MalformedMessage,
            EnvelopeError::UnknownOperation(_) => ErrorCode::UnknownOperation,
        }
    }
}

fn default_version() -> u32 {
    super::PROTOCOL_VERSION
}

/// A client request: correlation id, protocol version, and one operation.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(flatten)]
    pub operation: Operation,
}

impl Request {
    pub fn new(id: u64, operation: Operation) -> Self {
        Self {
            id,
            version: super::PROTOCOL_VERSION,
            operation,
        }
    }
}

/// A daemon response. Exactly one of `result` / `error_code` is populated
/// depending on `succeeded`; `elevation` rides along only with
/// [`ErrorCode::ElevationRequired`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,

    #[serde(default = "default_version")]
    pub version: u32,

    pub succeeded: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<ElevationRequest>,
}

impl Response {
    pub fn ok(id: u64, result: OperationResult) -> Self {
        Self {
            id,
            version: super::PROTOCOL_VERSION,
            succeeded: true,
            result: Some(result),
            error_code: None,
            error_message: None,
            elevation: None,
        }
    }

    pub fn failure(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            version: super::PROTOCOL_VERSION,
            succeeded: false,
            result: None,
            error_code: Some(code),
            error_message: Some(message.into()),
            elevation: None,
        }
    }

    pub fn elevation_required(
        id: u64,
        request: Option<ElevationRequest>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            version: super::PROTOCOL_VERSION,
            succeeded: false,
            result: None,
            error_code: Some(ErrorCode::ElevationRequired),
            error_message: Some(message.into()),
            elevation: request,
        }
    }
}

/// Encode a request for the wire.
pub fn encode_request(req: &Request) -> Vec<u8> {
    // Serialization of these closed types cannot fail.
    serde_json::to_vec(req).unwrap_or_default()
}

/// Encode a response for the wire.
pub fn encode_response(resp: &Response) -> Vec<u8> {
    serde_json::to_vec(resp).unwrap_or_default()
}

/// Decode a request, distinguishing an unrecognized `op` from a document
/// that is not a valid envelope at all.
pub fn decode_request(bytes: &[u8]) -> Result<Request, EnvelopeError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

    let op = value
        .get("op")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EnvelopeError::Malformed("missing operation discriminator".to_string()))?;

    if !Operation::NAMES.contains(&op) {
        return Err(EnvelopeError::UnknownOperation(op.to_string()));
    }

    serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

/// Decode a response.
pub fn decode_response(bytes: &[u8]) -> Result<Response, EnvelopeError> {
    serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

/// Best-effort extraction of the correlation id from possibly-broken bytes,
/// so failure responses can still be matched to their request.
pub fn peek_id(bytes: &[u8]) -> u64 {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("id").and_then(|id| id.as_u64()))
        .unwrap_or(0)
}
