//! Worker line protocol.
//!
//! One JSON object per line in each direction:
//!
//! ```text
//! bridge ──► {"type":"worker-request","request":{"id":7,"method":"status","params":{"cwd":"/repo"}}}
//!            {"type":"worker-request-cancel","request":{"id":7}}
//! worker ──► {"type":"worker-response","response":{"id":7,"result":{...}}}
//!            {"type":"worker-response","response":{"id":7,"error":{"code":"git","message":"..."}}}
//!            {"type":"<anything else>", ...}            (event, not correlated)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Request from a connection.
pub const REQUEST: &str = "worker-request";
/// Cancellation of an earlier request.
pub const CANCEL: &str = "worker-request-cancel";
/// Correlated reply.
pub const RESPONSE: &str = "worker-response";

/// Error code for requests that cannot reach a worker.
pub const UNAVAILABLE_CODE: &str = "worker-unavailable";

/// `request` object as seen by a worker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerRequest {
    /// Correlation id, opaque to the worker.
    pub id: Value,
    /// Operation name.
    pub method: String,
    /// Operation arguments.
    #[serde(default)]
    pub params: Value,
}

/// `response` object produced by a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerResponse {
    /// Id of the request this answers.
    pub id: Value,
    /// Success payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl WorkerResponse {
    /// Successful response.
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response with a `{code, message}` error.
    pub fn err(id: Value, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(json!({ "code": code, "message": message.into() })),
        }
    }

    /// Wrap in a `worker-response` message.
    pub fn into_message(self) -> Value {
        json!({ "type": RESPONSE, "response": self })
    }
}

/// Message type, if the payload has one.
pub fn message_type(payload: &Value) -> Option<&str> {
    payload.get("type").and_then(Value::as_str)
}

/// Correlation id of a request or cancel payload.
///
/// Accepts `request.id` and, for cancels, a bare top-level `id`.
pub fn request_id(payload: &Value) -> Option<&Value> {
    payload
        .get("request")
        .and_then(|r| r.get("id"))
        .or_else(|| payload.get("id"))
        .filter(|id| !id.is_null())
}

/// Serialize as one protocol line.
pub fn to_line(message: &Value) -> Vec<u8> {
    let mut line = message.to_string().into_bytes();
    line.push(b'\n');
    line
}
