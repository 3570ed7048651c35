//! Classification and encoding of assistant protocol messages.
//!
//! Inbound objects fall into four shapes:
//!
//! | shape        | `method` | `id`            |
//! |--------------|----------|-----------------|
//! | response     | absent   | number          |
//! | notification | present  | absent          |
//! | peer request | present  | any             |
//! | invalid      | anything else              |
//!
//! A numeric id with neither `result` nor `error` is a malformed response;
//! its caller is failed with a protocol error rather than left waiting.
//!
//! A response is only delivered if its id still has a pending entry; the
//! client drops the rest (late answers to timed-out requests).

use serde_json::{json, Value};

/// One classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Answer to one of our requests.
    Response {
        /// Correlation id.
        id: u64,
        /// `result` on success, the `error` object otherwise.
        outcome: Result<Value, Value>,
    },
    /// Peer notification; expects no answer.
    Notification {
        /// Notification method.
        method: String,
        /// Params, `Null` when absent.
        params: Value,
    },
    /// Peer request; answer with the same `id`.
    Request {
        /// Peer-chosen id, echoed back verbatim.
        id: Value,
        /// Requested method.
        method: String,
        /// Params, `Null` when absent.
        params: Value,
    },
    /// Carries a numeric id but neither `result` nor `error`.
    MalformedResponse {
        /// Correlation id.
        id: u64,
        /// What was wrong.
        reason: String,
    },
    /// Matches no known shape.
    Invalid(String),
}

/// Classify one decoded line.
pub fn classify(message: Value) -> Incoming {
    let Value::Object(mut map) = message else {
        return Incoming::Invalid("not a JSON object".to_string());
    };

    let id = map.remove("id");
    let params = map.remove("params").unwrap_or(Value::Null);

    if let Some(method) = map.get("method").and_then(Value::as_str) {
        let method = method.to_string();
        return match id {
            None | Some(Value::Null) => Incoming::Notification { method, params },
            Some(id) => Incoming::Request { id, method, params },
        };
    }

    let Some(id) = id.as_ref().and_then(Value::as_u64) else {
        return Incoming::Invalid("no method and no numeric id".to_string());
    };
    let outcome = match (map.remove("error"), map.remove("result")) {
        (Some(error), _) if !error.is_null() => Err(error),
        (_, Some(result)) => Ok(result),
        _ => {
            return Incoming::MalformedResponse {
                id,
                reason: format!("response {id} has neither result nor error"),
            }
        }
    };
    Incoming::Response { id, outcome }
}

/// Encode a request line.
pub fn request_line(id: u64, method: &str, params: Option<Value>) -> Vec<u8> {
    let mut message = json!({ "id": id, "method": method });
    if let Some(params) = params {
        message["params"] = params;
    }
    line(&message)
}

/// Encode a notification line.
pub fn notification_line(method: &str, params: Option<Value>) -> Vec<u8> {
    let mut message = json!({ "method": method });
    if let Some(params) = params {
        message["params"] = params;
    }
    line(&message)
}

/// Encode a response line for a peer request.
pub fn response_line(id: &Value, outcome: Result<Value, Value>) -> Vec<u8> {
    let message = match outcome {
        Ok(result) => json!({ "id": id, "result": result }),
        Err(error) => json!({ "id": id, "error": error }),
    };
    line(&message)
}

fn line(message: &Value) -> Vec<u8> {
    let mut bytes = message.to_string().into_bytes();
    bytes.push(b'\n');
    bytes
}
