//! Upstream envelopes.
//!
//! Everything crossing the UI boundary is a JSON object with a top-level
//! `type`:
//!
//! ```text
//! inbound   view-message    {"type":"view-message","message":{"type":<kind>,"requestId"?:..,...}}
//!           worker-message  {"type":"worker-message","workerId":"git","payload":{...}}
//! outbound  main-message    {"type":"main-message","message":{...}}
//!           worker-event    {"type":"worker-event","workerId":"git","payload":{...}}
//!           bridge-ready    {"type":"bridge-ready","connectionId":3,"version":"0.3.0"}
//!           bridge-error    {"type":"bridge-error","error":{"kind":..,"message":..}}
//! ```
//!
//! Replies to view messages are `main-message`s whose message has type
//! `response`, echoing `requestId` and the request's kind.

use serde_json::{json, Value};

use crate::connection::ConnectionId;
use crate::error::BridgeError;

/// Top-level envelope discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeType {
    /// Message from the view.
    ViewMessage,
    /// Message for a worker.
    WorkerMessage,
    /// Message to the view.
    MainMessage,
    /// Event from a worker.
    WorkerEvent,
    /// Registration acknowledgement.
    BridgeReady,
    /// Envelope-level failure.
    BridgeError,
}

impl EnvelopeType {
    /// Every envelope type.
    pub const ALL: [Self; 6] = [
        Self::ViewMessage,
        Self::WorkerMessage,
        Self::MainMessage,
        Self::WorkerEvent,
        Self::BridgeReady,
        Self::BridgeError,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ViewMessage => "view-message",
            Self::WorkerMessage => "worker-message",
            Self::MainMessage => "main-message",
            Self::WorkerEvent => "worker-event",
            Self::BridgeReady => "bridge-ready",
            Self::BridgeError => "bridge-error",
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Whether a UI connection may send this type.
    pub fn is_inbound(self) -> bool {
        matches!(self, Self::ViewMessage | Self::WorkerMessage)
    }
}

/// `main-message` carrying `message`.
pub fn main_message(message: Value) -> Value {
    json!({ "type": EnvelopeType::MainMessage.as_str(), "message": message })
}

/// `main-message` push of kind `kind` with `fields` merged in.
pub fn push(kind: &str, fields: Value) -> Value {
    let mut message = json!({ "type": kind });
    if let (Some(target), Value::Object(fields)) = (message.as_object_mut(), fields) {
        target.extend(fields);
    }
    main_message(message)
}

/// Reply to a view message.
pub fn response(request_type: &str, request_id: Value, outcome: Result<Value, &BridgeError>) -> Value {
    let message = match outcome {
        Ok(result) => json!({
            "type": "response",
            "requestType": request_type,
            "requestId": request_id,
            "ok": true,
            "result": result,
        }),
        Err(err) => json!({
            "type": "response",
            "requestType": request_type,
            "requestId": request_id,
            "ok": false,
            "error": err.to_value(),
        }),
    };
    main_message(message)
}

/// `worker-event` for `worker_id`.
pub fn worker_event(worker_id: &str, payload: Value) -> Value {
    json!({
        "type": EnvelopeType::WorkerEvent.as_str(),
        "workerId": worker_id,
        "payload": payload,
    })
}

/// `bridge-ready` sent on registration.
pub fn bridge_ready(connection: ConnectionId, version: &str) -> Value {
    json!({
        "type": EnvelopeType::BridgeReady.as_str(),
        "connectionId": connection,
        "version": version,
    })
}

/// `bridge-error` for failures not tied to a request.
pub fn bridge_error(err: &BridgeError) -> Value {
    json!({
        "type": EnvelopeType::BridgeError.as_str(),
        "error": err.to_value(),
    })
}

/// Optional non-null field.
pub fn field<'a>(message: &'a Value, key: &str) -> Option<&'a Value> {
    message.get(key).filter(|v| !v.is_null())
}

/// Required string field.
pub fn str_field<'a>(message: &'a Value, key: &str) -> Result<&'a str, BridgeError> {
    message
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::invalid(format!("'{key}' must be a string")))
}

/// Optional u16 field (terminal dimensions).
pub fn u16_field(message: &Value, key: &str) -> Result<Option<u16>, BridgeError> {
    match field(message, key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| BridgeError::invalid(format!("'{key}' must be a small positive integer"))),
    }
}
