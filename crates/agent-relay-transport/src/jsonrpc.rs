//! JSON-RPC 2.0 framing shared by the stdio and WebSocket transports.
//!
//! Both transports carry identical message shapes, so everything above the
//! byte stream lives here and in [`crate::dispatch`].

use serde_json::{Value, json};

use agent_relay_core::{ProtocolError, SessionError, SessionId, SessionNotification};
use agent_relay_session::Outbound;

/// The frame could not be parsed as JSON-RPC.
pub const PARSE_ERROR: i64 = -32700;
/// Structurally valid request with unusable params.
pub const INVALID_PARAMS: i64 = -32602;
/// Unknown method or a handler failure.
pub const INTERNAL_ERROR: i64 = -32603;
/// Session lifecycle failure; the sub-kind rides in `error.data.kind`.
pub const SESSION_ERROR: i64 = -32001;

/// One structurally valid inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Client request expecting a response.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Client notification; never answered.
    Notification { method: String, params: Value },
    /// Client response to a server-initiated request.
    Response {
        id: Value,
        result: Result<Value, Value>,
    },
}

/// Classify one wire frame.
///
/// A frame with a `method` and a non-null `id` is a request; with a `method`
/// and no `id` a notification; with an `id` and no `method` a response.
pub fn parse_frame(raw: &str) -> Result<Frame, ProtocolError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("frame is not a JSON object".to_string()))?;

    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        return match obj.get("id") {
            Some(id) if !id.is_null() => Ok(Frame::Request {
                id: id.clone(),
                method: method.to_string(),
                params,
            }),
            _ => Ok(Frame::Notification {
                method: method.to_string(),
                params,
            }),
        };
    }

    if let Some(id) = obj.get("id") {
        let result = match obj.get("error") {
            Some(error) => Err(error.clone()),
            None => Ok(obj.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Ok(Frame::Response {
            id: id.clone(),
            result,
        });
    }

    Err(ProtocolError::Malformed(
        "frame has neither method nor id".to_string(),
    ))
}

/// Recover the request id from a frame that failed validation, so the error
/// response can still be correlated. Falls back to null.
#[must_use]
pub fn best_effort_id(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .unwrap_or(Value::Null)
}

/// Build a success response.
#[must_use]
pub fn ok_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response.
#[must_use]
pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// Build a session-error response carrying the sub-kind as data.
#[must_use]
pub fn session_error_response(id: Value, err: &SessionError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": SESSION_ERROR,
            "message": err.to_string(),
            "data": { "kind": session_error_kind(err) },
        },
    })
}

fn session_error_kind(err: &SessionError) -> &'static str {
    match err {
        SessionError::SessionNotFound(_) => "session_not_found",
        SessionError::InvalidToken(_) => "invalid_token",
        SessionError::NotDisconnected(_) => "not_disconnected",
        SessionError::NotOwner(_) => "not_owner",
        SessionError::TurnInFlight(_) => "turn_in_flight",
        SessionError::GracePeriodExpired(_) => "grace_period_expired",
        SessionError::ClientGone(_) => "client_gone",
        SessionError::Orphaned(_) => "orphaned",
    }
}

/// Build a server-initiated request frame.
#[must_use]
pub fn request_frame(id: &str, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// Wrap a session update as a `session_update` notification frame.
#[must_use]
pub fn session_update_frame(session_id: SessionId, update: &SessionNotification) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "session_update",
        "params": { "session_id": session_id, "update": update },
    })
}

/// Turn one queued outbound message into its wire frame.
#[must_use]
pub fn outbound_to_frame(msg: Outbound) -> Value {
    match msg {
        Outbound::Frame(frame) => frame,
        Outbound::SessionUpdate { session_id, update } => {
            session_update_frame(session_id, &update)
        }
    }
}
