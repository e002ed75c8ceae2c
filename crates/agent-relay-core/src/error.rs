//! Error taxonomy shared across the relay.
//!
//! Four families with distinct propagation rules: protocol and session
//! errors terminate only the offending request; sandbox and tool errors are
//! local to one `execute_code` turn and are returned to the model as data.

use serde::Serialize;
use thiserror::Error;

use crate::ids::{ClientId, SessionId};

/// Malformed or unroutable wire traffic. The connection stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
    #[error("Invalid params for {method}: {reason}")]
    InvalidParams { method: String, reason: String },
}

/// Session lifecycle failures, each a distinct sub-kind on the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Invalid resume token for session {0}")]
    InvalidToken(SessionId),
    #[error("Session {0} owner is not disconnected")]
    NotDisconnected(SessionId),
    #[error("Session {0} is owned by another connection")]
    NotOwner(SessionId),
    #[error("Session {0} already has a turn in flight")]
    TurnInFlight(SessionId),
    #[error("Grace period expired for session {0}")]
    GracePeriodExpired(SessionId),
    #[error("Client not registered: {0}")]
    ClientGone(ClientId),
    #[error("Session {0} has no live owner")]
    Orphaned(SessionId),
}

/// Failures inside one sandbox execution. Serializable so the model sees
/// them as structured data; the session is never terminated by these.
#[derive(Debug, Clone, Error, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxError {
    #[error("Sandbox violation: {message}")]
    Violation { message: String },
    #[error("Execution exceeded its budget after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("Script error: {message}")]
    Script { message: String },
    #[error("Host call '{function}' timed out")]
    CallTimeout { function: String },
    #[error("Host call '{function}' failed: {message}")]
    HostCall { function: String, message: String },
    #[error("Execution cancelled")]
    Cancelled,
}

/// An external tool failed to run or produce parseable output.
///
/// Mostly carried inside `ToolOutcome` rather than raised; this type exists
/// for the rare paths that need a real error value.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool unavailable: {0}")]
    Unavailable(String),
    #[error("Tool output could not be parsed: {0}")]
    ParseFailed(String),
}
