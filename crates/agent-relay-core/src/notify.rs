//! Typed session-update notifications.

use serde::{Deserialize, Serialize};

use crate::agent::StopReason;

/// Status of a tool call as shown to the driving client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Call announced but not yet running.
    Pending,
    /// Call is running.
    InProgress,
    /// Call finished successfully.
    Completed,
    /// Call failed or timed out.
    Failed,
}

/// One update emitted to a session's current owner during a prompt turn.
///
/// Delivered in production order per session; no ordering is guaranteed
/// across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionNotification {
    /// A chunk of agent prose.
    AgentMessageChunk { text: String },
    /// A tool call has started.
    ToolCall {
        tool_call_id: u64,
        title: String,
        status: ToolCallStatus,
    },
    /// A tool call changed status.
    ToolCallUpdate {
        tool_call_id: u64,
        status: ToolCallStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Output printed by sandboxed code.
    ExecutionOutput { text: String },
    /// The turn finished.
    TurnEnded { stop_reason: StopReason },
}
