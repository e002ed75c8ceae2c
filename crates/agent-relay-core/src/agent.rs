//! The external model collaborator behind `prompt`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::SessionId;

/// One block of prompt content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Prose from the user.
    Text { text: String },
    /// Code the agent should run in the sandbox.
    Code { code: String },
}

/// Why a turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    Cancelled,
    Error,
}

/// Everything an agent needs to drive one turn.
#[derive(Clone)]
pub struct TurnContext {
    /// Session the turn belongs to.
    pub session_id: SessionId,
    /// Session working directory.
    pub cwd: PathBuf,
    /// Prompt content.
    pub content: Vec<ContentBlock>,
    /// Cooperative cancel flag; checked between host-function calls.
    pub cancel: Arc<AtomicBool>,
}

/// Terminal result of a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub stop_reason: StopReason,
}

/// Agent failure. Turn-local; the session survives.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent backend unavailable: {0}")]
    Unavailable(String),
    #[error("Turn failed: {0}")]
    TurnFailed(String),
}

/// The coding assistant driving a session.
///
/// The real model lives behind this seam; the relay ships a scripted
/// implementation for tests and demos.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run one prompt turn, emitting session updates along the way.
    async fn run_turn(&self, ctx: TurnContext) -> Result<TurnResult, AgentError>;
}
