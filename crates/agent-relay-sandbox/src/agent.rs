//! Scripted agent: runs prompt code blocks through the sandbox.
//!
//! Stands in for the model collaborator in tests and the demo server.
//! Text blocks are echoed as agent prose; code blocks are executed and
//! their outcome narrated back.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;

use agent_relay_core::{
    Agent, AgentError, ContentBlock, SessionNotification, StopReason, TurnContext, TurnResult,
};

use crate::engine::SandboxExecutor;

/// Agent that treats prompt code blocks as sandbox scripts.
pub struct ScriptAgent {
    executor: Arc<SandboxExecutor>,
}

impl ScriptAgent {
    /// Create an agent around a sandbox executor.
    #[must_use]
    pub fn new(executor: Arc<SandboxExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Agent for ScriptAgent {
    async fn run_turn(&self, ctx: TurnContext) -> Result<TurnResult, AgentError> {
        let host = self.executor.host();

        for block in &ctx.content {
            // Cooperative cancellation between blocks.
            if ctx.cancel.load(Ordering::SeqCst) {
                return Ok(TurnResult {
                    stop_reason: StopReason::Cancelled,
                });
            }

            match block {
                ContentBlock::Text { text } => {
                    host.notify(
                        ctx.session_id,
                        SessionNotification::AgentMessageChunk { text: text.clone() },
                    );
                }
                ContentBlock::Code { code } => {
                    let outcome = self
                        .executor
                        .execute_code(ctx.session_id, Arc::clone(&ctx.cancel), code)
                        .await;

                    if let Some(error) = &outcome.error {
                        if *error == agent_relay_core::SandboxError::Cancelled {
                            return Ok(TurnResult {
                                stop_reason: StopReason::Cancelled,
                            });
                        }
                        host.notify(
                            ctx.session_id,
                            SessionNotification::AgentMessageChunk {
                                text: format!("execution failed: {error}"),
                            },
                        );
                    }
                }
            }
        }

        Ok(TurnResult {
            stop_reason: StopReason::EndTurn,
        })
    }
}
