//! Core abstractions for the agent-relay server.
//!
//! This crate provides the fundamental building blocks:
//! - Session and client identifiers, resume tokens
//! - `SessionNotification` - typed session-update messages
//! - `ClientCapability` / `SessionHost` - the seams between layers
//! - Typed tool contracts and their never-failing parsers
//! - The four-family error taxonomy

pub mod agent;
pub mod capability;
pub mod error;
pub mod ids;
pub mod notify;
pub mod tools;

pub use agent::{Agent, AgentError, ContentBlock, StopReason, TurnContext, TurnResult};
pub use capability::{CapabilityError, ChannelCapability, ClientCapability, SessionHost};
pub use error::{ProtocolError, SandboxError, SessionError, ToolError};
pub use ids::{ClientId, ClientIdGen, ResumeToken, SessionId};
pub use notify::{SessionNotification, ToolCallStatus};
pub use tools::{
    CommitEntry, Diagnostic, Severity, StubToolSuite, SymbolHit, TestFailure, TestRunSummary,
    ToolOutcome, ToolSuite,
};
