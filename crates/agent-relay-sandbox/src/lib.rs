//! Sandboxed execution of model-authored code.
//!
//! Scripts run in a restricted Rhai engine that sees only the injected
//! host functions. Host calls that need the protocol layer cross a
//! synchronous-to-asynchronous bridge with per-call deadlines; the whole
//! block is bounded by a wall-clock budget and a cooperative cancel flag.

pub mod agent;
pub mod bridge;
pub mod engine;
pub mod functions;

pub use agent::ScriptAgent;
pub use bridge::{CallBridge, HostCall, spawn_host_service};
pub use engine::{ExecutionOutcome, SandboxConfig, SandboxExecutor};
pub use functions::ExternalFunctions;
