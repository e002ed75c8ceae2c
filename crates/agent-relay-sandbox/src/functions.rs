//! The injected host-function bundle.
//!
//! One `ExternalFunctions` is built per sandbox invocation and moved into
//! the engine's registered closures; nothing here is shared across
//! executions except the read-only tool suite and the session host.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, sync_channel};
use std::time::Duration;

use rhai::{Dynamic, Engine, EvalAltResult};
use serde::Serialize;

use agent_relay_core::{
    SandboxError, SessionHost, SessionId, SessionNotification, ToolCallStatus, ToolOutcome,
    ToolSuite,
};

use crate::bridge::{CallBridge, HostCall};

/// Immutable bundle of host callables bound to one session and invocation.
pub struct ExternalFunctions {
    session_id: SessionId,
    bridge: CallBridge,
    tools: Arc<dyn ToolSuite>,
    host: Arc<dyn SessionHost>,
    cancel: Arc<AtomicBool>,
    call_timeout: Duration,
}

impl ExternalFunctions {
    /// Bundle up the callables for one invocation.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        bridge: CallBridge,
        tools: Arc<dyn ToolSuite>,
        host: Arc<dyn SessionHost>,
        cancel: Arc<AtomicBool>,
        call_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            bridge,
            tools,
            host,
            cancel,
            call_timeout,
        })
    }

    /// Register every host function into `engine`.
    ///
    /// This is the entire surface sandboxed code can reach; the engine
    /// itself forbids modules, `eval` and reflection escapes.
    pub fn register(self: &Arc<Self>, engine: &mut Engine) {
        let funcs = Arc::clone(self);
        engine.register_fn(
            "read_file",
            move |path: String| -> Result<String, Box<EvalAltResult>> {
                let value = funcs.bridged_call(
                    "read_file",
                    format!("Read {path}"),
                    HostCall::ReadFile { path },
                )?;
                Ok(value.as_str().unwrap_or_default().to_string())
            },
        );

        let funcs = Arc::clone(self);
        engine.register_fn(
            "write_file",
            move |path: String, content: String| -> Result<(), Box<EvalAltResult>> {
                funcs.bridged_call(
                    "write_file",
                    format!("Write {path}"),
                    HostCall::WriteFile { path, content },
                )?;
                Ok(())
            },
        );

        let funcs = Arc::clone(self);
        engine.register_fn(
            "run_command",
            move |command: String| -> Result<Dynamic, Box<EvalAltResult>> {
                let value = funcs.bridged_call(
                    "run_command",
                    format!("Run `{command}`"),
                    HostCall::RunCommand { command },
                )?;
                to_dynamic(&value)
            },
        );

        let funcs = Arc::clone(self);
        engine.register_fn(
            "check_types",
            move |path: String| -> Result<Dynamic, Box<EvalAltResult>> {
                funcs.tool_call("check_types", format!("Type-check {path}"), move |t| {
                    t.check_types(&path)
                })
            },
        );

        let funcs = Arc::clone(self);
        engine.register_fn(
            "lint",
            move |path: String| -> Result<Dynamic, Box<EvalAltResult>> {
                funcs.tool_call("lint", format!("Lint {path}"), move |t| t.lint(&path))
            },
        );

        let funcs = Arc::clone(self);
        engine.register_fn(
            "run_tests",
            move |filter: String| -> Result<Dynamic, Box<EvalAltResult>> {
                funcs.tool_call("run_tests", format!("Run tests `{filter}`"), move |t| {
                    t.run_tests(&filter)
                })
            },
        );

        let funcs = Arc::clone(self);
        engine.register_fn(
            "find_symbols",
            move |query: String| -> Result<Dynamic, Box<EvalAltResult>> {
                funcs.tool_call("find_symbols", format!("Find symbols `{query}`"), move |t| {
                    t.find_symbols(&query)
                })
            },
        );

        let funcs = Arc::clone(self);
        engine.register_fn(
            "recent_commits",
            move |limit: i64| -> Result<Dynamic, Box<EvalAltResult>> {
                let limit = u32::try_from(limit.max(0)).unwrap_or(u32::MAX);
                funcs.tool_call("recent_commits", format!("Last {limit} commits"), move |t| {
                    t.recent_commits(limit)
                })
            },
        );
    }

    /// Cooperative cancellation check, run before every host call.
    fn check_cancelled(&self) -> Result<(), Box<EvalAltResult>> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(runtime_error(&SandboxError::Cancelled));
        }
        Ok(())
    }

    /// A host call that crosses the bridge, wrapped in the tool-call
    /// notification sequence.
    fn bridged_call(
        &self,
        function: &str,
        title: String,
        call: HostCall,
    ) -> Result<serde_json::Value, Box<EvalAltResult>> {
        self.check_cancelled()?;
        let call_id = self.announce(title);
        match self.bridge.call(call) {
            Ok(value) => {
                self.complete(call_id, ToolCallStatus::Completed, None);
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(session_id = %self.session_id, function, %err, "host call failed");
                self.complete(call_id, ToolCallStatus::Failed, Some(err.to_string()));
                Err(runtime_error(&err))
            }
        }
    }

    /// A typed tool invocation under the per-call deadline. Tool failures
    /// come back as data (`success = false`); only a wedged or crashed tool
    /// raises, the same way a bridged call does.
    fn tool_call<T: Serialize + Send + 'static>(
        &self,
        function: &str,
        title: String,
        run: impl FnOnce(&dyn ToolSuite) -> ToolOutcome<T> + Send + 'static,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        self.check_cancelled()?;
        let call_id = self.announce(title);

        // The tool runs on its own thread so the deadline holds even when
        // it wedges; a late result has no receiver and is dropped.
        let (tx, rx) = sync_channel(1);
        let tools = Arc::clone(&self.tools);
        std::thread::spawn(move || {
            let _ = tx.send(run(tools.as_ref()));
        });

        match rx.recv_timeout(self.call_timeout) {
            Ok(outcome) => {
                if outcome.success {
                    self.complete(call_id, ToolCallStatus::Completed, None);
                } else {
                    self.complete(call_id, ToolCallStatus::Failed, outcome.parse_error.clone());
                }
                to_dynamic(&outcome)
            }
            Err(recv_err) => {
                let err = match recv_err {
                    RecvTimeoutError::Timeout => SandboxError::CallTimeout {
                        function: function.to_string(),
                    },
                    RecvTimeoutError::Disconnected => SandboxError::HostCall {
                        function: function.to_string(),
                        message: "tool crashed".to_string(),
                    },
                };
                self.complete(call_id, ToolCallStatus::Failed, Some(err.to_string()));
                Err(runtime_error(&err))
            }
        }
    }

    fn announce(&self, title: String) -> u64 {
        let call_id = self
            .host
            .begin_tool_call(self.session_id)
            .unwrap_or_default();
        self.host.notify(
            self.session_id,
            SessionNotification::ToolCall {
                tool_call_id: call_id,
                title,
                status: ToolCallStatus::InProgress,
            },
        );
        call_id
    }

    fn complete(&self, call_id: u64, status: ToolCallStatus, message: Option<String>) {
        self.host.notify(
            self.session_id,
            SessionNotification::ToolCallUpdate {
                tool_call_id: call_id,
                status,
                message,
            },
        );
    }
}

fn to_dynamic<T: Serialize>(value: &T) -> Result<Dynamic, Box<EvalAltResult>> {
    rhai::serde::to_dynamic(value)
}

fn runtime_error(err: &SandboxError) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(err.to_string()),
        rhai::Position::NONE,
    ))
}
