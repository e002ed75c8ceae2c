//! The restricted script engine.
//!
//! One engine is built per invocation with hard resource limits and no
//! module loading; the only reachable side effects are the injected host
//! functions. Execution happens on a blocking worker, never on the
//! runtime's event threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, ParseErrorType, Scope};
use serde::Serialize;

use agent_relay_core::{SandboxError, SessionHost, SessionId, SessionNotification, ToolSuite};

use crate::bridge::spawn_host_service;
use crate::functions::ExternalFunctions;

/// Sandbox resource limits.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter operation budget.
    pub max_operations: u64,
    /// Wall-clock budget for one code block.
    pub wall_clock: Duration,
    /// Deadline for each individual host call.
    pub call_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            wall_clock: Duration::from_secs(120),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of one `execute_code` invocation, always returned as data.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    /// Printed output plus the final expression value, if any.
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SandboxError>,
    pub duration_ms: u64,
}

impl ExecutionOutcome {
    fn failure(error: SandboxError, output: String, started: Instant) -> Self {
        Self {
            success: false,
            output,
            error: Some(error),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Runs model-authored code blocks against the injected host functions.
pub struct SandboxExecutor {
    host: Arc<dyn SessionHost>,
    tools: Arc<dyn ToolSuite>,
    config: SandboxConfig,
}

impl SandboxExecutor {
    /// Create an executor bound to a session host and tool suite.
    #[must_use]
    pub fn new(
        host: Arc<dyn SessionHost>,
        tools: Arc<dyn ToolSuite>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            host,
            tools,
            config,
        }
    }

    /// The session host this executor notifies through.
    #[must_use]
    pub fn host(&self) -> Arc<dyn SessionHost> {
        Arc::clone(&self.host)
    }

    /// Execute one block of code for `session_id`.
    ///
    /// Never returns an error: every failure mode is folded into the
    /// outcome so the model can see it and the session continues.
    pub async fn execute_code(
        &self,
        session_id: SessionId,
        cancel: Arc<AtomicBool>,
        code: &str,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let (bridge, service) =
            spawn_host_service(session_id, Arc::clone(&self.host), self.config.call_timeout);
        let functions = ExternalFunctions::new(
            session_id,
            bridge,
            Arc::clone(&self.tools),
            Arc::clone(&self.host),
            Arc::clone(&cancel),
            self.config.call_timeout,
        );

        let config = self.config.clone();
        let host = Arc::clone(&self.host);
        let code = code.to_string();
        let worker = tokio::task::spawn_blocking(move || {
            run_script(&functions, &host, session_id, &code, &cancel, &config)
        });

        // Hard stop: cooperative cancellation plus the progress hook cover
        // script loops, but a worker wedged inside a host call is only
        // bounded by call_timeout. Give it that much slack, then abandon.
        let budget = self.config.wall_clock + self.config.call_timeout;
        let outcome = match tokio::time::timeout(budget, worker).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => {
                tracing::error!(%session_id, %join_err, "sandbox worker panicked");
                ExecutionOutcome::failure(
                    SandboxError::Script {
                        message: "sandbox worker panicked".to_string(),
                    },
                    String::new(),
                    started,
                )
            }
            Err(_) => {
                tracing::warn!(%session_id, "sandbox worker torn down after hard timeout");
                ExecutionOutcome::failure(
                    SandboxError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    },
                    String::new(),
                    started,
                )
            }
        };

        service.abort();
        outcome
    }
}

/// Progress-hook termination tokens.
const TERM_CANCELLED: &str = "cancelled";
const TERM_DEADLINE: &str = "deadline";

fn build_engine(
    functions: &Arc<ExternalFunctions>,
    host: &Arc<dyn SessionHost>,
    session_id: SessionId,
    cancel: &Arc<AtomicBool>,
    config: &SandboxConfig,
    captured: &Arc<Mutex<String>>,
) -> Engine {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(64, 64);
    engine.set_max_operations(config.max_operations);
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);
    engine.set_max_call_levels(64);
    engine.set_max_modules(0);
    engine.disable_symbol("import");
    engine.disable_symbol("eval");

    let deadline = Instant::now() + config.wall_clock;
    let cancel_flag = Arc::clone(cancel);
    engine.on_progress(move |_ops| {
        if cancel_flag.load(Ordering::SeqCst) {
            return Some(TERM_CANCELLED.into());
        }
        if Instant::now() > deadline {
            return Some(TERM_DEADLINE.into());
        }
        None
    });

    let sink = Arc::clone(captured);
    let print_host = Arc::clone(host);
    engine.on_print(move |text| {
        if let Ok(mut buf) = sink.lock() {
            if !buf.is_empty() {
                buf.push('\n');
            }
            buf.push_str(text);
        }
        print_host.notify(
            session_id,
            SessionNotification::ExecutionOutput {
                text: text.to_string(),
            },
        );
    });

    functions.register(&mut engine);
    engine
}

fn run_script(
    functions: &Arc<ExternalFunctions>,
    host: &Arc<dyn SessionHost>,
    session_id: SessionId,
    code: &str,
    cancel: &Arc<AtomicBool>,
    config: &SandboxConfig,
) -> ExecutionOutcome {
    let started = Instant::now();
    let captured = Arc::new(Mutex::new(String::new()));
    let engine = build_engine(functions, host, session_id, cancel, config, &captured);

    // Compile first: disallowed constructs are rejected here, before any
    // host-visible side effect.
    let ast = match engine.compile(code) {
        Ok(ast) => ast,
        Err(parse_err) => {
            // Disabled symbols come back as reserved-symbol parse errors;
            // everything else is an ordinary script mistake.
            let error = match parse_err.0.as_ref() {
                ParseErrorType::Reserved(symbol) => SandboxError::Violation {
                    message: format!("disallowed symbol `{symbol}`"),
                },
                _ => SandboxError::Script {
                    message: parse_err.to_string(),
                },
            };
            return ExecutionOutcome::failure(error, String::new(), started);
        }
    };

    let mut scope = Scope::new();
    let result = engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast);
    let mut output = captured.lock().map(|b| b.clone()).unwrap_or_default();

    match result {
        Ok(value) => {
            if !value.is_unit() {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&value.to_string());
            }
            ExecutionOutcome {
                success: true,
                output,
                error: None,
                duration_ms: started.elapsed().as_millis() as u64,
            }
        }
        Err(eval_err) => {
            let error = classify_eval_error(&eval_err, started);
            ExecutionOutcome::failure(error, output, started)
        }
    }
}

fn classify_eval_error(err: &EvalAltResult, started: Instant) -> SandboxError {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match err {
        EvalAltResult::ErrorTerminated(token, _) => {
            if token.to_string() == TERM_CANCELLED {
                SandboxError::Cancelled
            } else {
                SandboxError::Timeout { elapsed_ms }
            }
        }
        EvalAltResult::ErrorTooManyOperations(_) => SandboxError::Timeout { elapsed_ms },
        other => SandboxError::Script {
            message: other.to_string(),
        },
    }
}
