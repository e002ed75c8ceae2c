//! The synchronous-to-asynchronous host-call bridge.
//!
//! Sandbox workers are blocking threads; the client capability is async.
//! A worker hands a `HostTask` to the service task running on the protocol
//! layer's runtime and blocks, with a deadline, on a single-use reply
//! channel. The service task must never run on a sandbox worker and the
//! worker must never run on the runtime's event threads; that split is
//! what keeps the bridge deadlock-free.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender, sync_channel};
use std::time::Duration;

use tokio::sync::mpsc;

use agent_relay_core::{SandboxError, SessionHost, SessionId};

/// One unit of asynchronous work submitted by a sandbox worker.
#[derive(Debug, Clone)]
pub enum HostCall {
    ReadFile { path: String },
    WriteFile { path: String, content: String },
    RunCommand { command: String },
}

impl HostCall {
    fn function(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::WriteFile { .. } => "write_file",
            Self::RunCommand { .. } => "run_command",
        }
    }
}

/// A submitted call plus its single-use reply slot.
pub struct HostTask {
    call: HostCall,
    reply: SyncSender<Result<serde_json::Value, String>>,
    /// Set by the caller when it gave up waiting; a late reply is dropped.
    abandoned: Arc<AtomicBool>,
}

/// Synchronous side of the bridge, cloned into each host function.
#[derive(Clone)]
pub struct CallBridge {
    tx: mpsc::UnboundedSender<HostTask>,
    call_timeout: Duration,
}

impl CallBridge {
    /// Submit a call and block for its result, up to the per-call timeout.
    ///
    /// # Errors
    /// `CallTimeout` when the deadline passes, `HostCall` when the client
    /// side failed or the service is gone.
    pub fn call(&self, call: HostCall) -> Result<serde_json::Value, SandboxError> {
        let function = call.function().to_string();
        let (reply_tx, reply_rx) = sync_channel(1);
        let abandoned = Arc::new(AtomicBool::new(false));

        let task = HostTask {
            call,
            reply: reply_tx,
            abandoned: Arc::clone(&abandoned),
        };
        self.tx.send(task).map_err(|_| SandboxError::HostCall {
            function: function.clone(),
            message: "host service stopped".to_string(),
        })?;

        match reply_rx.recv_timeout(self.call_timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(SandboxError::HostCall { function, message }),
            Err(RecvTimeoutError::Timeout) => {
                abandoned.store(true, Ordering::SeqCst);
                Err(SandboxError::CallTimeout { function })
            }
            Err(RecvTimeoutError::Disconnected) => Err(SandboxError::HostCall {
                function,
                message: "host service dropped the call".to_string(),
            }),
        }
    }
}

/// Spawn the async service for one sandbox invocation.
///
/// The service resolves the session's *current* owner per call, so file
/// requests follow ownership across a mid-turn resume. Dropping the
/// returned bridge (and aborting the handle) shuts the service down.
pub fn spawn_host_service(
    session_id: SessionId,
    host: Arc<dyn SessionHost>,
    call_timeout: Duration,
) -> (CallBridge, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<HostTask>();

    let handle = tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            let result = tokio::time::timeout(call_timeout, run_call(session_id, &host, &task.call))
                .await
                .unwrap_or_else(|_| Err("client did not answer in time".to_string()));

            if task.abandoned.load(Ordering::SeqCst) {
                tracing::debug!(%session_id, "dropping reply to abandoned host call");
                continue;
            }
            // try_send: the slot holds one message and the caller may have
            // just timed out; either way this never blocks the service.
            let _ = task.reply.try_send(result);
        }
    });

    (CallBridge { tx, call_timeout }, handle)
}

async fn run_call(
    session_id: SessionId,
    host: &Arc<dyn SessionHost>,
    call: &HostCall,
) -> Result<serde_json::Value, String> {
    let capability = host
        .capability(session_id)
        .ok_or_else(|| "session has no live owner".to_string())?;

    match call {
        HostCall::ReadFile { path } => capability
            .read_text_file(path)
            .await
            .map(serde_json::Value::String)
            .map_err(|e| e.to_string()),
        HostCall::WriteFile { path, content } => capability
            .write_text_file(path, content)
            .await
            .map(|()| serde_json::Value::Null)
            .map_err(|e| e.to_string()),
        HostCall::RunCommand { command } => {
            let terminal_id = capability
                .create_terminal(command)
                .await
                .map_err(|e| e.to_string())?;
            let exit_code = capability
                .wait_for_exit(&terminal_id)
                .await
                .map_err(|e| e.to_string())?;
            let output = capability
                .read_output(&terminal_id)
                .await
                .map_err(|e| e.to_string())?;
            Ok(serde_json::json!({
                "exit_code": exit_code,
                "output": output,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_relay_core::{ChannelCapability, ClientCapability, SessionNotification};

    /// Host double bound to a single capability.
    struct FixedHost {
        capability: Option<Arc<dyn ClientCapability>>,
    }

    impl SessionHost for FixedHost {
        fn notify(&self, _session_id: SessionId, _update: SessionNotification) {}
        fn capability(&self, _session_id: SessionId) -> Option<Arc<dyn ClientCapability>> {
            self.capability.clone()
        }
        fn begin_tool_call(&self, _session_id: SessionId) -> Option<u64> {
            Some(1)
        }
    }

    #[tokio::test]
    async fn bridge_round_trips_a_file_read() {
        let (capability, _updates) = ChannelCapability::new();
        capability.put_file("a.rs", "fn a() {}");
        let host: Arc<dyn SessionHost> = Arc::new(FixedHost {
            capability: Some(capability),
        });

        let (bridge, service) =
            spawn_host_service(uuid::Uuid::new_v4(), host, Duration::from_secs(2));

        let value = tokio::task::spawn_blocking(move || {
            bridge.call(HostCall::ReadFile {
                path: "a.rs".to_string(),
            })
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(value, serde_json::Value::String("fn a() {}".to_string()));
        service.abort();
    }

    #[tokio::test]
    async fn orphaned_session_fails_the_call_not_the_worker() {
        let host: Arc<dyn SessionHost> = Arc::new(FixedHost { capability: None });
        let (bridge, service) =
            spawn_host_service(uuid::Uuid::new_v4(), host, Duration::from_secs(2));

        let err = tokio::task::spawn_blocking(move || {
            bridge.call(HostCall::WriteFile {
                path: "x".to_string(),
                content: "y".to_string(),
            })
        })
        .await
        .unwrap()
        .unwrap_err();

        assert!(matches!(err, SandboxError::HostCall { .. }));
        service.abort();
    }

    #[tokio::test]
    async fn stopped_service_is_reported_not_hung() {
        let host: Arc<dyn SessionHost> = Arc::new(FixedHost { capability: None });
        let (bridge, service) =
            spawn_host_service(uuid::Uuid::new_v4(), host, Duration::from_millis(100));
        service.abort();
        // Give the abort a moment to land so the send fails deterministically.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = tokio::task::spawn_blocking(move || {
            bridge.call(HostCall::RunCommand {
                command: "true".to_string(),
            })
        })
        .await
        .unwrap();

        assert!(result.is_err());
    }
}
