//! Client capability backed by server-initiated JSON-RPC requests.
//!
//! Outgoing requests are queued on the connection's outbound channel with a
//! `srv:`-prefixed id; the transport reader hands matching response frames
//! back via [`RpcClientCapability::resolve`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use agent_relay_core::{CapabilityError, ClientCapability, SessionId, SessionNotification};
use agent_relay_session::Outbound;

use crate::jsonrpc::request_frame;

type PendingReply = oneshot::Sender<Result<Value, Value>>;

/// Capability object for one wire connection.
pub struct RpcClientCapability {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<String, PendingReply>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl RpcClientCapability {
    /// Create a capability writing to `outbound`, waiting at most `timeout`
    /// per client round trip.
    #[must_use]
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            timeout,
        })
    }

    /// Complete a pending server request from an inbound response frame.
    /// Unknown ids are ignored; the waiter may have timed out already.
    pub fn resolve(&self, id: &str, result: Result<Value, Value>) {
        let waiter = match self.pending.lock() {
            Ok(mut pending) => pending.remove(id),
            Err(poisoned) => poisoned.into_inner().remove(id),
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!(id, "response for unknown server request dropped"),
        }
    }

    fn remove_pending(&self, id: &str) {
        match self.pending.lock() {
            Ok(mut pending) => {
                pending.remove(id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(id);
            }
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, CapabilityError> {
        let id = format!("srv:{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        match self.pending.lock() {
            Ok(mut pending) => pending.insert(id.clone(), tx),
            Err(poisoned) => poisoned.into_inner().insert(id.clone(), tx),
        };

        let frame = request_frame(&id, method, params);
        if self.outbound.send(Outbound::Frame(frame)).is_err() {
            self.remove_pending(&id);
            return Err(CapabilityError::Unavailable);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Err(_) => {
                self.remove_pending(&id);
                Err(CapabilityError::Timeout)
            }
            Ok(Err(_)) => Err(CapabilityError::Unavailable),
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified error");
                Err(CapabilityError::Rejected(message.to_string()))
            }
        }
    }
}

fn field_str(result: &Value, field: &str) -> Result<String, CapabilityError> {
    result
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CapabilityError::Io(format!("reply is missing '{field}'")))
}

#[async_trait]
impl ClientCapability for RpcClientCapability {
    async fn session_update(
        &self,
        session_id: SessionId,
        update: SessionNotification,
    ) -> Result<(), CapabilityError> {
        self.outbound
            .send(Outbound::SessionUpdate { session_id, update })
            .map_err(|_| CapabilityError::Unavailable)
    }

    async fn read_text_file(&self, path: &str) -> Result<String, CapabilityError> {
        let result = self
            .call("fs/read_text_file", json!({ "path": path }))
            .await?;
        field_str(&result, "content")
    }

    async fn write_text_file(&self, path: &str, content: &str) -> Result<(), CapabilityError> {
        self.call(
            "fs/write_text_file",
            json!({ "path": path, "content": content }),
        )
        .await?;
        Ok(())
    }

    async fn create_terminal(&self, command: &str) -> Result<String, CapabilityError> {
        let result = self
            .call("terminal/create", json!({ "command": command }))
            .await?;
        field_str(&result, "terminal_id")
    }

    async fn wait_for_exit(&self, terminal_id: &str) -> Result<i32, CapabilityError> {
        let result = self
            .call("terminal/wait_for_exit", json!({ "terminal_id": terminal_id }))
            .await?;
        result
            .get("exit_code")
            .and_then(Value::as_i64)
            .map(|code| code as i32)
            .ok_or_else(|| CapabilityError::Io("reply is missing 'exit_code'".to_string()))
    }

    async fn read_output(&self, terminal_id: &str) -> Result<String, CapabilityError> {
        let result = self
            .call("terminal/output", json!({ "terminal_id": terminal_id }))
            .await?;
        field_str(&result, "output")
    }
}
