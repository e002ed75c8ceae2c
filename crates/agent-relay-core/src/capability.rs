//! The capability seams between the sandbox, the coordinator and the
//! driving client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::ids::SessionId;
use crate::notify::SessionNotification;

/// Capability call failure.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Client is unavailable")]
    Unavailable,
    #[error("Client request timed out")]
    Timeout,
    #[error("Client rejected the request: {0}")]
    Rejected(String),
    #[error("I/O error: {0}")]
    Io(String),
}

/// What a connected client can do for the server.
///
/// One implementation per transport plus a channel-backed test double.
#[async_trait]
pub trait ClientCapability: Send + Sync {
    /// Deliver a session update notification.
    async fn session_update(
        &self,
        session_id: SessionId,
        update: SessionNotification,
    ) -> Result<(), CapabilityError>;

    /// Read a text file on the client side.
    async fn read_text_file(&self, path: &str) -> Result<String, CapabilityError>;

    /// Write a text file on the client side.
    async fn write_text_file(&self, path: &str, content: &str) -> Result<(), CapabilityError>;

    /// Start a terminal running `command`; returns a terminal id.
    async fn create_terminal(&self, command: &str) -> Result<String, CapabilityError>;

    /// Wait for a terminal to exit; returns the exit code.
    async fn wait_for_exit(&self, terminal_id: &str) -> Result<i32, CapabilityError>;

    /// Read accumulated terminal output.
    async fn read_output(&self, terminal_id: &str) -> Result<String, CapabilityError>;
}

/// Sync view of the coordinator used by the sandbox side.
///
/// All methods take the coordinator's single lock briefly; they are safe to
/// call from blocking workers.
pub trait SessionHost: Send + Sync {
    /// Push an update to the session's current owner. Silently dropped if
    /// the session is orphaned.
    fn notify(&self, session_id: SessionId, update: SessionNotification);

    /// The capability object of the session's current owner.
    fn capability(&self, session_id: SessionId) -> Option<Arc<dyn ClientCapability>>;

    /// Allocate the next tool-call id for the session.
    fn begin_tool_call(&self, session_id: SessionId) -> Option<u64>;
}

/// Channel-backed test double for `ClientCapability`.
///
/// Updates land on an mpsc channel; files live in an in-memory map.
pub struct ChannelCapability {
    updates: mpsc::UnboundedSender<(SessionId, SessionNotification)>,
    files: Mutex<HashMap<String, String>>,
    terminal_output: Mutex<HashMap<String, String>>,
}

impl ChannelCapability {
    /// Create a double plus the receiver its updates land on.
    #[must_use]
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(SessionId, SessionNotification)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                updates: tx,
                files: Mutex::new(HashMap::new()),
                terminal_output: Mutex::new(HashMap::new()),
            }),
            rx,
        )
    }

    /// Seed a file the double will serve.
    pub fn put_file(&self, path: impl Into<String>, content: impl Into<String>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.into(), content.into());
        }
    }

    /// Read back a file written through the capability.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().ok().and_then(|f| f.get(path).cloned())
    }
}

#[async_trait]
impl ClientCapability for ChannelCapability {
    async fn session_update(
        &self,
        session_id: SessionId,
        update: SessionNotification,
    ) -> Result<(), CapabilityError> {
        self.updates
            .send((session_id, update))
            .map_err(|_| CapabilityError::Unavailable)
    }

    async fn read_text_file(&self, path: &str) -> Result<String, CapabilityError> {
        self.files
            .lock()
            .map_err(|e| CapabilityError::Io(e.to_string()))?
            .get(path)
            .cloned()
            .ok_or_else(|| CapabilityError::Rejected(format!("no such file: {path}")))
    }

    async fn write_text_file(&self, path: &str, content: &str) -> Result<(), CapabilityError> {
        self.files
            .lock()
            .map_err(|e| CapabilityError::Io(e.to_string()))?
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn create_terminal(&self, command: &str) -> Result<String, CapabilityError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.terminal_output
            .lock()
            .map_err(|e| CapabilityError::Io(e.to_string()))?
            .insert(id.clone(), format!("$ {command}\n"));
        Ok(id)
    }

    async fn wait_for_exit(&self, _terminal_id: &str) -> Result<i32, CapabilityError> {
        Ok(0)
    }

    async fn read_output(&self, terminal_id: &str) -> Result<String, CapabilityError> {
        self.terminal_output
            .lock()
            .map_err(|e| CapabilityError::Io(e.to_string()))?
            .get(terminal_id)
            .cloned()
            .ok_or(CapabilityError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn double_serves_seeded_files() {
        let (capability, _rx) = ChannelCapability::new();
        capability.put_file("src/lib.rs", "fn lib() {}");

        let content = capability.read_text_file("src/lib.rs").await.unwrap();
        assert_eq!(content, "fn lib() {}");

        capability
            .write_text_file("src/new.rs", "fn new() {}")
            .await
            .unwrap();
        assert_eq!(capability.file("src/new.rs").unwrap(), "fn new() {}");
    }

    #[tokio::test]
    async fn double_forwards_updates() {
        let (capability, mut rx) = ChannelCapability::new();
        let session_id = uuid::Uuid::new_v4();

        capability
            .session_update(
                session_id,
                SessionNotification::AgentMessageChunk {
                    text: "hi".to_string(),
                },
            )
            .await
            .unwrap();

        let (got_session, update) = rx.recv().await.unwrap();
        assert_eq!(got_session, session_id);
        assert!(matches!(
            update,
            SessionNotification::AgentMessageChunk { .. }
        ));
    }

    #[tokio::test]
    async fn missing_file_is_rejected_not_panicked() {
        let (capability, _rx) = ChannelCapability::new();
        let err = capability.read_text_file("nope.rs").await.unwrap_err();
        assert!(matches!(err, CapabilityError::Rejected(_)));
    }
}
