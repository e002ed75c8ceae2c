//! Transport-agnostic JSON-RPC method dispatch.
//!
//! Both transports feed raw frames to one [`Dispatcher`] over the same
//! coordinator, so a stdio client and any number of WebSocket clients see
//! identical semantics.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};

use agent_relay_core::{
    Agent, ClientId, ContentBlock, SessionError, SessionHost, SessionId, SessionNotification,
    StopReason, TurnContext,
};
use agent_relay_session::{Coordinator, Outbound};

use crate::capability::RpcClientCapability;
use crate::jsonrpc::{
    Frame, INTERNAL_ERROR, INVALID_PARAMS, PARSE_ERROR, best_effort_id, error_response,
    ok_response, parse_frame, session_error_response,
};

/// Protocol version answered to `initialize`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Routes inbound frames to coordinator and agent operations.
pub struct Dispatcher {
    coordinator: Arc<Coordinator>,
    agent: Arc<dyn Agent>,
}

impl Dispatcher {
    /// Create a dispatcher over a shared coordinator and agent.
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator>, agent: Arc<dyn Agent>) -> Self {
        Self { coordinator, agent }
    }

    /// Handle one raw inbound frame from `client_id`.
    ///
    /// Returns the immediate reply to queue, if any. A parse failure
    /// produces an error reply and leaves the connection usable; `prompt`
    /// replies later through the connection's outbound channel.
    pub fn handle_raw(
        &self,
        client_id: ClientId,
        capability: &RpcClientCapability,
        raw: &str,
    ) -> Option<Value> {
        let frame = match parse_frame(raw) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(client_id, %err, "unparseable frame");
                return Some(error_response(
                    best_effort_id(raw),
                    PARSE_ERROR,
                    &err.to_string(),
                ));
            }
        };

        match frame {
            Frame::Response { id, result } => {
                if let Some(id) = id.as_str() {
                    capability.resolve(id, result);
                }
                None
            }
            Frame::Notification { method, params } => {
                self.handle_notification(client_id, &method, &params);
                None
            }
            Frame::Request { id, method, params } => {
                self.handle_request(client_id, id, &method, &params)
            }
        }
    }

    fn handle_request(
        &self,
        client_id: ClientId,
        id: Value,
        method: &str,
        params: &Value,
    ) -> Option<Value> {
        match method {
            "initialize" => Some(ok_response(
                id,
                json!({
                    "protocol_version": PROTOCOL_VERSION,
                    "capabilities": { "resume": true, "cancel": true },
                }),
            )),
            "new_session" => Some(self.new_session(client_id, id, params)),
            "resume_session" => Some(self.resume_session(client_id, id, params)),
            "prompt" => self.prompt(client_id, id, params),
            "cancel" => {
                let session_id = match parse_session_id(params) {
                    Ok(session_id) => session_id,
                    Err(reason) => return Some(error_response(id, INVALID_PARAMS, reason)),
                };
                Some(match self.cancel(client_id, session_id) {
                    Ok(()) => ok_response(id, json!({})),
                    Err(err) => session_error_response(id, &err),
                })
            }
            _ => {
                tracing::warn!(client_id, method, "unknown method");
                Some(error_response(
                    id,
                    INTERNAL_ERROR,
                    &format!("Unknown method: {method}"),
                ))
            }
        }
    }

    fn handle_notification(&self, client_id: ClientId, method: &str, params: &Value) {
        match method {
            "cancel" => match parse_session_id(params) {
                Ok(session_id) => {
                    if let Err(err) = self.cancel(client_id, session_id) {
                        tracing::warn!(client_id, %err, "cancel notification refused");
                    }
                }
                Err(reason) => tracing::warn!(client_id, reason, "cancel notification ignored"),
            },
            _ => tracing::debug!(client_id, method, "unknown notification ignored"),
        }
    }

    fn new_session(&self, client_id: ClientId, id: Value, params: &Value) -> Value {
        let Some(cwd) = params.get("cwd").and_then(Value::as_str) else {
            return error_response(id, INVALID_PARAMS, "new_session requires 'cwd'");
        };
        match self.coordinator.new_session(PathBuf::from(cwd), client_id) {
            Ok((session_id, token)) => ok_response(
                id,
                json!({ "session_id": session_id, "resume_token": token.as_str() }),
            ),
            Err(err) => session_error_response(id, &err),
        }
    }

    fn resume_session(&self, client_id: ClientId, id: Value, params: &Value) -> Value {
        let session_id = match parse_session_id(params) {
            Ok(session_id) => session_id,
            Err(reason) => return error_response(id, INVALID_PARAMS, reason),
        };
        let Some(token) = params.get("resume_token").and_then(Value::as_str) else {
            return error_response(id, INVALID_PARAMS, "resume_session requires 'resume_token'");
        };
        match self.coordinator.resume_session(session_id, token, client_id) {
            Ok(resumed) => ok_response(
                id,
                json!({ "session_id": resumed.session_id, "state": resumed.state }),
            ),
            Err(err) => session_error_response(id, &err),
        }
    }

    /// Start a prompt turn.
    ///
    /// The turn runs on its own task so this connection's reader keeps
    /// draining frames; a `cancel` arriving mid-turn must not queue behind
    /// the turn itself. The response is sent when the turn ends.
    fn prompt(&self, client_id: ClientId, id: Value, params: &Value) -> Option<Value> {
        let session_id = match parse_session_id(params) {
            Ok(session_id) => session_id,
            Err(reason) => return Some(error_response(id, INVALID_PARAMS, reason)),
        };
        let content: Vec<ContentBlock> = match params.get("content") {
            Some(content) => match serde_json::from_value(content.clone()) {
                Ok(content) => content,
                Err(err) => {
                    return Some(error_response(
                        id,
                        INVALID_PARAMS,
                        &format!("bad 'content': {err}"),
                    ));
                }
            },
            None => return Some(error_response(id, INVALID_PARAMS, "prompt requires 'content'")),
        };

        let prepared = self
            .check_owner(client_id, session_id)
            .and_then(|()| {
                let cancel = self.coordinator.begin_turn(session_id)?;
                let cwd = self.coordinator.session_cwd(session_id)?;
                Ok((cancel, cwd))
            });
        let (cancel, cwd) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return Some(session_error_response(id, &err)),
        };

        let coordinator = Arc::clone(&self.coordinator);
        let agent = Arc::clone(&self.agent);
        tokio::spawn(async move {
            let ctx = TurnContext {
                session_id,
                cwd,
                content,
                cancel,
            };
            let stop_reason = match agent.run_turn(ctx).await {
                Ok(result) => result.stop_reason,
                Err(err) => {
                    tracing::error!(%session_id, %err, "turn failed");
                    StopReason::Error
                }
            };
            coordinator.end_turn(session_id);
            coordinator.notify(session_id, SessionNotification::TurnEnded { stop_reason });

            // The prompt's owner may have changed mid-turn; the response
            // still belongs to the connection that asked.
            let reply = ok_response(id, json!({ "stop_reason": stop_reason }));
            match coordinator.connection(client_id) {
                Some(handle) => {
                    handle.send(Outbound::Frame(reply));
                }
                None => tracing::debug!(client_id, "prompt reply dropped, client gone"),
            }
        });
        None
    }

    fn cancel(&self, client_id: ClientId, session_id: SessionId) -> Result<(), SessionError> {
        self.check_owner(client_id, session_id)?;
        self.coordinator.cancel(session_id)
    }

    fn check_owner(&self, client_id: ClientId, session_id: SessionId) -> Result<(), SessionError> {
        let handle = self.coordinator.route(session_id)?;
        if handle.client_id != client_id {
            return Err(SessionError::NotOwner(session_id));
        }
        Ok(())
    }
}

fn parse_session_id(params: &Value) -> Result<SessionId, &'static str> {
    params
        .get("session_id")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
        .ok_or("missing or malformed 'session_id'")
}
