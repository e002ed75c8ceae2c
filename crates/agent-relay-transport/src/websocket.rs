//! WebSocket transport.
//!
//! Each accepted socket registers as one coordinator client; text frames
//! carry the same JSON-RPC shapes as the stdio transport. Closing the
//! socket orphans the client's sessions for the reconnection grace period.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use agent_relay_core::ClientCapability;
use agent_relay_session::{Coordinator, Outbound};

use crate::capability::RpcClientCapability;
use crate::dispatch::Dispatcher;
use crate::jsonrpc::outbound_to_frame;

const CLIENT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the WebSocket route.
#[derive(Clone)]
pub struct WsState {
    dispatcher: Arc<Dispatcher>,
    coordinator: Arc<Coordinator>,
}

impl WsState {
    /// Bundle the dispatcher and coordinator for the route handler.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, coordinator: Arc<Coordinator>) -> Self {
        Self {
            dispatcher,
            coordinator,
        }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let reply_tx = tx.clone();
    let capability = RpcClientCapability::new(tx.clone(), CLIENT_CALL_TIMEOUT);
    let client_id = state
        .coordinator
        .register_client(tx, Arc::clone(&capability) as Arc<dyn ClientCapability>);
    tracing::info!(client_id, "websocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = outbound_to_frame(msg).to_string();
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let raw = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(client_id, "websocket error: {e}");
                break;
            }
        };

        if let Some(reply) = state.dispatcher.handle_raw(client_id, &capability, &raw) {
            if reply_tx.send(Outbound::Frame(reply)).is_err() {
                break;
            }
        }
    }

    tracing::info!(client_id, "websocket client disconnected");
    // Sessions survive as orphans; the client may resume within the grace
    // period.
    state.coordinator.unregister_client(client_id, true);
    send_task.abort();
}

/// Create the WebSocket router.
///
/// # Example
/// ```ignore
/// let app = axum::Router::new()
///     .merge(create_ws_router(dispatcher, coordinator));
/// ```
#[must_use]
pub fn create_ws_router(dispatcher: Arc<Dispatcher>, coordinator: Arc<Coordinator>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(WsState::new(dispatcher, coordinator))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
