//! Line-framed stdio transport.
//!
//! The process's stdin/stdout carry one JSON-RPC frame per line. The stdio
//! client registers with the coordinator like any other connection, so its
//! sessions route through the same ownership model as WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use agent_relay_core::ClientCapability;
use agent_relay_session::{Coordinator, Outbound};

use crate::capability::RpcClientCapability;
use crate::dispatch::Dispatcher;
use crate::jsonrpc::outbound_to_frame;

/// How long a server-initiated request may wait for the stdio client.
const CLIENT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Serve one client over stdin/stdout until EOF.
///
/// A stdio client has no way back to its sessions once the pipe closes, so
/// unregistration deletes them immediately instead of orphaning them.
pub async fn run_stdio(
    dispatcher: Arc<Dispatcher>,
    coordinator: Arc<Coordinator>,
) -> std::io::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let reply_tx = tx.clone();
    let capability = RpcClientCapability::new(tx.clone(), CLIENT_CALL_TIMEOUT);
    let client_id =
        coordinator.register_client(tx, Arc::clone(&capability) as Arc<dyn ClientCapability>);
    tracing::info!(client_id, "stdio client connected");

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(msg) = rx.recv().await {
            let mut line = outbound_to_frame(msg).to_string();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(reply) = dispatcher.handle_raw(client_id, &capability, &line) {
            if reply_tx.send(Outbound::Frame(reply)).is_err() {
                break;
            }
        }
    }

    tracing::info!(client_id, "stdio client disconnected");
    coordinator.unregister_client(client_id, false);
    writer.abort();
    Ok(())
}
