//! End-to-end dispatch tests over an in-memory connection pair.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use agent_relay_core::{
    Agent, AgentError, ClientCapability, ClientId, ContentBlock, SessionHost, SessionId,
    SessionNotification, StopReason, TurnContext, TurnResult,
};
use agent_relay_session::{Coordinator, CoordinatorConfig, Outbound};
use agent_relay_transport::{Dispatcher, RpcClientCapability};

/// Echoes each text block back as an agent message chunk.
struct EchoAgent {
    host: Arc<Coordinator>,
}

#[async_trait]
impl Agent for EchoAgent {
    async fn run_turn(&self, ctx: TurnContext) -> Result<TurnResult, AgentError> {
        for block in &ctx.content {
            if let ContentBlock::Text { text } = block {
                self.host.notify(
                    ctx.session_id,
                    SessionNotification::AgentMessageChunk {
                        text: format!("echo:{text}"),
                    },
                );
            }
        }
        Ok(TurnResult {
            stop_reason: StopReason::EndTurn,
        })
    }
}

/// Holds its turn open until released, for overlap tests.
struct GatedAgent {
    release: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl Agent for GatedAgent {
    async fn run_turn(&self, _ctx: TurnContext) -> Result<TurnResult, AgentError> {
        self.release.notified().await;
        Ok(TurnResult {
            stop_reason: StopReason::EndTurn,
        })
    }
}

fn setup() -> (Arc<Coordinator>, Dispatcher) {
    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default()));
    let agent = Arc::new(EchoAgent {
        host: Arc::clone(&coordinator),
    });
    let dispatcher = Dispatcher::new(Arc::clone(&coordinator), agent);
    (coordinator, dispatcher)
}

fn connect(
    coordinator: &Coordinator,
) -> (ClientId, Arc<RpcClientCapability>, UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let capability = RpcClientCapability::new(tx.clone(), Duration::from_secs(1));
    let client_id =
        coordinator.register_client(tx, Arc::clone(&capability) as Arc<dyn ClientCapability>);
    (client_id, capability, rx)
}

fn open_session(
    dispatcher: &Dispatcher,
    client_id: ClientId,
    capability: &RpcClientCapability,
) -> (SessionId, String) {
    let reply = dispatcher
        .handle_raw(
            client_id,
            capability,
            &json!({ "jsonrpc": "2.0", "id": 1, "method": "new_session", "params": { "cwd": "/work" } })
                .to_string(),
        )
        .unwrap();
    let session_id = reply["result"]["session_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let token = reply["result"]["resume_token"].as_str().unwrap().to_string();
    (session_id, token)
}

async fn next_outbound(rx: &mut UnboundedReceiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for outbound message")
        .expect("outbound channel closed")
}

/// Drives a prompt to completion, collecting this session's updates until
/// the turn-end response arrives.
async fn run_prompt(
    dispatcher: &Dispatcher,
    client_id: ClientId,
    capability: &RpcClientCapability,
    rx: &mut UnboundedReceiver<Outbound>,
    session_id: SessionId,
    text: &str,
) -> (Vec<(SessionId, SessionNotification)>, Value) {
    let frame = json!({
        "jsonrpc": "2.0",
        "id": 10,
        "method": "prompt",
        "params": {
            "session_id": session_id,
            "content": [ { "type": "text", "text": text } ],
        },
    });
    assert!(dispatcher.handle_raw(client_id, capability, &frame.to_string()).is_none());

    let mut updates = Vec::new();
    loop {
        match next_outbound(rx).await {
            Outbound::SessionUpdate { session_id, update } => {
                updates.push((session_id, update));
            }
            Outbound::Frame(reply) => return (updates, reply),
        }
    }
}

#[tokio::test]
async fn malformed_frame_gets_parse_error_and_connection_survives() {
    let (coordinator, dispatcher) = setup();
    let (client_id, capability, _rx) = connect(&coordinator);

    let reply = dispatcher
        .handle_raw(client_id, &capability, "{not json")
        .unwrap();
    assert_eq!(reply["error"]["code"], -32700);

    // The same connection keeps working.
    let reply = dispatcher
        .handle_raw(
            client_id,
            &capability,
            r#"{"jsonrpc":"2.0","id":2,"method":"initialize","params":{"protocol_version":1}}"#,
        )
        .unwrap();
    assert_eq!(reply["id"], 2);
    assert_eq!(reply["result"]["protocol_version"], 1);
}

#[tokio::test]
async fn unknown_method_is_answered_without_dropping_the_connection() {
    let (coordinator, dispatcher) = setup();
    let (client_id, capability, _rx) = connect(&coordinator);

    let reply = dispatcher
        .handle_raw(
            client_id,
            &capability,
            r#"{"jsonrpc":"2.0","id":5,"method":"no_such_method","params":{}}"#,
        )
        .unwrap();
    assert_eq!(reply["error"]["code"], -32603);

    let (session_id, _token) = open_session(&dispatcher, client_id, &capability);
    assert_eq!(coordinator.route(session_id).unwrap().client_id, client_id);
}

#[tokio::test]
async fn prompt_streams_updates_then_replies() {
    let (coordinator, dispatcher) = setup();
    let (client_id, capability, mut rx) = connect(&coordinator);
    let (session_id, _token) = open_session(&dispatcher, client_id, &capability);

    let (updates, reply) =
        run_prompt(&dispatcher, client_id, &capability, &mut rx, session_id, "hello").await;

    assert_eq!(reply["id"], 10);
    assert_eq!(reply["result"]["stop_reason"], "end_turn");

    let texts: Vec<&str> = updates
        .iter()
        .filter_map(|(_, update)| match update {
            SessionNotification::AgentMessageChunk { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(texts, ["echo:hello"]);
    assert!(matches!(
        updates.last().unwrap().1,
        SessionNotification::TurnEnded {
            stop_reason: StopReason::EndTurn
        }
    ));
}

#[tokio::test]
async fn concurrent_clients_never_see_each_others_sessions() {
    let (coordinator, dispatcher) = setup();
    let (client_a, cap_a, mut rx_a) = connect(&coordinator);
    let (client_b, cap_b, mut rx_b) = connect(&coordinator);
    let (session_a, _) = open_session(&dispatcher, client_a, &cap_a);
    let (session_b, _) = open_session(&dispatcher, client_b, &cap_b);

    let (updates_a, reply_a) =
        run_prompt(&dispatcher, client_a, &cap_a, &mut rx_a, session_a, "alpha").await;
    let (updates_b, reply_b) =
        run_prompt(&dispatcher, client_b, &cap_b, &mut rx_b, session_b, "beta").await;

    assert_eq!(reply_a["result"]["stop_reason"], "end_turn");
    assert_eq!(reply_b["result"]["stop_reason"], "end_turn");

    for (session_id, update) in &updates_a {
        assert_eq!(*session_id, session_a);
        if let SessionNotification::AgentMessageChunk { text } = update {
            assert_eq!(text, "echo:alpha");
        }
    }
    for (session_id, update) in &updates_b {
        assert_eq!(*session_id, session_b);
        if let SessionNotification::AgentMessageChunk { text } = update {
            assert_eq!(text, "echo:beta");
        }
    }
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn overlapping_prompts_on_one_session_are_refused() {
    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default()));
    let release = Arc::new(tokio::sync::Notify::new());
    let agent = Arc::new(GatedAgent {
        release: Arc::clone(&release),
    });
    let dispatcher = Dispatcher::new(Arc::clone(&coordinator), agent);
    let (client_id, capability, mut rx) = connect(&coordinator);
    let (session_id, _token) = open_session(&dispatcher, client_id, &capability);

    let prompt = |id: u64| {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "prompt",
            "params": {
                "session_id": session_id,
                "content": [ { "type": "text", "text": "go" } ],
            },
        })
        .to_string()
    };

    // First turn is held open by the agent.
    assert!(dispatcher
        .handle_raw(client_id, &capability, &prompt(20))
        .is_none());
    coordinator.cancel(session_id).unwrap();

    // A second prompt must not start; starting it would clear the
    // cancellation the first turn is polling.
    let reply = dispatcher
        .handle_raw(client_id, &capability, &prompt(21))
        .unwrap();
    assert_eq!(reply["error"]["code"], -32001);
    assert_eq!(reply["error"]["data"]["kind"], "turn_in_flight");

    release.notify_one();
    loop {
        if let Outbound::Frame(reply) = next_outbound(&mut rx).await {
            assert_eq!(reply["id"], 20);
            break;
        }
    }

    // With the first turn finished, the session prompts again.
    assert!(dispatcher
        .handle_raw(client_id, &capability, &prompt(22))
        .is_none());
    release.notify_one();
    loop {
        if let Outbound::Frame(reply) = next_outbound(&mut rx).await {
            assert_eq!(reply["id"], 22);
            assert_eq!(reply["result"]["stop_reason"], "end_turn");
            break;
        }
    }
}

#[tokio::test]
async fn prompting_someone_elses_session_is_refused() {
    let (coordinator, dispatcher) = setup();
    let (client_a, cap_a, _rx_a) = connect(&coordinator);
    let (client_b, cap_b, _rx_b) = connect(&coordinator);
    let (session_a, _) = open_session(&dispatcher, client_a, &cap_a);

    let frame = json!({
        "jsonrpc": "2.0",
        "id": 11,
        "method": "prompt",
        "params": {
            "session_id": session_a,
            "content": [ { "type": "text", "text": "hijack" } ],
        },
    });
    let reply = dispatcher
        .handle_raw(client_b, &cap_b, &frame.to_string())
        .unwrap();
    assert_eq!(reply["error"]["code"], -32001);
    assert_eq!(reply["error"]["data"]["kind"], "not_owner");
}

#[tokio::test]
async fn resume_over_the_wire_reclaims_the_session() {
    let (coordinator, dispatcher) = setup();
    let (client_a, cap_a, _rx_a) = connect(&coordinator);
    let (session_id, token) = open_session(&dispatcher, client_a, &cap_a);
    coordinator.unregister_client(client_a, true);

    let (client_b, cap_b, mut rx_b) = connect(&coordinator);
    let frame = json!({
        "jsonrpc": "2.0",
        "id": 3,
        "method": "resume_session",
        "params": { "session_id": session_id, "resume_token": token },
    });
    let reply = dispatcher
        .handle_raw(client_b, &cap_b, &frame.to_string())
        .unwrap();
    assert_eq!(
        reply["result"]["session_id"].as_str().unwrap(),
        session_id.to_string()
    );

    // The reclaimed session now prompts from the new connection.
    let (updates, reply) =
        run_prompt(&dispatcher, client_b, &cap_b, &mut rx_b, session_id, "back").await;
    assert_eq!(reply["result"]["stop_reason"], "end_turn");
    assert!(updates
        .iter()
        .any(|(_, u)| matches!(u, SessionNotification::AgentMessageChunk { text } if text == "echo:back")));
}
