//! Demo relay server with a stubbed tool suite.
//!
//! Run with: cargo run -p relay-server-demo
//!
//! WebSocket clients connect to ws://localhost:3000/ws; pass `--stdio` to
//! serve one line-framed JSON-RPC client on stdin/stdout instead.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_relay_core::{StubToolSuite, ToolSuite};
use agent_relay_sandbox::{SandboxConfig, SandboxExecutor, ScriptAgent};
use agent_relay_session::{Coordinator, CoordinatorConfig};
use agent_relay_transport::{Dispatcher, create_ws_router, run_stdio};

const TYPECHECK_OUTPUT: &str = "\
src/lib.rs:14:9: error: mismatched types
src/lib.rs:30:1: warning: unused import
";

const TEST_OUTPUT: &str = "\
test parser::roundtrip ... ok
test parser::empty_input ... ok
test result: ok. 2 passed; 0 failed; 0 ignored
";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default()));
    coordinator.spawn_sweeper();

    let tools: Arc<dyn ToolSuite> = Arc::new(StubToolSuite {
        typecheck_output: TYPECHECK_OUTPUT.to_string(),
        test_output: TEST_OUTPUT.to_string(),
        ..StubToolSuite::default()
    });
    let executor = Arc::new(SandboxExecutor::new(
        Arc::clone(&coordinator) as _,
        tools,
        SandboxConfig::default(),
    ));
    let agent = Arc::new(ScriptAgent::new(executor));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&coordinator), agent));

    if std::env::args().any(|arg| arg == "--stdio") {
        run_stdio(dispatcher, coordinator).await?;
        return Ok(());
    }

    // Build router
    let app = create_ws_router(dispatcher, Arc::clone(&coordinator));

    // Start server
    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
