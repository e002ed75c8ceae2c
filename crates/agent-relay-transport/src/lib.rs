//! Wire protocol and transports: JSON-RPC framing, method dispatch, stdio
//! and WebSocket front ends over one shared coordinator.

pub mod capability;
pub mod dispatch;
pub mod jsonrpc;
pub mod stdio;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use capability::RpcClientCapability;
pub use dispatch::{Dispatcher, PROTOCOL_VERSION};
pub use jsonrpc::{Frame, outbound_to_frame, parse_frame};
pub use stdio::run_stdio;

#[cfg(feature = "websocket")]
pub use websocket::{create_ws_router, ws_handler};
