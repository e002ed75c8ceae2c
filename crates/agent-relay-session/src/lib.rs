//! Session coordination: connections, ownership, secure reconnection.

pub mod coordinator;
pub mod handle;

pub use coordinator::{Coordinator, CoordinatorConfig, ResumedSession};
pub use handle::{ConnectionHandle, Outbound};
