//! workflowdock protocol
//!
//! Shared types for the workflow session manager: the editor-facing
//! client/server messages (JSON over WebSocket) and the intermediary-facing
//! envelope and control events.

use uuid::Uuid;

pub mod backend;
pub mod client;
pub mod server;
pub mod types;

pub use backend::*;
pub use client::ClientMessage;
pub use server::ServerMessage;
pub use types::*;

/// Prefix carried by locally generated session ids until the backend
/// assigns a real one.
pub const PLACEHOLDER_PREFIX: &str = "pending-";

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a placeholder session id for a workflow the backend has not
/// confirmed yet.
pub fn new_placeholder_id() -> String {
    format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4())
}

pub fn is_placeholder_id(id: &str) -> bool {
    id.starts_with(PLACEHOLDER_PREFIX)
}
