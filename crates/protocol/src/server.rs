//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages sent from the session manager to editor clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Full state sync
    SessionsList {
        sessions: Vec<SessionSummary>,
    },

    // Lifecycle
    SessionStarted {
        session: SessionSummary,
    },
    SessionChanged {
        session: SessionSummary,
    },
    /// A placeholder session received its backend-assigned id
    SessionRekeyed {
        previous_id: String,
        session_id: String,
    },
    SessionRemoved {
        session_id: String,
    },

    // Streaming
    Chunk {
        session_id: String,
        text: String,
    },
    MessageAdded {
        session_id: String,
        message: ChatMessage,
    },
    PromptRequested {
        prompt: PromptRequest,
    },
    Stopped {
        session_id: String,
        #[serde(flatten)]
        stop: StopInfo,
    },

    // Errors
    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },
}
