//! Client → Server messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{ControlEventType, WorkflowMetadata};
use crate::types::PromptDecision;

/// Messages sent from the editor client to the session manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Lifecycle
    StartWorkflow {
        goal: String,
        #[serde(default)]
        metadata: WorkflowMetadata,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        additional_context: Vec<Value>,
    },
    SendEvent {
        session_id: String,
        event_type: ControlEventType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    StopWorkflow {
        session_id: String,
    },
    /// Acknowledge a terminal session and drop it from the manager
    DismissWorkflow {
        session_id: String,
    },

    // Interaction
    ResolvePrompt {
        session_id: String,
        prompt_id: String,
        #[serde(flatten)]
        decision: PromptDecision,
    },

    // Queries
    ListSessions,
    GetSession {
        session_id: String,
    },
}
