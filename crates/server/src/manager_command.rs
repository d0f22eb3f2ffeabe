//! Commands sent to the manager actor from the editor surface, the
//! transports, and its own spawned delivery tasks.

use serde_json::Value;
use tokio::sync::oneshot;
use workflowdock_connectors::NormalizedEvent;
use workflowdock_protocol::{ControlEventType, PromptDecision, SessionSummary, WorkflowMetadata};

use crate::error::ManagerError;

pub type Reply<T> = oneshot::Sender<Result<T, ManagerError>>;

pub enum ManagerCommand {
    // -- Transport input --
    /// Event translated by a transport bridge
    Inbound(NormalizedEvent),

    // -- Host requests (oneshot replies) --
    StartWorkflow {
        goal: String,
        metadata: WorkflowMetadata,
        additional_context: Vec<Value>,
        reply: Reply<SessionSummary>,
    },
    SendControl {
        session_id: String,
        event_type: ControlEventType,
        payload: Option<Value>,
        reply: Reply<()>,
    },
    /// Cancel a session and remove it from the store
    StopWorkflow {
        session_id: String,
        reply: Reply<()>,
    },
    /// Remove a terminal session
    DismissWorkflow {
        session_id: String,
        reply: Reply<()>,
    },
    ResolvePrompt {
        session_id: String,
        prompt_id: String,
        decision: PromptDecision,
        reply: Reply<()>,
    },
    GetSession {
        session_id: String,
        reply: oneshot::Sender<Option<SessionSummary>>,
    },

    // -- Completions of spawned transport calls --
    StartDispatched {
        placeholder_id: String,
        result: Result<Option<String>, String>,
    },
    DecisionDelivered {
        session_id: String,
        prompt_id: String,
        result: Result<(), String>,
    },

    // -- Housekeeping --
    /// Stop non-terminal sessions with no activity for `max_idle_secs`
    ExpireIdle { max_idle_secs: u64 },
}

impl ManagerCommand {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ManagerCommand::Inbound(_) => "inbound",
            ManagerCommand::StartWorkflow { .. } => "start_workflow",
            ManagerCommand::SendControl { .. } => "send_control",
            ManagerCommand::StopWorkflow { .. } => "stop_workflow",
            ManagerCommand::DismissWorkflow { .. } => "dismiss_workflow",
            ManagerCommand::ResolvePrompt { .. } => "resolve_prompt",
            ManagerCommand::GetSession { .. } => "get_session",
            ManagerCommand::StartDispatched { .. } => "start_dispatched",
            ManagerCommand::DecisionDelivered { .. } => "decision_delivered",
            ManagerCommand::ExpireIdle { .. } => "expire_idle",
        }
    }
}
