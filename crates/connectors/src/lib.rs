//! workflowdock connectors
//!
//! Transport bridges to the workflow intermediary. Each bridge speaks its
//! native channel (NDJSON notify/request stream, or a WebSocket event
//! subscription) and translates inbound traffic into [`NormalizedEvent`]s
//! so the session manager only ever sees one event shape.

pub mod notify;
pub mod realtime;

use async_trait::async_trait;
use thiserror::Error;
use workflowdock_protocol::{
    CommandRequest, CommandResult, StartWorkflowRequest, ToolApprovalResponse,
    WorkflowControlEvent, WorkflowEnvelope,
};

pub use notify::NotifyChannel;
pub use realtime::RealtimeChannel;

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Transport I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Request {method} timed out after {secs}s")]
    Timeout { method: String, secs: u64 },

    #[error("Remote error: {0}")]
    RemoteError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),
}

/// Which channel an event arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Notify,
    Realtime,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Notify => "notify",
            TransportKind::Realtime => "realtime",
        }
    }
}

/// Events emitted by transport bridges
#[derive(Debug, Clone)]
pub enum NormalizedEvent {
    /// Progress notification carrying a checkpoint
    Checkpoint {
        source: TransportKind,
        envelope: WorkflowEnvelope,
    },

    /// Error payload reported by the intermediary
    Error {
        source: TransportKind,
        envelope: WorkflowEnvelope,
        message: String,
        fatal: bool,
    },

    /// The channel went away
    Closed {
        source: TransportKind,
        reason: String,
    },
}

/// Outgoing side of a transport bridge.
#[async_trait]
pub trait TransportBridge: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether outgoing traffic can currently be dispatched.
    fn is_connected(&self) -> bool;

    /// Ask the intermediary to start a workflow. Returns the backend id when
    /// the channel reports one synchronously.
    async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<Option<String>, ConnectorError>;

    async fn send_event(&self, event: WorkflowControlEvent) -> Result<(), ConnectorError>;

    async fn send_tool_approval(
        &self,
        response: ToolApprovalResponse,
    ) -> Result<(), ConnectorError>;
}

/// Runs local commands on behalf of the backend.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, request: CommandRequest) -> CommandResult;
}

/// Pull a human-readable message out of an error payload.
pub(crate) fn error_message(value: &serde_json::Value) -> String {
    ["message", "error", "errorMessage", "error_message"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .map(String::from)
        .unwrap_or_else(|| value.to_string())
}

/// Error payloads mark themselves fatal with either spelling.
pub(crate) fn error_is_fatal(value: &serde_json::Value) -> bool {
    ["fatal", "isFatal", "is_fatal"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_bool()))
        .unwrap_or(false)
}
