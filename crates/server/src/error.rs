//! Error taxonomy for the session manager.

use thiserror::Error;

use crate::checkpoint::CheckpointDecodeError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManagerError {
    #[error("no transport channel is available")]
    TransportUnavailable,

    #[error("checkpoint decode failed: {0}")]
    CheckpointDecode(#[from] CheckpointDecodeError),

    #[error("event could not be routed to a session: {reason}")]
    UnresolvedSession { reason: String },

    #[error("decision for prompt {prompt_id} was not delivered: {reason}")]
    PromptDeliveryFailure { prompt_id: String, reason: String },

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("session {0} has no pending prompt")]
    NoPendingPrompt(String),

    #[error("prompt {got} does not match the pending prompt {expected}")]
    PromptMismatch { expected: String, got: String },

    #[error("a decision for prompt {0} is already being delivered")]
    DecisionInFlight(String),

    #[error("decision does not fit the prompt: {0}")]
    InvalidDecision(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session {0} is still active")]
    SessionActive(String),

    #[error("session {0} has not been confirmed by the backend yet")]
    NotConfirmed(String),

    #[error("session id {0} is already tracked")]
    DuplicateSession(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session manager is not running")]
    ManagerClosed,
}

impl ManagerError {
    /// Stable code sent to editor clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            ManagerError::TransportUnavailable => "transport_unavailable",
            ManagerError::CheckpointDecode(_) => "checkpoint_decode_error",
            ManagerError::UnresolvedSession { .. } => "unresolved_session",
            ManagerError::PromptDeliveryFailure { .. } => "prompt_delivery_failure",
            ManagerError::UnknownSession(_) => "unknown_session",
            ManagerError::NoPendingPrompt(_) => "no_pending_prompt",
            ManagerError::PromptMismatch { .. } => "prompt_mismatch",
            ManagerError::DecisionInFlight(_) => "decision_in_flight",
            ManagerError::InvalidDecision(_) => "invalid_decision",
            ManagerError::InvalidRequest(_) => "invalid_request",
            ManagerError::SessionActive(_) => "session_active",
            ManagerError::NotConfirmed(_) => "not_confirmed",
            ManagerError::DuplicateSession(_) => "duplicate_session",
            ManagerError::Transport(_) => "transport_error",
            ManagerError::ManagerClosed => "manager_closed",
        }
    }
}
