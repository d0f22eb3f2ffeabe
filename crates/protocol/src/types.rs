//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Workflow status as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Created,
    Running,
    Paused,
    ToolCallApprovalRequired,
    InputRequired,
    PlanApprovalRequired,
    Finished,
    Failed,
    Stopped,
}

impl WorkflowStatus {
    /// Parse a status string as it appears on the wire. Case and
    /// separator insensitive; a few historical aliases are accepted.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        let status = match normalized.as_str() {
            "CREATED" | "STARTING" | "NOT_STARTED" => Self::Created,
            "RUNNING" | "PLANNING" | "EXECUTION" => Self::Running,
            "PAUSED" => Self::Paused,
            "TOOL_CALL_APPROVAL_REQUIRED" => Self::ToolCallApprovalRequired,
            "INPUT_REQUIRED" => Self::InputRequired,
            "PLAN_APPROVAL_REQUIRED" => Self::PlanApprovalRequired,
            "FINISHED" | "COMPLETED" => Self::Finished,
            "FAILED" => Self::Failed,
            "STOPPED" | "CANCELLED" | "CANCELED" => Self::Stopped,
            _ => return None,
        };
        Some(status)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::ToolCallApprovalRequired => "TOOL_CALL_APPROVAL_REQUIRED",
            Self::InputRequired => "INPUT_REQUIRED",
            Self::PlanApprovalRequired => "PLAN_APPROVAL_REQUIRED",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Stopped)
    }

    /// Statuses that block the workflow until the user decides something.
    pub fn is_awaiting_interaction(&self) -> bool {
        matches!(
            self,
            Self::ToolCallApprovalRequired | Self::InputRequired | Self::PlanApprovalRequired
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool descriptor attached to tool and request log entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// One entry of a session's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    User {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Agent {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Tool {
        content: String,
        tool: ToolInfo,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Request {
        content: String,
        correlation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<ToolInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
}

impl WorkflowEvent {
    pub fn content(&self) -> &str {
        match self {
            Self::User { content, .. }
            | Self::Agent { content, .. }
            | Self::Tool { content, .. }
            | Self::Request { content, .. } => content,
        }
    }

    pub fn timestamp(&self) -> Option<&str> {
        match self {
            Self::User { timestamp, .. }
            | Self::Agent { timestamp, .. }
            | Self::Tool { timestamp, .. }
            | Self::Request { timestamp, .. } => timestamp.as_deref(),
        }
    }
}

/// A single step of a proposed plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Message role as shown to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    Request,
}

/// A message added to the consumer-visible history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    /// Position of the source entry in the session's event log
    pub index: usize,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Why a session stopped streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Complete,
    Error,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopInfo {
    pub reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the user is being asked to decide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptKind {
    ToolApproval {
        tool_name: String,
        #[serde(default)]
        args: Value,
        message: String,
    },
    Input {
        question: String,
    },
    PlanApproval {
        steps: Vec<PlanStep>,
    },
}

/// A prompt presented to the user; `prompt_id` is the correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub session_id: String,
    pub prompt_id: String,
    pub kind: PromptKind,
}

/// A user's answer to a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PromptDecision {
    ApproveOnce,
    ApproveForSession,
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Input {
        text: String,
    },
    ApprovePlan,
    RejectPlan,
    ModifyPlan {
        text: String,
    },
}

/// Summary of a session for list views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub goal: String,
    pub status: WorkflowStatus,
    pub is_placeholder: bool,
    pub event_count: usize,
    pub delivered_count: usize,
    pub errors: Vec<String>,
    pub has_pending_prompt: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_accepts_case_and_aliases() {
        assert_eq!(
            WorkflowStatus::parse("tool_call_approval_required"),
            Some(WorkflowStatus::ToolCallApprovalRequired)
        );
        assert_eq!(
            WorkflowStatus::parse(" Input-Required "),
            Some(WorkflowStatus::InputRequired)
        );
        assert_eq!(
            WorkflowStatus::parse("COMPLETED"),
            Some(WorkflowStatus::Finished)
        );
        assert_eq!(WorkflowStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_and_awaiting_sets_are_disjoint() {
        let all = [
            WorkflowStatus::Created,
            WorkflowStatus::Running,
            WorkflowStatus::Paused,
            WorkflowStatus::ToolCallApprovalRequired,
            WorkflowStatus::InputRequired,
            WorkflowStatus::PlanApprovalRequired,
            WorkflowStatus::Finished,
            WorkflowStatus::Failed,
            WorkflowStatus::Stopped,
        ];
        for status in all {
            assert!(!(status.is_terminal() && status.is_awaiting_interaction()));
            assert_eq!(WorkflowStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn decision_uses_decision_tag() {
        let json = r#"{"decision":"reject","message":"not that file"}"#;
        let decision: PromptDecision = serde_json::from_str(json).expect("parse decision");
        assert_eq!(
            decision,
            PromptDecision::Reject {
                message: Some("not that file".to_string())
            }
        );

        let json = r#"{"decision":"approve_for_session"}"#;
        let decision: PromptDecision = serde_json::from_str(json).expect("parse decision");
        assert_eq!(decision, PromptDecision::ApproveForSession);
    }
}
