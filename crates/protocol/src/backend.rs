//! Intermediary-facing types: the loose inbound envelope and the outgoing
//! control events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Inbound progress notification.
///
/// The shape is loose on purpose: field names vary between intermediary
/// versions, so the envelope keeps the raw JSON object and lookups go
/// through ordered field-name lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowEnvelope {
    pub fields: Map<String, Value>,
}

/// Field-name variants carrying the session id, in lookup order.
pub const SESSION_ID_FIELDS: &[&str] =
    &["sessionId", "session_id", "workflowId", "workflow_id", "id"];

/// Field-name variants carrying the workflow goal, in lookup order.
pub const GOAL_FIELDS: &[&str] = &["goal", "workflowGoal", "workflow_goal"];

/// Field-name variants carrying the serialized checkpoint, in lookup order.
pub const CHECKPOINT_FIELDS: &[&str] = &["checkpoint", "workflowCheckpoint", "workflow_checkpoint"];

/// Field-name variants carrying accumulated errors, in lookup order.
pub const ERRORS_FIELDS: &[&str] = &["errors", "workflowErrors", "workflow_errors"];

impl WorkflowEnvelope {
    /// Wrap a JSON value. Non-object values produce an empty envelope.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// First non-empty string found under any of `names`. Numbers are
    /// accepted and rendered, since some backends send numeric ids.
    pub fn first_str(&self, names: &[&str]) -> Option<String> {
        names.iter().find_map(|name| match self.fields.get(*name)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.first_str(SESSION_ID_FIELDS)
    }

    pub fn goal(&self) -> Option<String> {
        self.first_str(GOAL_FIELDS)
    }

    /// The serialized checkpoint. An already-decoded object is re-serialized
    /// so the decoder sees one shape.
    pub fn checkpoint(&self) -> Option<String> {
        CHECKPOINT_FIELDS
            .iter()
            .find_map(|name| match self.fields.get(*name)? {
                Value::String(s) => Some(s.clone()),
                value @ Value::Object(_) => Some(value.to_string()),
                _ => None,
            })
    }

    pub fn errors(&self) -> Vec<String> {
        ERRORS_FIELDS
            .iter()
            .find_map(|name| self.fields.get(*name)?.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(obj) => obj
                            .get("message")
                            .and_then(Value::as_str)
                            .map(String::from),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Opaque project identity supplied by the host's discovery collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Start-session request sent to the intermediary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    pub goal: String,
    pub metadata: WorkflowMetadata,
    #[serde(default)]
    pub additional_context: Vec<Value>,
}

/// Kind of control event sent for an existing workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlEventType {
    Pause,
    Resume,
    Stop,
    Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowControlEvent {
    pub session_id: String,
    pub event_type: ControlEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolApprovalDecision {
    ApproveOnce,
    ApproveForSession,
    Reject,
}

/// Correlated answer to a tool-call approval request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolApprovalResponse {
    pub session_id: String,
    pub tool_name: String,
    pub decision: ToolApprovalDecision,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Backend request to run a local command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub exit_code: i32,
    pub output: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_reads_every_id_variant() {
        for field in SESSION_ID_FIELDS {
            let env = WorkflowEnvelope::from_value(json!({ field.to_string(): "wf-7" }));
            assert_eq!(env.session_id().as_deref(), Some("wf-7"), "field {field}");
        }
        let numeric = WorkflowEnvelope::from_value(json!({ "workflowId": 42 }));
        assert_eq!(numeric.session_id().as_deref(), Some("42"));
    }

    #[test]
    fn envelope_skips_blank_ids() {
        let env = WorkflowEnvelope::from_value(json!({ "sessionId": "  ", "workflow_id": "wf-2" }));
        assert_eq!(env.session_id().as_deref(), Some("wf-2"));
    }

    #[test]
    fn envelope_checkpoint_accepts_object() {
        let env = WorkflowEnvelope::from_value(json!({
            "checkpoint": { "channel_values": { "status": "RUNNING" } }
        }));
        let raw = env.checkpoint().expect("checkpoint");
        let parsed: Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(parsed["channel_values"]["status"], "RUNNING");
    }

    #[test]
    fn envelope_errors_accept_strings_and_objects() {
        let env = WorkflowEnvelope::from_value(json!({
            "errors": ["boom", { "message": "rate limited" }, 3]
        }));
        assert_eq!(env.errors(), vec!["boom".to_string(), "rate limited".to_string()]);
    }

    #[test]
    fn start_request_serializes_camel_case() {
        let req = StartWorkflowRequest {
            goal: "explain foo.py".into(),
            metadata: WorkflowMetadata {
                project_id: Some("12".into()),
                ..Default::default()
            },
            additional_context: vec![],
        };
        let value = serde_json::to_value(&req).expect("serialize");
        assert_eq!(value["metadata"]["projectId"], "12");
        assert!(value.get("additionalContext").is_some());
    }
}
