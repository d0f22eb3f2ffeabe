//! Checkpoint decoding
//!
//! Every progress notification carries a serialized checkpoint. The status
//! can live in several places depending on the intermediary version, and
//! more than one of them may be present with stale values, so lookups walk
//! a fixed priority list and the first recognized value wins.

use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use workflowdock_protocol::{
    PlanStep, ToolInfo, WorkflowEnvelope, WorkflowEvent, WorkflowStatus,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CheckpointDecodeError {
    #[error("checkpoint is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("checkpoint is not a JSON object")]
    NotAnObject,

    #[error("envelope carries neither a checkpoint nor a status")]
    Empty,
}

/// Structured view of one checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCheckpoint {
    pub status: WorkflowStatus,
    /// Name of the location the status came from, `"default"` when none matched
    pub status_source: &'static str,
    pub events: Vec<WorkflowEvent>,
    pub errors: Vec<String>,
    pub plan: Vec<PlanStep>,
}

type StatusAccessor = fn(&WorkflowEnvelope, &Value) -> Option<String>;

/// Status locations, highest priority first.
pub const STATUS_CHAIN: &[(&str, StatusAccessor)] = &[
    ("envelope.workflowStatus", envelope_camel_status),
    ("envelope.workflow_status", envelope_snake_status),
    ("envelope.status", envelope_generic_status),
    ("checkpoint.channel_values.status", channel_values_status),
    ("checkpoint.metadata.status", metadata_status),
];

fn as_status_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn envelope_camel_status(envelope: &WorkflowEnvelope, _: &Value) -> Option<String> {
    as_status_str(envelope.get("workflowStatus"))
}

fn envelope_snake_status(envelope: &WorkflowEnvelope, _: &Value) -> Option<String> {
    as_status_str(envelope.get("workflow_status"))
}

fn envelope_generic_status(envelope: &WorkflowEnvelope, _: &Value) -> Option<String> {
    as_status_str(envelope.get("status"))
}

fn channel_values_status(_: &WorkflowEnvelope, checkpoint: &Value) -> Option<String> {
    as_status_str(checkpoint.get("channel_values").and_then(|cv| cv.get("status")))
}

fn metadata_status(_: &WorkflowEnvelope, checkpoint: &Value) -> Option<String> {
    as_status_str(checkpoint.get("metadata").and_then(|m| m.get("status")))
}

/// Walk the status chain. Unrecognized values are skipped, not defaulted,
/// so a garbled high-priority field cannot mask a valid lower one.
pub fn resolve_status(
    envelope: &WorkflowEnvelope,
    checkpoint: &Value,
) -> (WorkflowStatus, &'static str) {
    for (source, accessor) in STATUS_CHAIN {
        let Some(raw) = accessor(envelope, checkpoint) else {
            continue;
        };
        match WorkflowStatus::parse(&raw) {
            Some(status) => return (status, source),
            None => warn!(
                component = "checkpoint",
                event = "checkpoint.status.unrecognized",
                source = %source,
                raw_status = %raw,
                "Skipping unrecognized status value"
            ),
        }
    }
    (WorkflowStatus::Running, "default")
}

/// Decode the checkpoint carried by `envelope`.
///
/// An envelope with a status but no checkpoint is a status-only update and
/// decodes to an empty event log.
pub fn decode(envelope: &WorkflowEnvelope) -> Result<DecodedCheckpoint, CheckpointDecodeError> {
    let checkpoint = match envelope.checkpoint() {
        Some(raw) if !raw.trim().is_empty() => {
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| CheckpointDecodeError::InvalidJson(e.to_string()))?;
            if !value.is_object() {
                return Err(CheckpointDecodeError::NotAnObject);
            }
            value
        }
        _ => {
            let has_status = STATUS_CHAIN[..3]
                .iter()
                .any(|(_, accessor)| accessor(envelope, &Value::Null).is_some());
            if !has_status {
                return Err(CheckpointDecodeError::Empty);
            }
            Value::Null
        }
    };

    let (status, status_source) = resolve_status(envelope, &checkpoint);

    Ok(DecodedCheckpoint {
        status,
        status_source,
        events: decode_event_log(&checkpoint),
        errors: envelope.errors(),
        plan: decode_plan(&checkpoint),
    })
}

/// Event records live in `channel_values.ui_chat_log`. Records with an
/// unknown type are dropped here, every time, so the filtered log stays
/// append-only.
pub fn decode_event_log(checkpoint: &Value) -> Vec<WorkflowEvent> {
    checkpoint
        .get("channel_values")
        .and_then(|cv| cv.get("ui_chat_log"))
        .and_then(Value::as_array)
        .map(|records| {
            records
                .iter()
                .enumerate()
                .filter_map(|(index, record)| decode_record(index, record))
                .collect()
        })
        .unwrap_or_default()
}

fn first_str(record: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| record.get(*name).and_then(Value::as_str))
        .map(String::from)
}

fn decode_tool(record: &Value) -> Option<ToolInfo> {
    let info = record.get("tool_info").or_else(|| record.get("toolInfo"))?;
    let name = first_str(info, &["name", "tool_name", "toolName"])?;
    let args = info
        .get("args")
        .or_else(|| info.get("arguments"))
        .cloned()
        .unwrap_or(Value::Null);
    Some(ToolInfo { name, args })
}

fn decode_record(index: usize, record: &Value) -> Option<WorkflowEvent> {
    let kind = first_str(record, &["message_type", "messageType", "type"])?;
    let content = first_str(record, &["content", "message", "text"]).unwrap_or_default();
    let timestamp = first_str(record, &["timestamp", "created_at", "createdAt"]);
    let tool = decode_tool(record);

    let event = match kind.to_ascii_lowercase().as_str() {
        "user" => WorkflowEvent::User { content, timestamp },
        "agent" | "assistant" => WorkflowEvent::Agent { content, timestamp },
        "tool" => WorkflowEvent::Tool {
            content,
            tool: tool.unwrap_or_else(|| ToolInfo {
                name: "unknown".to_string(),
                args: Value::Null,
            }),
            timestamp,
        },
        "request" => WorkflowEvent::Request {
            content,
            correlation_id: first_str(record, &["correlation_id", "correlationId"])
                .unwrap_or_else(|| format!("request-{index}")),
            tool,
            timestamp,
        },
        other => {
            warn!(
                component = "checkpoint",
                event = "checkpoint.record.unknown_type",
                record_type = %other,
                index,
                "Skipping event record of unknown type"
            );
            return None;
        }
    };
    Some(event)
}

fn decode_plan(checkpoint: &Value) -> Vec<PlanStep> {
    checkpoint
        .get("channel_values")
        .and_then(|cv| cv.get("plan"))
        .and_then(|plan| plan.get("steps"))
        .and_then(Value::as_array)
        .map(|steps| {
            steps
                .iter()
                .filter_map(|step| {
                    let description = match step {
                        Value::String(s) => s.clone(),
                        _ => first_str(step, &["description", "title", "content"])?,
                    };
                    Some(PlanStep {
                        description,
                        status: first_str(step, &["status"]),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
