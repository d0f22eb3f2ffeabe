//! Response streaming
//!
//! Turns newly appended event-log entries into consumer callbacks. Each
//! session keeps a cursor of how much of its log has been delivered; a
//! drain emits everything past it and moves it to the end. Draining twice
//! without new entries emits nothing.

use workflowdock_protocol::{
    ChatMessage, MessageRole, StopInfo, StopReason, WorkflowEvent, WorkflowStatus,
};

use crate::consumer::StreamConsumer;
use crate::session::Session;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries that produced a message
    pub emitted: usize,
    /// Whether this drain delivered the stop signal
    pub stopped: bool,
}

/// Deliver undelivered entries, then the stop signal if the session just
/// became terminal.
pub fn drain(session: &mut Session, consumer: &dyn StreamConsumer) -> DrainReport {
    let mut report = DrainReport::default();
    let start = session.cursor();
    let end = session.event_log().len();

    for (offset, event) in session.undelivered().iter().enumerate() {
        if let Some(message) = to_message(session.id(), start + offset, event) {
            if message.role == MessageRole::Assistant {
                consumer.on_chunk(session.id(), &message.content);
            }
            consumer.on_message_add(&message);
            report.emitted += 1;
        }
    }
    session.advance_cursor(end);

    if let Some(stop) = stop_info(session) {
        consumer.on_stop(session.id(), &stop);
        session.mark_stop_emitted();
        report.stopped = true;
    }

    tracing::debug!(
        component = "streamer",
        event = "streamer.drained",
        session_id = %session.id(),
        from = start,
        to = end,
        emitted = report.emitted,
        stopped = report.stopped,
    );
    report
}

fn stop_info(session: &Session) -> Option<StopInfo> {
    if session.stop_emitted() {
        return None;
    }
    let stop = match session.status() {
        WorkflowStatus::Finished => StopInfo {
            reason: StopReason::Complete,
            error: None,
        },
        WorkflowStatus::Failed => StopInfo {
            reason: StopReason::Error,
            error: Some(
                session
                    .errors()
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "workflow failed".to_string()),
            ),
        },
        WorkflowStatus::Stopped => StopInfo {
            reason: StopReason::Stopped,
            error: None,
        },
        _ => return None,
    };
    Some(stop)
}

/// User entries echo what the user already typed and are not re-emitted.
fn to_message(session_id: &str, index: usize, event: &WorkflowEvent) -> Option<ChatMessage> {
    let (role, content, tool_name) = match event {
        WorkflowEvent::User { .. } => return None,
        WorkflowEvent::Agent { content, .. } => (MessageRole::Assistant, content.clone(), None),
        WorkflowEvent::Tool { content, tool, .. } => (
            MessageRole::Tool,
            format_tool_notice(&tool.name, content),
            Some(tool.name.clone()),
        ),
        WorkflowEvent::Request { content, tool, .. } => {
            let tool_name = tool.as_ref().map(|t| t.name.clone());
            let text = match &tool_name {
                Some(name) => format!("Approval required for `{name}`: {content}"),
                None => format!("Input requested: {content}"),
            };
            (MessageRole::Request, text, tool_name)
        }
    };

    Some(ChatMessage {
        id: format!("{session_id}:{index}"),
        session_id: session_id.to_string(),
        index,
        role,
        content,
        tool_name,
        timestamp: event.timestamp().map(String::from),
    })
}

fn format_tool_notice(name: &str, content: &str) -> String {
    if content.trim().is_empty() {
        format!("Using tool `{name}`")
    } else {
        format!("Using tool `{name}`: {content}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use workflowdock_protocol::ToolInfo;

    use crate::checkpoint::DecodedCheckpoint;
    use crate::consumer::testing::RecordingConsumer;
    use crate::transition::{transition, Input};

    fn push_checkpoint(
        session: &mut Session,
        digest: u64,
        status: WorkflowStatus,
        events: Vec<WorkflowEvent>,
    ) {
        let state = session.extract_state();
        let (state, _) = transition(
            state,
            Input::Checkpoint {
                digest,
                checkpoint: DecodedCheckpoint {
                    status,
                    status_source: "envelope.status",
                    events,
                    errors: Vec::new(),
                    plan: Vec::new(),
                },
            },
            1,
        );
        session.apply_state(state);
    }

    fn explain_log() -> Vec<WorkflowEvent> {
        vec![
            WorkflowEvent::User {
                content: "explain foo.py".into(),
                timestamp: None,
            },
            WorkflowEvent::Tool {
                content: "Read foo.py".into(),
                tool: ToolInfo {
                    name: "read_file".into(),
                    args: json!({ "path": "foo.py" }),
                },
                timestamp: None,
            },
            WorkflowEvent::Agent {
                content: "foo.py defines a CLI".into(),
                timestamp: Some("t3".into()),
            },
        ]
    }

    #[test]
    fn explain_scenario_streams_once_and_stops_once() {
        let consumer = RecordingConsumer::default();
        let mut session = Session::new("wf-1".into(), "explain foo.py".into());

        push_checkpoint(&mut session, 1, WorkflowStatus::Running, explain_log()[..2].to_vec());
        let report = drain(&mut session, &consumer);
        assert_eq!(report.emitted, 1);
        assert!(!report.stopped);

        push_checkpoint(&mut session, 2, WorkflowStatus::Finished, explain_log());
        drain(&mut session, &consumer);

        // Duplicate FINISHED arrives again
        push_checkpoint(&mut session, 3, WorkflowStatus::Finished, explain_log());
        let report = drain(&mut session, &consumer);
        assert_eq!(report, DrainReport::default());

        assert_eq!(consumer.chunks(), vec!["foo.py defines a CLI".to_string()]);
        let messages = consumer.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::Tool);
        assert_eq!(messages[0].content, "Using tool `read_file`: Read foo.py");
        assert_eq!(messages[0].index, 1);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].timestamp.as_deref(), Some("t3"));

        assert_eq!(
            consumer.stops(),
            vec![StopInfo {
                reason: StopReason::Complete,
                error: None
            }]
        );
        assert_eq!(session.cursor(), 3);
    }

    #[test]
    fn drain_without_new_entries_is_a_noop() {
        let consumer = RecordingConsumer::default();
        let mut session = Session::new("wf-1".into(), "g".into());
        push_checkpoint(&mut session, 1, WorkflowStatus::Running, explain_log());

        drain(&mut session, &consumer);
        let before = consumer.calls().len();
        drain(&mut session, &consumer);
        assert_eq!(consumer.calls().len(), before);
    }

    #[test]
    fn failure_reports_last_error() {
        let consumer = RecordingConsumer::default();
        let mut session = Session::new("wf-1".into(), "g".into());
        let state = session.extract_state();
        let (state, _) = transition(
            state,
            Input::Error {
                message: "quota exceeded".into(),
                fatal: true,
            },
            1,
        );
        session.apply_state(state);

        assert!(drain(&mut session, &consumer).stopped);
        assert_eq!(
            consumer.stops(),
            vec![StopInfo {
                reason: StopReason::Error,
                error: Some("quota exceeded".into())
            }]
        );
    }

    #[test]
    fn request_entries_are_announced() {
        let consumer = RecordingConsumer::default();
        let mut session = Session::new("wf-1".into(), "g".into());
        push_checkpoint(
            &mut session,
            1,
            WorkflowStatus::ToolCallApprovalRequired,
            vec![WorkflowEvent::Request {
                content: "pytest -q".into(),
                correlation_id: "c-1".into(),
                tool: Some(ToolInfo {
                    name: "run_command".into(),
                    args: json!({}),
                }),
                timestamp: None,
            }],
        );
        drain(&mut session, &consumer);
        let messages = consumer.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Request);
        assert_eq!(messages[0].tool_name.as_deref(), Some("run_command"));
        assert!(consumer.chunks().is_empty());
    }
}
