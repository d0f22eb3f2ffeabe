//! Interaction policy
//!
//! Decides when a session needs the user, builds the prompt, validates the
//! answer and encodes it for the transport. Delivery itself is async and
//! happens in the manager; this module only moves the session's prompt
//! through pending -> in flight -> cleared (or back to pending on failure).
//!
//! A delivered decision marks its request entry answered; only request
//! entries after the last answered one can raise a prompt. Prompts with no
//! request entry behind them (synthetic `input-`/`plan-` ids) are held back
//! by `awaiting_ack` until the status changes.

use serde_json::json;
use workflowdock_protocol::{
    ControlEventType, PromptDecision, PromptKind, PromptRequest, ToolApprovalDecision,
    ToolApprovalResponse, WorkflowControlEvent, WorkflowEvent, WorkflowStatus,
};

use crate::error::ManagerError;
use crate::session::{PendingPrompt, Session};

/// Outgoing answer, ready for a transport bridge
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    ToolApproval(ToolApprovalResponse),
    Message(WorkflowControlEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Prompt cleared, waiting for the backend to move on
    Delivered,
    /// Prompt is pending again so the user can retry
    Failed(ManagerError),
    /// The session moved on while the decision was in flight
    Stale,
}

struct Candidate {
    prompt_id: String,
    log_index: Option<usize>,
    tool_name: Option<String>,
    kind: PromptKind,
}

/// Most recent request entry after the last answered one
fn open_request(session: &Session) -> Option<(usize, &WorkflowEvent)> {
    let floor = session.answered_through();
    session
        .event_log()
        .get(floor..)?
        .iter()
        .enumerate()
        .rev()
        .find(|(_, e)| matches!(e, WorkflowEvent::Request { .. }))
        .map(|(offset, e)| (floor + offset, e))
}

fn candidate(session: &Session) -> Option<Candidate> {
    let (log_index, request_id, request_content, request_tool) = match open_request(session) {
        Some((
            index,
            WorkflowEvent::Request {
                correlation_id,
                content,
                tool,
                ..
            },
        )) => (
            Some(index),
            Some(correlation_id.clone()),
            Some(content.clone()),
            tool.clone(),
        ),
        _ => (None, None, None, None),
    };

    match session.status() {
        WorkflowStatus::ToolCallApprovalRequired => {
            // Without an open request entry there is nothing to correlate an
            // approval with; the next checkpoint usually carries it.
            let prompt_id = request_id?;
            let (tool_name, args) = request_tool
                .map(|t| (t.name, t.args))
                .unwrap_or_else(|| ("unknown".to_string(), serde_json::Value::Null));
            Some(Candidate {
                prompt_id,
                log_index,
                tool_name: Some(tool_name.clone()),
                kind: PromptKind::ToolApproval {
                    tool_name,
                    args,
                    message: request_content.unwrap_or_default(),
                },
            })
        }
        WorkflowStatus::InputRequired => {
            let question = request_content
                .or_else(|| {
                    session.event_log().iter().rev().find_map(|e| match e {
                        WorkflowEvent::Agent { content, .. } => Some(content.clone()),
                        _ => None,
                    })
                })
                .unwrap_or_else(|| session.goal().to_string());
            Some(Candidate {
                prompt_id: request_id.unwrap_or_else(|| format!("input-{}", session.id())),
                log_index,
                tool_name: None,
                kind: PromptKind::Input { question },
            })
        }
        WorkflowStatus::PlanApprovalRequired => Some(Candidate {
            prompt_id: request_id.unwrap_or_else(|| format!("plan-{}", session.id())),
            log_index,
            tool_name: None,
            kind: PromptKind::PlanApproval {
                steps: session.plan().to_vec(),
            },
        }),
        _ => None,
    }
}

/// Re-evaluate the session after an update. Returns a prompt to present,
/// if one is newly needed.
pub fn evaluate(session: &mut Session, status_changed: bool) -> Option<PromptRequest> {
    let status = session.status();

    if status_changed || !status.is_awaiting_interaction() {
        session.set_awaiting_ack(None);
    }

    if !status.is_awaiting_interaction() {
        if let Some(discarded) = session.take_pending_prompt() {
            tracing::debug!(
                component = "interaction",
                event = "interaction.prompt.discarded",
                session_id = %session.id(),
                prompt_id = %discarded.request.prompt_id,
                status = %status,
                "Session moved on; dropping pending prompt"
            );
        }
        return None;
    }

    let candidate = candidate(session)?;

    if let Some(pending) = session.pending_prompt() {
        let superseded = !pending.in_flight
            && pending.log_index.is_some()
            && candidate.log_index.is_some()
            && pending.request.prompt_id != candidate.prompt_id;
        if !superseded {
            return None;
        }
    }

    if session.awaiting_ack() == Some(candidate.prompt_id.as_str()) {
        return None;
    }

    let request = PromptRequest {
        session_id: session.id().to_string(),
        prompt_id: candidate.prompt_id,
        kind: candidate.kind,
    };
    session.set_pending_prompt(PendingPrompt {
        request: request.clone(),
        tool_name: candidate.tool_name,
        log_index: candidate.log_index,
        in_flight: false,
    });
    Some(request)
}

/// Validate a decision against the pending prompt and mark it in flight.
///
/// `Ok(None)` means there is nothing to send (empty input); the prompt stays
/// pending.
pub fn prepare_decision(
    session: &mut Session,
    prompt_id: &str,
    decision: PromptDecision,
) -> Result<Option<Delivery>, ManagerError> {
    let session_id = session.id().to_string();
    let pending = session
        .pending_prompt_mut()
        .ok_or_else(|| ManagerError::NoPendingPrompt(session_id.clone()))?;

    if pending.request.prompt_id != prompt_id {
        return Err(ManagerError::PromptMismatch {
            expected: pending.request.prompt_id.clone(),
            got: prompt_id.to_string(),
        });
    }
    if pending.in_flight {
        return Err(ManagerError::DecisionInFlight(prompt_id.to_string()));
    }

    let delivery = match (&pending.request.kind, decision) {
        (PromptKind::ToolApproval { tool_name, .. }, decision) => {
            let (decision, message) = match decision {
                PromptDecision::ApproveOnce => (ToolApprovalDecision::ApproveOnce, None),
                PromptDecision::ApproveForSession => {
                    (ToolApprovalDecision::ApproveForSession, None)
                }
                PromptDecision::Reject { message } => (ToolApprovalDecision::Reject, message),
                other => {
                    return Err(ManagerError::InvalidDecision(format!(
                        "{other:?} does not answer a tool approval"
                    )))
                }
            };
            Delivery::ToolApproval(ToolApprovalResponse {
                session_id,
                tool_name: pending.tool_name.clone().unwrap_or_else(|| tool_name.clone()),
                decision,
                correlation_id: prompt_id.to_string(),
                message,
            })
        }

        (PromptKind::Input { .. }, PromptDecision::Input { text }) => {
            if text.trim().is_empty() {
                return Ok(None);
            }
            Delivery::Message(WorkflowControlEvent {
                session_id,
                event_type: ControlEventType::Message,
                payload: Some(json!({ "message": text, "correlationId": prompt_id })),
            })
        }

        (PromptKind::PlanApproval { .. }, decision) => {
            let (verdict, message) = match decision {
                PromptDecision::ApprovePlan => ("approve", "approve".to_string()),
                PromptDecision::RejectPlan => ("reject", "reject".to_string()),
                PromptDecision::ModifyPlan { text } if !text.trim().is_empty() => ("modify", text),
                PromptDecision::ModifyPlan { .. } => {
                    return Err(ManagerError::InvalidDecision(
                        "plan modification needs instructions".into(),
                    ))
                }
                other => {
                    return Err(ManagerError::InvalidDecision(format!(
                        "{other:?} does not answer a plan approval"
                    )))
                }
            };
            Delivery::Message(WorkflowControlEvent {
                session_id,
                event_type: ControlEventType::Message,
                payload: Some(json!({
                    "message": message,
                    "decision": verdict,
                    "correlationId": prompt_id,
                })),
            })
        }

        (PromptKind::Input { .. }, other) => {
            return Err(ManagerError::InvalidDecision(format!(
                "{other:?} does not answer an input request"
            )))
        }
    };

    pending.in_flight = true;
    Ok(Some(delivery))
}

/// Record the outcome of an async delivery
pub fn complete_delivery(
    session: &mut Session,
    prompt_id: &str,
    result: Result<(), String>,
) -> DeliveryOutcome {
    let matches = session
        .pending_prompt()
        .is_some_and(|p| p.in_flight && p.request.prompt_id == prompt_id);
    if !matches {
        return DeliveryOutcome::Stale;
    }

    match result {
        Ok(()) => {
            if let Some(index) = session.take_pending_prompt().and_then(|p| p.log_index) {
                session.mark_answered(index);
            }
            session.set_awaiting_ack(Some(prompt_id.to_string()));
            DeliveryOutcome::Delivered
        }
        Err(reason) => {
            if let Some(pending) = session.pending_prompt_mut() {
                pending.in_flight = false;
            }
            DeliveryOutcome::Failed(ManagerError::PromptDeliveryFailure {
                prompt_id: prompt_id.to_string(),
                reason,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::DecodedCheckpoint;
    use crate::transition::{transition, Effect, Input};
    use workflowdock_protocol::{PlanStep, ToolInfo};

    fn request(id: &str, tool: Option<&str>) -> WorkflowEvent {
        WorkflowEvent::Request {
            content: format!("request {id}"),
            correlation_id: id.to_string(),
            tool: tool.map(|name| ToolInfo {
                name: name.to_string(),
                args: json!({ "program": "pytest" }),
            }),
            timestamp: None,
        }
    }

    /// Apply a checkpoint and return whether the status changed
    fn apply(
        session: &mut Session,
        digest: u64,
        status: WorkflowStatus,
        events: Vec<WorkflowEvent>,
        plan: Vec<PlanStep>,
    ) -> bool {
        let state = session.extract_state();
        let (state, effects) = transition(
            state,
            Input::Checkpoint {
                digest,
                checkpoint: DecodedCheckpoint {
                    status,
                    status_source: "envelope.status",
                    events,
                    errors: Vec::new(),
                    plan,
                },
            },
            1,
        );
        session.apply_state(state);
        effects.iter().any(Effect::is_status_change)
    }

    fn approval_session() -> (Session, PromptRequest) {
        let mut session = Session::new("wf-1".into(), "run tests".into());
        let changed = apply(
            &mut session,
            1,
            WorkflowStatus::ToolCallApprovalRequired,
            vec![request("c-1", Some("run_command"))],
            vec![],
        );
        let prompt = evaluate(&mut session, changed).expect("prompt");
        (session, prompt)
    }

    #[test]
    fn tool_approval_prompt_carries_tool_and_correlation() {
        let (session, prompt) = approval_session();
        assert_eq!(prompt.prompt_id, "c-1");
        match prompt.kind {
            PromptKind::ToolApproval {
                tool_name, args, ..
            } => {
                assert_eq!(tool_name, "run_command");
                assert_eq!(args["program"], "pytest");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.pending_prompt().is_some());
    }

    #[test]
    fn duplicate_approval_status_does_not_reprompt() {
        let (mut session, _) = approval_session();
        let changed = apply(
            &mut session,
            2,
            WorkflowStatus::ToolCallApprovalRequired,
            vec![request("c-1", Some("run_command"))],
            vec![],
        );
        assert!(!changed);
        assert!(evaluate(&mut session, changed).is_none());
    }

    #[test]
    fn delivered_decision_waits_for_ack() {
        let (mut session, prompt) = approval_session();

        let delivery =
            prepare_decision(&mut session, &prompt.prompt_id, PromptDecision::ApproveOnce)
                .expect("valid")
                .expect("delivery");
        match delivery {
            Delivery::ToolApproval(response) => {
                assert_eq!(response.correlation_id, "c-1");
                assert_eq!(response.tool_name, "run_command");
                assert_eq!(response.decision, ToolApprovalDecision::ApproveOnce);
            }
            other => panic!("unexpected {:?}", other),
        }
        // Prompt stays until the send completes
        assert!(session.pending_prompt().is_some());

        assert_eq!(
            complete_delivery(&mut session, "c-1", Ok(())),
            DeliveryOutcome::Delivered
        );
        assert!(session.pending_prompt().is_none());
        assert_eq!(session.awaiting_ack(), Some("c-1"));

        // Backend repeats the same request before moving on
        let changed = apply(
            &mut session,
            3,
            WorkflowStatus::ToolCallApprovalRequired,
            vec![request("c-1", Some("run_command"))],
            vec![],
        );
        assert!(evaluate(&mut session, changed).is_none());

        // Backend moves on, then asks again with the same id
        let changed = apply(
            &mut session,
            4,
            WorkflowStatus::Running,
            vec![request("c-1", Some("run_command"))],
            vec![],
        );
        assert!(evaluate(&mut session, changed).is_none());
        assert_eq!(session.awaiting_ack(), None);

        // Re-entering approval with only the answered entry asks nothing
        let changed = apply(
            &mut session,
            5,
            WorkflowStatus::ToolCallApprovalRequired,
            vec![request("c-1", Some("run_command"))],
            vec![],
        );
        assert!(changed);
        assert!(evaluate(&mut session, changed).is_none());

        // A fresh request entry with the same id is a new question
        let changed = apply(
            &mut session,
            6,
            WorkflowStatus::ToolCallApprovalRequired,
            vec![
                request("c-1", Some("run_command")),
                request("c-1", Some("run_command")),
            ],
            vec![],
        );
        let prompt = evaluate(&mut session, changed).expect("prompt");
        assert_eq!(prompt.prompt_id, "c-1");
        assert_eq!(session.pending_prompt().and_then(|p| p.log_index), Some(1));
    }

    #[test]
    fn answered_request_is_not_reused_for_input() {
        let (mut session, prompt) = approval_session();
        prepare_decision(&mut session, &prompt.prompt_id, PromptDecision::ApproveOnce)
            .expect("valid");
        complete_delivery(&mut session, "c-1", Ok(()));
        assert_eq!(session.answered_through(), 1);

        let changed = apply(
            &mut session,
            2,
            WorkflowStatus::Running,
            vec![request("c-1", Some("run_command"))],
            vec![],
        );
        assert!(evaluate(&mut session, changed).is_none());

        let changed = apply(
            &mut session,
            3,
            WorkflowStatus::InputRequired,
            vec![
                request("c-1", Some("run_command")),
                WorkflowEvent::Agent {
                    content: "Postgres or SQLite?".into(),
                    timestamp: None,
                },
            ],
            vec![],
        );
        let prompt = evaluate(&mut session, changed).expect("prompt");
        assert_eq!(prompt.prompt_id, "input-wf-1");
        assert_eq!(
            prompt.kind,
            PromptKind::Input {
                question: "Postgres or SQLite?".into()
            }
        );

        let delivery = prepare_decision(
            &mut session,
            "input-wf-1",
            PromptDecision::Input {
                text: "sqlite".into(),
            },
        )
        .expect("valid")
        .expect("delivery");
        match delivery {
            Delivery::Message(event) => {
                assert_eq!(event.payload.expect("payload")["correlationId"], "input-wf-1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn request_arriving_during_delivery_is_prompted_after_it() {
        let (mut session, prompt) = approval_session();
        prepare_decision(&mut session, &prompt.prompt_id, PromptDecision::ApproveOnce)
            .expect("valid");

        // c-2 shows up while the c-1 answer is on the wire
        let changed = apply(
            &mut session,
            2,
            WorkflowStatus::ToolCallApprovalRequired,
            vec![request("c-1", Some("run_command")), request("c-2", Some("write_file"))],
            vec![],
        );
        assert!(evaluate(&mut session, changed).is_none());

        complete_delivery(&mut session, "c-1", Ok(()));
        let prompt = evaluate(&mut session, false).expect("c-2 prompt");
        assert_eq!(prompt.prompt_id, "c-2");
    }

    #[test]
    fn failed_delivery_keeps_prompt_pending() {
        let (mut session, prompt) = approval_session();
        prepare_decision(&mut session, &prompt.prompt_id, PromptDecision::ApproveOnce)
            .expect("valid");

        // A second answer while the first is on the wire is refused
        assert_eq!(
            prepare_decision(&mut session, "c-1", PromptDecision::ApproveOnce),
            Err(ManagerError::DecisionInFlight("c-1".into()))
        );

        let outcome = complete_delivery(&mut session, "c-1", Err("socket closed".into()));
        assert!(matches!(
            outcome,
            DeliveryOutcome::Failed(ManagerError::PromptDeliveryFailure { .. })
        ));
        let pending = session.pending_prompt().expect("still pending");
        assert!(!pending.in_flight);
        assert!(prepare_decision(&mut session, "c-1", PromptDecision::ApproveOnce).is_ok());
    }

    #[test]
    fn terminal_status_discards_pending_prompt() {
        let (mut session, _) = approval_session();
        let changed = apply(&mut session, 2, WorkflowStatus::Stopped, vec![], vec![]);
        assert!(evaluate(&mut session, changed).is_none());
        assert!(session.pending_prompt().is_none());
        assert_eq!(
            complete_delivery(&mut session, "c-1", Ok(())),
            DeliveryOutcome::Stale
        );
    }

    #[test]
    fn newer_request_replaces_pending_prompt() {
        let (mut session, _) = approval_session();
        let changed = apply(
            &mut session,
            2,
            WorkflowStatus::ToolCallApprovalRequired,
            vec![request("c-1", Some("run_command")), request("c-2", Some("write_file"))],
            vec![],
        );
        let prompt = evaluate(&mut session, changed).expect("new prompt");
        assert_eq!(prompt.prompt_id, "c-2");
        assert_eq!(
            session.pending_prompt().map(|p| p.request.prompt_id.as_str()),
            Some("c-2")
        );
    }

    #[test]
    fn empty_input_sends_nothing() {
        let mut session = Session::new("wf-1".into(), "pick a db".into());
        let changed = apply(
            &mut session,
            1,
            WorkflowStatus::InputRequired,
            vec![WorkflowEvent::Agent {
                content: "Postgres or SQLite?".into(),
                timestamp: None,
            }],
            vec![],
        );
        let prompt = evaluate(&mut session, changed).expect("prompt");
        assert_eq!(
            prompt.kind,
            PromptKind::Input {
                question: "Postgres or SQLite?".into()
            }
        );

        let none = prepare_decision(
            &mut session,
            &prompt.prompt_id,
            PromptDecision::Input { text: "   ".into() },
        )
        .expect("valid");
        assert!(none.is_none());
        assert!(!session.pending_prompt().expect("pending").in_flight);

        let delivery = prepare_decision(
            &mut session,
            &prompt.prompt_id,
            PromptDecision::Input {
                text: "SQLite".into(),
            },
        )
        .expect("valid")
        .expect("delivery");
        match delivery {
            Delivery::Message(event) => {
                assert_eq!(event.event_type, ControlEventType::Message);
                assert_eq!(event.payload.expect("payload")["message"], "SQLite");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn plan_prompt_lists_steps_and_validates_decisions() {
        let mut session = Session::new("wf-1".into(), "refactor".into());
        let steps = vec![PlanStep {
            description: "Split module".into(),
            status: None,
        }];
        let changed = apply(
            &mut session,
            1,
            WorkflowStatus::PlanApprovalRequired,
            vec![],
            steps.clone(),
        );
        let prompt = evaluate(&mut session, changed).expect("prompt");
        assert_eq!(prompt.kind, PromptKind::PlanApproval { steps });

        assert!(matches!(
            prepare_decision(&mut session, &prompt.prompt_id, PromptDecision::ApproveOnce),
            Err(ManagerError::InvalidDecision(_))
        ));
        assert!(matches!(
            prepare_decision(
                &mut session,
                &prompt.prompt_id,
                PromptDecision::ModifyPlan { text: "".into() }
            ),
            Err(ManagerError::InvalidDecision(_))
        ));
        assert!(matches!(
            prepare_decision(&mut session, "other", PromptDecision::ApprovePlan),
            Err(ManagerError::PromptMismatch { .. })
        ));
        assert!(
            prepare_decision(&mut session, &prompt.prompt_id, PromptDecision::ApprovePlan)
                .expect("valid")
                .is_some()
        );
    }

    #[test]
    fn no_pending_prompt_is_an_error() {
        let mut session = Session::new("wf-1".into(), "g".into());
        assert_eq!(
            prepare_decision(&mut session, "c-1", PromptDecision::ApproveOnce),
            Err(ManagerError::NoPendingPrompt("wf-1".into()))
        );
    }
}
