//! Pure state transition function
//!
//! Every change to a session's status, event log, errors and plan goes
//! through `transition(state, input, now) -> (state, effects)`. No IO, no
//! async, no locking. The caller moves the result back into the session and
//! acts on the effects.

use workflowdock_protocol::{PlanStep, WorkflowEvent, WorkflowStatus};

use crate::checkpoint::DecodedCheckpoint;

// ---------------------------------------------------------------------------
// TransitionState: the mutable slice of a session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionState {
    pub id: String,
    pub status: WorkflowStatus,
    pub event_log: Vec<WorkflowEvent>,
    pub errors: Vec<String>,
    pub plan: Vec<PlanStep>,
    pub last_checkpoint_digest: Option<u64>,
    pub updated_at: u64,
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    /// A decoded checkpoint plus the digest of the envelope it came in
    Checkpoint {
        digest: u64,
        checkpoint: DecodedCheckpoint,
    },
    /// Error payload from the intermediary
    Error { message: String, fatal: bool },
    /// Status decided locally (stop, failed dispatch, idle expiry)
    SetStatus {
        status: WorkflowStatus,
        error: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StatusChanged {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    EventsAppended {
        from_index: usize,
        count: usize,
    },
    ErrorRecorded(String),
    PlanUpdated,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Session already reached FINISHED, FAILED or STOPPED
    Terminal,
    /// Same envelope as the last one applied
    DuplicateCheckpoint,
}

impl Effect {
    pub fn is_status_change(&self) -> bool {
        matches!(self, Effect::StatusChanged { .. })
    }
}

/// Whether `reported` may replace `current`. Terminal statuses are sticky and
/// a session never goes back to CREATED once it has moved on.
pub fn accepts_status(current: WorkflowStatus, reported: WorkflowStatus) -> bool {
    if current == reported || current.is_terminal() {
        return false;
    }
    !(reported == WorkflowStatus::Created && current != WorkflowStatus::Created)
}

/// Pure, synchronous state transition.
pub fn transition(
    mut state: TransitionState,
    input: Input,
    now: u64,
) -> (TransitionState, Vec<Effect>) {
    if state.status.is_terminal() {
        return (state, vec![Effect::Ignored(IgnoreReason::Terminal)]);
    }

    let mut effects: Vec<Effect> = Vec::new();

    match input {
        Input::Checkpoint { digest, checkpoint } => {
            if state.last_checkpoint_digest == Some(digest) {
                return (state, vec![Effect::Ignored(IgnoreReason::DuplicateCheckpoint)]);
            }
            state.last_checkpoint_digest = Some(digest);

            // The backend always sends the whole log; only the suffix is new.
            let from_index = state.event_log.len();
            if checkpoint.events.len() > from_index {
                let count = checkpoint.events.len() - from_index;
                state
                    .event_log
                    .extend(checkpoint.events.into_iter().skip(from_index));
                effects.push(Effect::EventsAppended { from_index, count });
            }

            for message in checkpoint.errors {
                record_error(&mut state, message, &mut effects);
            }

            if !checkpoint.plan.is_empty() && checkpoint.plan != state.plan {
                state.plan = checkpoint.plan;
                effects.push(Effect::PlanUpdated);
            }

            set_status(&mut state, checkpoint.status, &mut effects);
        }

        Input::Error { message, fatal } => {
            record_error(&mut state, message, &mut effects);
            if fatal {
                set_status(&mut state, WorkflowStatus::Failed, &mut effects);
            }
        }

        Input::SetStatus { status, error } => {
            if let Some(message) = error {
                record_error(&mut state, message, &mut effects);
            }
            set_status(&mut state, status, &mut effects);
        }
    }

    if !effects.is_empty() {
        state.updated_at = now;
    }
    (state, effects)
}

fn set_status(state: &mut TransitionState, status: WorkflowStatus, effects: &mut Vec<Effect>) {
    if accepts_status(state.status, status) {
        effects.push(Effect::StatusChanged {
            from: state.status,
            to: status,
        });
        state.status = status;
    }
}

fn record_error(state: &mut TransitionState, message: String, effects: &mut Vec<Effect>) {
    let message = message.trim().to_string();
    if message.is_empty() || state.errors.contains(&message) {
        return;
    }
    state.errors.push(message.clone());
    effects.push(Effect::ErrorRecorded(message));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> TransitionState {
        TransitionState {
            id: "wf-1".to_string(),
            status: WorkflowStatus::Created,
            event_log: Vec::new(),
            errors: Vec::new(),
            plan: Vec::new(),
            last_checkpoint_digest: None,
            updated_at: 0,
        }
    }

    fn agent(content: &str) -> WorkflowEvent {
        WorkflowEvent::Agent {
            content: content.to_string(),
            timestamp: None,
        }
    }

    fn checkpoint(status: WorkflowStatus, events: Vec<WorkflowEvent>) -> DecodedCheckpoint {
        DecodedCheckpoint {
            status,
            status_source: "envelope.status",
            events,
            errors: Vec::new(),
            plan: Vec::new(),
        }
    }

    const NOW: u64 = 1_000;

    #[test]
    fn checkpoint_appends_suffix_and_moves_status() {
        let (state, effects) = transition(
            test_state(),
            Input::Checkpoint {
                digest: 1,
                checkpoint: checkpoint(WorkflowStatus::Running, vec![agent("a")]),
            },
            NOW,
        );
        assert_eq!(state.event_log.len(), 1);
        assert_eq!(state.status, WorkflowStatus::Running);
        assert_eq!(state.updated_at, NOW);
        assert_eq!(
            effects,
            vec![
                Effect::EventsAppended {
                    from_index: 0,
                    count: 1
                },
                Effect::StatusChanged {
                    from: WorkflowStatus::Created,
                    to: WorkflowStatus::Running
                },
            ]
        );

        let (state, effects) = transition(
            state,
            Input::Checkpoint {
                digest: 2,
                checkpoint: checkpoint(
                    WorkflowStatus::Running,
                    vec![agent("a"), agent("b"), agent("c")],
                ),
            },
            NOW + 1,
        );
        assert_eq!(state.event_log, vec![agent("a"), agent("b"), agent("c")]);
        assert_eq!(
            effects,
            vec![Effect::EventsAppended {
                from_index: 1,
                count: 2
            }]
        );
    }

    #[test]
    fn shorter_log_appends_nothing() {
        let mut state = test_state();
        state.event_log = vec![agent("a"), agent("b")];
        state.status = WorkflowStatus::Running;

        let (state, effects) = transition(
            state,
            Input::Checkpoint {
                digest: 9,
                checkpoint: checkpoint(WorkflowStatus::Running, vec![agent("a")]),
            },
            NOW,
        );
        assert_eq!(state.event_log.len(), 2);
        assert!(effects.is_empty());
    }

    #[test]
    fn duplicate_digest_is_ignored() {
        let mut state = test_state();
        state.last_checkpoint_digest = Some(7);
        let (state, effects) = transition(
            state,
            Input::Checkpoint {
                digest: 7,
                checkpoint: checkpoint(WorkflowStatus::Finished, vec![agent("a")]),
            },
            NOW,
        );
        assert_eq!(state.status, WorkflowStatus::Created);
        assert_eq!(
            effects,
            vec![Effect::Ignored(IgnoreReason::DuplicateCheckpoint)]
        );
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut state = test_state();
        state.status = WorkflowStatus::Finished;

        let (state, effects) = transition(
            state,
            Input::Checkpoint {
                digest: 3,
                checkpoint: checkpoint(WorkflowStatus::Running, vec![agent("late")]),
            },
            NOW,
        );
        assert_eq!(state.status, WorkflowStatus::Finished);
        assert!(state.event_log.is_empty());
        assert_eq!(effects, vec![Effect::Ignored(IgnoreReason::Terminal)]);
    }

    #[test]
    fn never_returns_to_created() {
        assert!(!accepts_status(WorkflowStatus::Running, WorkflowStatus::Created));
        assert!(accepts_status(
            WorkflowStatus::ToolCallApprovalRequired,
            WorkflowStatus::Running
        ));
        assert!(accepts_status(WorkflowStatus::Paused, WorkflowStatus::Finished));
        assert!(!accepts_status(WorkflowStatus::Failed, WorkflowStatus::Finished));
    }

    #[test]
    fn errors_are_deduplicated() {
        let mut cp = checkpoint(WorkflowStatus::Running, vec![]);
        cp.errors = vec!["quota exceeded".into(), "quota exceeded".into()];
        let (state, effects) = transition(
            test_state(),
            Input::Checkpoint {
                digest: 1,
                checkpoint: cp,
            },
            NOW,
        );
        assert_eq!(state.errors, vec!["quota exceeded".to_string()]);
        assert_eq!(
            effects
                .iter()
                .filter(|e| matches!(e, Effect::ErrorRecorded(_)))
                .count(),
            1
        );
    }

    #[test]
    fn fatal_error_fails_session() {
        let mut state = test_state();
        state.status = WorkflowStatus::Running;
        let (state, effects) = transition(
            state,
            Input::Error {
                message: "backend crashed".into(),
                fatal: true,
            },
            NOW,
        );
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(effects.iter().any(Effect::is_status_change));

        let mut soft = test_state();
        soft.status = WorkflowStatus::Running;
        let (soft, _) = transition(
            soft,
            Input::Error {
                message: "retrying".into(),
                fatal: false,
            },
            NOW,
        );
        assert_eq!(soft.status, WorkflowStatus::Running);
        assert_eq!(soft.errors, vec!["retrying".to_string()]);
    }

    #[test]
    fn plan_updates_only_when_changed() {
        let step = PlanStep {
            description: "Read foo.py".into(),
            status: None,
        };
        let mut cp = checkpoint(WorkflowStatus::Running, vec![]);
        cp.plan = vec![step.clone()];
        let (state, effects) = transition(
            test_state(),
            Input::Checkpoint {
                digest: 1,
                checkpoint: cp.clone(),
            },
            NOW,
        );
        assert!(effects.contains(&Effect::PlanUpdated));

        let (_, effects) = transition(
            state,
            Input::Checkpoint {
                digest: 2,
                checkpoint: cp,
            },
            NOW,
        );
        assert!(!effects.contains(&Effect::PlanUpdated));
    }

    #[test]
    fn local_stop_records_status() {
        let mut state = test_state();
        state.status = WorkflowStatus::InputRequired;
        let (state, effects) = transition(
            state,
            Input::SetStatus {
                status: WorkflowStatus::Stopped,
                error: None,
            },
            NOW,
        );
        assert_eq!(state.status, WorkflowStatus::Stopped);
        assert_eq!(
            effects,
            vec![Effect::StatusChanged {
                from: WorkflowStatus::InputRequired,
                to: WorkflowStatus::Stopped
            }]
        );
    }
}
