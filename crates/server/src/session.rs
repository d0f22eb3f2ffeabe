//! Session management

use std::time::{SystemTime, UNIX_EPOCH};

use workflowdock_protocol::{
    is_placeholder_id, PlanStep, PromptRequest, SessionSummary, WorkflowEvent, WorkflowStatus,
};

use crate::transition::TransitionState;

/// Prompt currently shown to the user for a session
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPrompt {
    pub request: PromptRequest,
    /// Tool the approval refers to, echoed back in the approval response
    pub tool_name: Option<String>,
    /// Log position of the request entry this prompt answers, if any
    pub log_index: Option<usize>,
    /// A decision is being delivered and the prompt must not be answered twice
    pub in_flight: bool,
}

/// One tracked workflow run
#[derive(Debug)]
pub struct Session {
    id: String,
    goal: String,
    status: WorkflowStatus,
    event_log: Vec<WorkflowEvent>,
    cursor: usize,
    errors: Vec<String>,
    plan: Vec<PlanStep>,
    pending_prompt: Option<PendingPrompt>,
    awaiting_ack: Option<String>,
    /// Request entries below this log index have been answered
    answered_through: usize,
    stop_emitted: bool,
    last_checkpoint_digest: Option<u64>,
    created_at: u64,
    updated_at: u64,
}

impl Session {
    /// Create a new session in CREATED status
    pub fn new(id: String, goal: String) -> Self {
        let now = now_secs();
        Self {
            id,
            goal,
            status: WorkflowStatus::Created,
            event_log: Vec::new(),
            cursor: 0,
            errors: Vec::new(),
            plan: Vec::new(),
            pending_prompt: None,
            awaiting_ack: None,
            answered_through: 0,
            stop_emitted: false,
            last_checkpoint_digest: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn is_placeholder(&self) -> bool {
        is_placeholder_id(&self.id)
    }

    pub fn event_log(&self) -> &[WorkflowEvent] {
        &self.event_log
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Entries appended since the last drain
    pub fn undelivered(&self) -> &[WorkflowEvent] {
        &self.event_log[self.cursor.min(self.event_log.len())..]
    }

    /// Move the delivery cursor forward. Never moves backwards or past the log.
    pub fn advance_cursor(&mut self, to: usize) {
        self.cursor = self.cursor.max(to.min(self.event_log.len()));
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn plan(&self) -> &[PlanStep] {
        &self.plan
    }

    pub fn pending_prompt(&self) -> Option<&PendingPrompt> {
        self.pending_prompt.as_ref()
    }

    pub fn pending_prompt_mut(&mut self) -> Option<&mut PendingPrompt> {
        self.pending_prompt.as_mut()
    }

    pub fn set_pending_prompt(&mut self, prompt: PendingPrompt) {
        self.pending_prompt = Some(prompt);
    }

    pub fn take_pending_prompt(&mut self) -> Option<PendingPrompt> {
        self.pending_prompt.take()
    }

    pub fn awaiting_ack(&self) -> Option<&str> {
        self.awaiting_ack.as_deref()
    }

    pub fn set_awaiting_ack(&mut self, correlation_id: Option<String>) {
        self.awaiting_ack = correlation_id;
    }

    pub fn answered_through(&self) -> usize {
        self.answered_through
    }

    /// Record that the request entry at `index` was answered. Never moves back.
    pub fn mark_answered(&mut self, index: usize) {
        self.answered_through = self.answered_through.max(index + 1);
    }

    pub fn stop_emitted(&self) -> bool {
        self.stop_emitted
    }

    pub fn mark_stop_emitted(&mut self) {
        self.stop_emitted = true;
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    /// Swap in the backend-assigned id, carrying everything else over
    pub fn rekey(&mut self, id: String) {
        if let Some(pending) = self.pending_prompt.as_mut() {
            pending.request.session_id = id.clone();
        }
        self.id = id;
        self.updated_at = now_secs();
    }

    /// Get a summary of this session
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            goal: self.goal.clone(),
            status: self.status,
            is_placeholder: self.is_placeholder(),
            event_count: self.event_log.len(),
            delivered_count: self.cursor,
            errors: self.errors.clone(),
            has_pending_prompt: self.pending_prompt.is_some(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Move the mutable parts out for a transition. Must be paired with
    /// [`Session::apply_state`].
    pub fn extract_state(&mut self) -> TransitionState {
        TransitionState {
            id: self.id.clone(),
            status: self.status,
            event_log: std::mem::take(&mut self.event_log),
            errors: std::mem::take(&mut self.errors),
            plan: std::mem::take(&mut self.plan),
            last_checkpoint_digest: self.last_checkpoint_digest,
            updated_at: self.updated_at,
        }
    }

    pub fn apply_state(&mut self, state: TransitionState) {
        self.status = state.status;
        self.event_log = state.event_log;
        self.errors = state.errors;
        self.plan = state.plan;
        self.last_checkpoint_digest = state.last_checkpoint_digest;
        self.updated_at = state.updated_at;
        self.cursor = self.cursor.min(self.event_log.len());
    }
}

/// Current time as unix seconds
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflowdock_protocol::{new_placeholder_id, PromptKind};

    #[test]
    fn new_session_starts_created_with_empty_log() {
        let session = Session::new(new_placeholder_id(), "explain foo.py".into());
        assert_eq!(session.status(), WorkflowStatus::Created);
        assert!(session.is_placeholder());
        assert!(session.undelivered().is_empty());
        assert_eq!(session.summary().goal, "explain foo.py");
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut session = Session::new("wf-1".into(), "g".into());
        let mut state = session.extract_state();
        state.event_log.push(WorkflowEvent::Agent {
            content: "a".into(),
            timestamp: None,
        });
        state.event_log.push(WorkflowEvent::Agent {
            content: "b".into(),
            timestamp: None,
        });
        session.apply_state(state);

        session.advance_cursor(2);
        session.advance_cursor(1);
        assert_eq!(session.cursor(), 2);
        session.advance_cursor(10);
        assert_eq!(session.cursor(), 2);
    }

    #[test]
    fn rekey_updates_pending_prompt_owner() {
        let mut session = Session::new(new_placeholder_id(), "g".into());
        session.set_pending_prompt(PendingPrompt {
            request: PromptRequest {
                session_id: session.id().to_string(),
                prompt_id: "c-1".into(),
                kind: PromptKind::Input {
                    question: "which?".into(),
                },
            },
            tool_name: None,
            log_index: Some(0),
            in_flight: false,
        });

        session.rekey("wf-42".into());
        assert_eq!(session.id(), "wf-42");
        assert!(!session.is_placeholder());
        assert_eq!(
            session.pending_prompt().map(|p| p.request.session_id.as_str()),
            Some("wf-42")
        );
    }
}
