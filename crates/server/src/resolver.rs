//! Session resolution for incoming events
//!
//! Maps an envelope to the session it belongs to. Strategies run in a
//! fixed order and the first one that matches wins:
//!
//! 1. explicit id field (`sessionId`, `workflowId`, ...) naming a tracked session
//! 2. goal text naming a tracked session
//! 3. the only non-terminal session, when exactly one exists
//!
//! When the envelope carries an id we do not know and a fallback lands on a
//! placeholder session, the placeholder is re-keyed to that id.

use workflowdock_protocol::{is_placeholder_id, WorkflowEnvelope};

use crate::error::ManagerError;
use crate::state::SessionStore;

/// Where an event belongs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Tracked(String),
    /// The placeholder session owns the event and learns its backend id
    Rekey {
        placeholder: String,
        backend_id: String,
    },
}

impl Resolution {
    /// Id the session is tracked under once the resolution is applied
    pub fn session_id(&self) -> &str {
        match self {
            Resolution::Tracked(id) => id,
            Resolution::Rekey { backend_id, .. } => backend_id,
        }
    }
}

type Strategy = fn(&SessionStore, &Hints) -> Option<String>;

struct Hints {
    session_id: Option<String>,
    goal: Option<String>,
}

const STRATEGIES: &[(&str, Strategy)] = &[
    ("explicit_id", by_explicit_id),
    ("goal", by_goal),
    ("single_active", by_single_active),
];

fn by_explicit_id(store: &SessionStore, hints: &Hints) -> Option<String> {
    let id = hints.session_id.as_deref()?;
    store.contains(id).then(|| id.to_string())
}

/// Among sessions sharing the goal, non-terminal ones beat terminal ones,
/// then the most recently created wins.
fn by_goal(store: &SessionStore, hints: &Hints) -> Option<String> {
    let goal = hints.goal.as_deref()?;
    store
        .sessions()
        .filter(|s| s.goal().trim() == goal)
        .max_by_key(|s| (!s.status().is_terminal(), store.seq(s.id()).unwrap_or(0)))
        .map(|s| s.id().to_string())
}

fn by_single_active(store: &SessionStore, _: &Hints) -> Option<String> {
    let mut active = store.active();
    let only = active.next()?;
    if active.next().is_some() {
        return None;
    }
    Some(only.id().to_string())
}

/// Resolve `envelope` against the store without mutating it.
pub fn resolve(
    store: &SessionStore,
    envelope: &WorkflowEnvelope,
) -> Result<Resolution, ManagerError> {
    let hints = Hints {
        session_id: envelope.session_id(),
        goal: envelope.goal(),
    };

    if let Some(id) = hints.session_id.as_deref() {
        if store.is_retired(id) {
            return Err(ManagerError::UnresolvedSession {
                reason: format!("session {id} was already removed"),
            });
        }
    }

    for (name, strategy) in STRATEGIES {
        let Some(found) = strategy(store, &hints) else {
            continue;
        };
        tracing::trace!(
            component = "resolver",
            event = "resolver.matched",
            strategy = %name,
            session_id = %found,
        );

        let Some(explicit) = hints.session_id.clone() else {
            return Ok(Resolution::Tracked(found));
        };
        if explicit == found {
            return Ok(Resolution::Tracked(found));
        }
        if is_placeholder_id(&found) {
            return Ok(Resolution::Rekey {
                placeholder: found,
                backend_id: explicit,
            });
        }
        // The fallback landed on a session that already has a different
        // backend id; routing there would mix two workflows.
        return Err(ManagerError::UnresolvedSession {
            reason: format!("event for unknown session {explicit} matched {found} via {name}"),
        });
    }

    Err(ManagerError::UnresolvedSession {
        reason: match (&hints.session_id, &hints.goal) {
            (Some(id), _) => format!("no session matches id {id}"),
            (None, Some(goal)) => format!("no session matches goal {goal:?}"),
            (None, None) => "event carries no id or goal and no single session is active".into(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::transition::{transition, Input};
    use serde_json::json;
    use workflowdock_protocol::{new_placeholder_id, WorkflowStatus};

    fn envelope(value: serde_json::Value) -> WorkflowEnvelope {
        WorkflowEnvelope::from_value(value)
    }

    fn set_status(store: &mut SessionStore, id: &str, status: WorkflowStatus) {
        let session = store.get_mut(id).expect("session");
        let state = session.extract_state();
        let (state, _) = transition(state, Input::SetStatus { status, error: None }, 1);
        session.apply_state(state);
    }

    fn insert(store: &mut SessionStore, id: &str, goal: &str) {
        store
            .insert(Session::new(id.to_string(), goal.to_string()))
            .expect("insert");
    }

    #[test]
    fn explicit_id_wins_over_goal() {
        let mut store = SessionStore::new();
        insert(&mut store, "wf-a", "A");
        insert(&mut store, "wf-b", "B");

        let resolved = resolve(&store, &envelope(json!({ "workflowId": "wf-a", "goal": "B" })))
            .expect("resolve");
        assert_eq!(resolved, Resolution::Tracked("wf-a".into()));
    }

    #[test]
    fn goal_routes_between_two_active_sessions() {
        let mut store = SessionStore::new();
        insert(&mut store, "wf-a", "A");
        insert(&mut store, "wf-b", "B");

        let resolved = resolve(&store, &envelope(json!({ "goal": "B" }))).expect("resolve");
        assert_eq!(resolved, Resolution::Tracked("wf-b".into()));
    }

    #[test]
    fn goal_prefers_active_then_newest() {
        let mut store = SessionStore::new();
        insert(&mut store, "wf-old", "A");
        insert(&mut store, "wf-done", "A");
        set_status(&mut store, "wf-done", WorkflowStatus::Finished);

        let resolved = resolve(&store, &envelope(json!({ "goal": "A" }))).expect("resolve");
        assert_eq!(resolved, Resolution::Tracked("wf-old".into()));

        insert(&mut store, "wf-new", "A");
        let resolved = resolve(&store, &envelope(json!({ "goal": "A" }))).expect("resolve");
        assert_eq!(resolved, Resolution::Tracked("wf-new".into()));
    }

    #[test]
    fn single_active_session_catches_bare_events() {
        let mut store = SessionStore::new();
        insert(&mut store, "wf-a", "A");
        insert(&mut store, "wf-b", "B");
        set_status(&mut store, "wf-b", WorkflowStatus::Failed);

        let resolved = resolve(&store, &envelope(json!({ "status": "RUNNING" }))).expect("resolve");
        assert_eq!(resolved, Resolution::Tracked("wf-a".into()));
    }

    #[test]
    fn ambiguous_bare_event_is_unresolved() {
        let mut store = SessionStore::new();
        insert(&mut store, "wf-a", "A");
        insert(&mut store, "wf-b", "B");

        let err =
            resolve(&store, &envelope(json!({ "status": "RUNNING" }))).expect_err("ambiguous");
        assert!(matches!(err, ManagerError::UnresolvedSession { .. }));
    }

    #[test]
    fn unknown_id_rekeys_matching_placeholder() {
        let mut store = SessionStore::new();
        let placeholder = new_placeholder_id();
        insert(&mut store, &placeholder, "explain foo.py");

        let resolved = resolve(
            &store,
            &envelope(json!({ "sessionId": "wf-77", "goal": "explain foo.py" })),
        )
        .expect("resolve");
        assert_eq!(
            resolved,
            Resolution::Rekey {
                placeholder,
                backend_id: "wf-77".into()
            }
        );
        assert_eq!(resolved.session_id(), "wf-77");
    }

    #[test]
    fn unknown_id_never_steals_a_confirmed_session() {
        let mut store = SessionStore::new();
        insert(&mut store, "wf-a", "A");

        let err =
            resolve(&store, &envelope(json!({ "sessionId": "wf-zzz" }))).expect_err("conflict");
        assert!(matches!(err, ManagerError::UnresolvedSession { .. }));
    }

    #[test]
    fn retired_ids_are_dropped() {
        let mut store = SessionStore::new();
        insert(&mut store, "wf-a", "A");
        insert(&mut store, "wf-b", "B");
        store.remove("wf-a");

        let err = resolve(&store, &envelope(json!({ "sessionId": "wf-a" }))).expect_err("retired");
        assert!(matches!(err, ManagerError::UnresolvedSession { .. }));
    }
}
