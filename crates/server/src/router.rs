//! Event router
//!
//! Applies normalized transport events to the session store: decode the
//! checkpoint, resolve the owning session, re-key a placeholder if needed,
//! then run the transition. One call is one atomic update from the point of
//! view of everything else, since the store is only touched from the actor.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tracing::{debug, warn};
use workflowdock_connectors::NormalizedEvent;
use workflowdock_protocol::WorkflowEnvelope;

use crate::checkpoint;
use crate::error::ManagerError;
use crate::resolver::{self, Resolution};
use crate::state::SessionStore;
use crate::transition::{transition, Effect, Input};

/// Result of routing one event
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub session_id: String,
    /// Placeholder id the session had before this event, if it was re-keyed
    pub rekeyed_from: Option<String>,
    pub effects: Vec<Effect>,
}

impl Routed {
    pub fn status_changed(&self) -> bool {
        self.effects.iter().any(Effect::is_status_change)
    }

    /// Nothing changed: duplicate or post-terminal event
    pub fn is_ignored(&self) -> bool {
        self.rekeyed_from.is_none()
            && self.effects.iter().all(|e| matches!(e, Effect::Ignored(_)))
    }
}

/// Why an event was not applied
#[derive(Debug, Clone, PartialEq)]
pub struct RouteError {
    /// Session the event would have gone to, when resolution got that far
    pub session_id: Option<String>,
    pub error: ManagerError,
}

/// Stable digest of an envelope. Object keys are ordered so equal envelopes
/// hash equally.
pub fn envelope_digest(envelope: &WorkflowEnvelope) -> u64 {
    let mut hasher = DefaultHasher::new();
    serde_json::Value::Object(envelope.fields.clone())
        .to_string()
        .hash(&mut hasher);
    hasher.finish()
}

/// Route one event. `Closed` events carry no session and are rejected here;
/// the manager handles them before routing.
pub fn route(
    store: &mut SessionStore,
    event: NormalizedEvent,
    now: u64,
) -> Result<Routed, RouteError> {
    match event {
        NormalizedEvent::Checkpoint { source, envelope } => {
            let decoded = match checkpoint::decode(&envelope) {
                Ok(decoded) => decoded,
                Err(e) => {
                    let session_id = resolver::resolve(store, &envelope)
                        .ok()
                        .map(|r| r.session_id().to_string());
                    warn!(
                        component = "router",
                        event = "router.checkpoint.decode_failed",
                        transport = source.as_str(),
                        session_id = session_id.as_deref().unwrap_or("-"),
                        error = %e,
                        "Dropping undecodable checkpoint"
                    );
                    return Err(RouteError {
                        session_id,
                        error: e.into(),
                    });
                }
            };
            debug!(
                component = "router",
                event = "router.checkpoint.decoded",
                transport = source.as_str(),
                status = ?decoded.status,
                status_source = decoded.status_source,
                events = decoded.events.len(),
            );
            let digest = envelope_digest(&envelope);
            apply(
                store,
                &envelope,
                Input::Checkpoint {
                    digest,
                    checkpoint: decoded,
                },
                now,
            )
        }

        NormalizedEvent::Error {
            envelope,
            message,
            fatal,
            ..
        } => apply(store, &envelope, Input::Error { message, fatal }, now),

        NormalizedEvent::Closed { source, reason } => Err(RouteError {
            session_id: None,
            error: ManagerError::Transport(format!("{} channel closed: {reason}", source.as_str())),
        }),
    }
}

fn apply(
    store: &mut SessionStore,
    envelope: &WorkflowEnvelope,
    input: Input,
    now: u64,
) -> Result<Routed, RouteError> {
    let resolution = resolver::resolve(store, envelope).map_err(|error| RouteError {
        session_id: envelope.session_id(),
        error,
    })?;

    let rekeyed_from = match &resolution {
        Resolution::Tracked(_) => None,
        Resolution::Rekey {
            placeholder,
            backend_id,
        } => {
            store
                .rekey(placeholder, backend_id)
                .map_err(|error| RouteError {
                    session_id: Some(placeholder.clone()),
                    error,
                })?;
            debug!(
                component = "router",
                event = "router.session.rekeyed",
                placeholder_id = %placeholder,
                session_id = %backend_id,
                "Placeholder session received backend id"
            );
            Some(placeholder.clone())
        }
    };

    let session_id = resolution.session_id().to_string();
    let session = store.get_mut(&session_id).ok_or_else(|| RouteError {
        session_id: Some(session_id.clone()),
        error: ManagerError::UnknownSession(session_id.clone()),
    })?;

    let state = session.extract_state();
    let (state, effects) = transition(state, input, now);
    session.apply_state(state);

    Ok(Routed {
        session_id,
        rekeyed_from,
        effects,
    })
}
