//! Session manager actor
//!
//! A single tokio task owns the session store and processes commands
//! sequentially, so every checkpoint is applied atomically with respect to
//! host requests. Callers talk to it through [`ManagerHandle`]; lock-free
//! reads of the session list go through `ArcSwap`.
//!
//! Transport calls that wait on the backend (start, prompt decisions) are
//! spawned and report back as commands, so a slow backend never stalls
//! event ingestion.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use workflowdock_connectors::{NormalizedEvent, TransportBridge};
use workflowdock_protocol::{
    new_placeholder_id, ControlEventType, PromptDecision, SessionSummary, StartWorkflowRequest,
    WorkflowControlEvent, WorkflowMetadata, WorkflowStatus,
};

use crate::consumer::StreamConsumer;
use crate::error::ManagerError;
use crate::interaction::{self, Delivery, DeliveryOutcome};
use crate::manager_command::{ManagerCommand, Reply};
use crate::router::{self, RouteError, Routed};
use crate::session::{now_secs, Session};
use crate::state::SessionStore;
use crate::streamer;
use crate::transition::{transition, Effect, Input};

/// Handle to the running manager actor (cheap to Clone).
#[derive(Clone)]
pub struct ManagerHandle {
    command_tx: mpsc::Sender<ManagerCommand>,
    snapshot: Arc<ArcSwap<Vec<SessionSummary>>>,
}

impl ManagerHandle {
    /// Spawn the manager actor. Bridges are tried in order when sending.
    pub fn spawn(
        bridges: Vec<Arc<dyn TransportBridge>>,
        consumer: Arc<dyn StreamConsumer>,
    ) -> ManagerHandle {
        let (command_tx, command_rx) = mpsc::channel(256);
        let snapshot = Arc::new(ArcSwap::from_pointee(Vec::new()));

        let manager = Manager {
            store: SessionStore::new(),
            bridges,
            consumer,
            command_tx: command_tx.downgrade(),
            snapshot: snapshot.clone(),
        };
        tokio::spawn(manager.run(command_rx));

        ManagerHandle {
            command_tx,
            snapshot,
        }
    }

    /// Send a command to the actor (fire-and-forget).
    pub async fn send(&self, cmd: ManagerCommand) {
        let name = cmd.name();
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "manager",
                command = name,
                "Manager channel closed, command dropped"
            );
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> ManagerCommand,
    ) -> Result<T, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| ManagerError::ManagerClosed)?;
        rx.await.map_err(|_| ManagerError::ManagerClosed)?
    }

    /// Create a placeholder session and dispatch the start request. Returns
    /// once the session is tracked; the backend id arrives later.
    pub async fn start_workflow(
        &self,
        goal: String,
        metadata: WorkflowMetadata,
        additional_context: Vec<Value>,
    ) -> Result<SessionSummary, ManagerError> {
        self.request(|reply| ManagerCommand::StartWorkflow {
            goal,
            metadata,
            additional_context,
            reply,
        })
        .await
    }

    pub async fn send_control(
        &self,
        session_id: String,
        event_type: ControlEventType,
        payload: Option<Value>,
    ) -> Result<(), ManagerError> {
        self.request(|reply| ManagerCommand::SendControl {
            session_id,
            event_type,
            payload,
            reply,
        })
        .await
    }

    /// Cancel a session. It is removed locally even when the transport
    /// cannot be told, in which case the error is still returned.
    pub async fn stop_workflow(&self, session_id: String) -> Result<(), ManagerError> {
        self.request(|reply| ManagerCommand::StopWorkflow { session_id, reply })
            .await
    }

    pub async fn dismiss_workflow(&self, session_id: String) -> Result<(), ManagerError> {
        self.request(|reply| ManagerCommand::DismissWorkflow { session_id, reply })
            .await
    }

    pub async fn resolve_prompt(
        &self,
        session_id: String,
        prompt_id: String,
        decision: PromptDecision,
    ) -> Result<(), ManagerError> {
        self.request(|reply| ManagerCommand::ResolvePrompt {
            session_id,
            prompt_id,
            decision,
            reply,
        })
        .await
    }

    pub async fn session(&self, session_id: String) -> Option<SessionSummary> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::GetSession { session_id, reply })
            .await;
        rx.await.ok().flatten()
    }

    /// Lock-free snapshot of all tracked sessions.
    pub fn sessions(&self) -> Arc<Vec<SessionSummary>> {
        self.snapshot.load_full()
    }

    /// Pump a transport's events into the actor until the transport closes.
    pub fn forward_events(&self, mut events: mpsc::Receiver<NormalizedEvent>) -> JoinHandle<()> {
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(ManagerCommand::Inbound(event)).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Periodically stop sessions that have been idle for `max_idle`.
    pub fn spawn_idle_reaper(&self, max_idle: Duration) -> JoinHandle<()> {
        let tx = self.command_tx.downgrade();
        let period = (max_idle / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tx) = tx.upgrade() else { break };
                let cmd = ManagerCommand::ExpireIdle {
                    max_idle_secs: max_idle.as_secs(),
                };
                if tx.send(cmd).await.is_err() {
                    break;
                }
            }
        })
    }
}

struct Manager {
    store: SessionStore,
    bridges: Vec<Arc<dyn TransportBridge>>,
    consumer: Arc<dyn StreamConsumer>,
    /// Weak so the actor does not keep its own channel open
    command_tx: mpsc::WeakSender<ManagerCommand>,
    snapshot: Arc<ArcSwap<Vec<SessionSummary>>>,
}

impl Manager {
    async fn run(mut self, mut command_rx: mpsc::Receiver<ManagerCommand>) {
        while let Some(cmd) = command_rx.recv().await {
            self.handle(cmd).await;
            self.publish();
        }
        debug!(
            component = "manager",
            event = "manager.stopped",
            "Manager actor exiting"
        );
    }

    fn publish(&self) {
        self.snapshot.store(Arc::new(self.store.summaries()));
    }

    /// First bridge that can currently dispatch
    fn bridge(&self) -> Option<Arc<dyn TransportBridge>> {
        self.bridges.iter().find(|b| b.is_connected()).cloned()
    }

    async fn handle(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::Inbound(event) => self.handle_inbound(event),

            ManagerCommand::StartWorkflow {
                goal,
                metadata,
                additional_context,
                reply,
            } => {
                let result = self.start_workflow(goal, metadata, additional_context);
                let _ = reply.send(result);
            }

            ManagerCommand::SendControl {
                session_id,
                event_type,
                payload,
                reply,
            } => {
                let result = if event_type == ControlEventType::Stop {
                    self.stop_workflow(&session_id).await
                } else {
                    self.send_control(&session_id, event_type, payload).await
                };
                let _ = reply.send(result);
            }

            ManagerCommand::StopWorkflow { session_id, reply } => {
                let result = self.stop_workflow(&session_id).await;
                let _ = reply.send(result);
            }

            ManagerCommand::DismissWorkflow { session_id, reply } => {
                let result = self.dismiss_workflow(&session_id);
                let _ = reply.send(result);
            }

            ManagerCommand::ResolvePrompt {
                session_id,
                prompt_id,
                decision,
                reply,
            } => {
                let result = self.resolve_prompt(&session_id, &prompt_id, decision);
                let _ = reply.send(result);
            }

            ManagerCommand::GetSession { session_id, reply } => {
                let _ = reply.send(self.store.get(&session_id).map(Session::summary));
            }

            ManagerCommand::StartDispatched {
                placeholder_id,
                result,
            } => self.start_dispatched(&placeholder_id, result),

            ManagerCommand::DecisionDelivered {
                session_id,
                prompt_id,
                result,
            } => self.decision_delivered(&session_id, &prompt_id, result),

            ManagerCommand::ExpireIdle { max_idle_secs } => self.expire_idle(max_idle_secs).await,
        }
    }

    // -- Inbound events -------------------------------------------------------

    fn handle_inbound(&mut self, event: NormalizedEvent) {
        if let NormalizedEvent::Closed { source, reason } = &event {
            warn!(
                component = "manager",
                event = "manager.transport.closed",
                transport = source.as_str(),
                reason = %reason,
                "Transport channel closed"
            );
            self.consumer.on_error(
                None,
                ManagerError::TransportUnavailable.code(),
                &format!("{} channel closed: {reason}", source.as_str()),
            );
            return;
        }

        match router::route(&mut self.store, event, now_secs()) {
            Ok(routed) if routed.is_ignored() => {
                debug!(
                    component = "manager",
                    event = "manager.event.ignored",
                    session_id = %routed.session_id,
                    effects = ?routed.effects,
                    "Event changed nothing"
                );
            }
            Ok(routed) => self.after_update(routed),
            Err(RouteError { session_id, error }) => match error {
                ManagerError::UnresolvedSession { ref reason } => {
                    warn!(
                        component = "manager",
                        event = "manager.event.unresolved",
                        session_id = session_id.as_deref().unwrap_or("-"),
                        reason = %reason,
                        "Dropping event with no owning session"
                    );
                }
                error => {
                    self.consumer
                        .on_error(session_id.as_deref(), error.code(), &error.to_string());
                }
            },
        }
    }

    /// Fan out the consequences of an applied update: rekey notice,
    /// interaction policy, streamed messages, prompt, summary.
    fn after_update(&mut self, routed: Routed) {
        let status_changed = routed.status_changed();
        if let Some(previous) = &routed.rekeyed_from {
            self.consumer
                .on_session_rekeyed(previous, &routed.session_id);
        }
        for effect in &routed.effects {
            if let Effect::StatusChanged { from, to } = effect {
                info!(
                    component = "manager",
                    event = "manager.session.status",
                    session_id = %routed.session_id,
                    from = %from,
                    to = %to,
                    "Session status changed"
                );
            }
        }
        self.refresh_session(&routed.session_id, status_changed);
    }

    fn refresh_session(&mut self, session_id: &str, status_changed: bool) {
        let Some(session) = self.store.get_mut(session_id) else {
            return;
        };
        let prompt = interaction::evaluate(session, status_changed);
        streamer::drain(session, self.consumer.as_ref());
        if let Some(prompt) = prompt {
            info!(
                component = "manager",
                event = "manager.prompt.requested",
                session_id = %prompt.session_id,
                prompt_id = %prompt.prompt_id,
                "Prompting user"
            );
            self.consumer.on_prompt(&prompt);
        }
        self.consumer.on_session_changed(&session.summary());
    }

    /// Run a locally decided status change through the transition function.
    fn apply_local(
        &mut self,
        session_id: &str,
        status: WorkflowStatus,
        error: Option<String>,
    ) -> bool {
        let Some(session) = self.store.get_mut(session_id) else {
            return false;
        };
        let state = session.extract_state();
        let (state, effects) = transition(state, Input::SetStatus { status, error }, now_secs());
        session.apply_state(state);
        effects.iter().any(Effect::is_status_change)
    }

    // -- Host requests --------------------------------------------------------

    fn start_workflow(
        &mut self,
        goal: String,
        metadata: WorkflowMetadata,
        additional_context: Vec<Value>,
    ) -> Result<SessionSummary, ManagerError> {
        let bridge = self.bridge().ok_or(ManagerError::TransportUnavailable)?;

        let placeholder_id = new_placeholder_id();
        self.store
            .insert(Session::new(placeholder_id.clone(), goal.clone()))?;

        let summary = self
            .store
            .get(&placeholder_id)
            .map(Session::summary)
            .ok_or_else(|| ManagerError::UnknownSession(placeholder_id.clone()))?;

        info!(
            component = "manager",
            event = "manager.session.started",
            session_id = %placeholder_id,
            transport = bridge.kind().as_str(),
            "Dispatching workflow start"
        );
        self.consumer.on_session_started(&summary);

        let request = StartWorkflowRequest {
            goal,
            metadata,
            additional_context,
        };
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            let result = bridge
                .start_workflow(request)
                .await
                .map_err(|e| e.to_string());
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(ManagerCommand::StartDispatched {
                        placeholder_id,
                        result,
                    })
                    .await;
            }
        });

        Ok(summary)
    }

    fn start_dispatched(&mut self, placeholder_id: &str, result: Result<Option<String>, String>) {
        match result {
            Ok(Some(backend_id)) => {
                // A checkpoint may have re-keyed the placeholder already.
                if !self.store.contains(placeholder_id) {
                    return;
                }
                match self.store.rekey(placeholder_id, &backend_id) {
                    Ok(()) => {
                        info!(
                            component = "manager",
                            event = "manager.session.confirmed",
                            placeholder_id = %placeholder_id,
                            session_id = %backend_id,
                            "Backend assigned session id"
                        );
                        self.consumer.on_session_rekeyed(placeholder_id, &backend_id);
                        self.refresh_session(&backend_id, false);
                    }
                    Err(e) => warn!(
                        component = "manager",
                        event = "manager.session.rekey_failed",
                        placeholder_id = %placeholder_id,
                        session_id = %backend_id,
                        error = %e,
                        "Could not re-key placeholder session"
                    ),
                }
            }
            Ok(None) => debug!(
                component = "manager",
                event = "manager.session.awaiting_id",
                session_id = %placeholder_id,
                "Start dispatched; id arrives with the first checkpoint"
            ),
            Err(reason) => {
                warn!(
                    component = "manager",
                    event = "manager.session.start_failed",
                    session_id = %placeholder_id,
                    error = %reason,
                    "Workflow start failed"
                );
                let session_id = self.store.canonical_id(placeholder_id).to_string();
                let changed = self.apply_local(
                    &session_id,
                    WorkflowStatus::Failed,
                    Some(format!("failed to start workflow: {reason}")),
                );
                self.refresh_session(&session_id, changed);
            }
        }
    }

    async fn send_control(
        &mut self,
        session_id: &str,
        event_type: ControlEventType,
        payload: Option<Value>,
    ) -> Result<(), ManagerError> {
        let session = self
            .store
            .get(session_id)
            .ok_or_else(|| ManagerError::UnknownSession(session_id.to_string()))?;
        if session.is_placeholder() {
            return Err(ManagerError::NotConfirmed(session_id.to_string()));
        }
        let event = WorkflowControlEvent {
            session_id: session.id().to_string(),
            event_type,
            payload,
        };
        let bridge = self.bridge().ok_or(ManagerError::TransportUnavailable)?;
        bridge
            .send_event(event)
            .await
            .map_err(|e| ManagerError::Transport(e.to_string()))
    }

    async fn stop_workflow(&mut self, session_id: &str) -> Result<(), ManagerError> {
        let session = self
            .store
            .get(session_id)
            .ok_or_else(|| ManagerError::UnknownSession(session_id.to_string()))?;
        let session_id = session.id().to_string();
        let notify = !session.is_placeholder() && !session.status().is_terminal();

        let mut result = Ok(());
        if notify {
            result = match self.bridge() {
                Some(bridge) => bridge
                    .send_event(WorkflowControlEvent {
                        session_id: session_id.clone(),
                        event_type: ControlEventType::Stop,
                        payload: None,
                    })
                    .await
                    .map_err(|e| ManagerError::Transport(e.to_string())),
                None => Err(ManagerError::TransportUnavailable),
            };
        }
        if let Err(e) = &result {
            warn!(
                component = "manager",
                event = "manager.session.stop_not_sent",
                session_id = %session_id,
                error = %e,
                "Backend was not told about the stop; removing locally"
            );
        }

        self.teardown(&session_id, "stopped");
        result
    }

    fn dismiss_workflow(&mut self, session_id: &str) -> Result<(), ManagerError> {
        let session = self
            .store
            .get(session_id)
            .ok_or_else(|| ManagerError::UnknownSession(session_id.to_string()))?;
        if !session.status().is_terminal() {
            return Err(ManagerError::SessionActive(session.id().to_string()));
        }
        let session_id = session.id().to_string();
        self.teardown(&session_id, "dismissed");
        Ok(())
    }

    /// Mark stopped (if still running), flush, and drop the session.
    fn teardown(&mut self, session_id: &str, reason: &str) {
        let changed = self.apply_local(session_id, WorkflowStatus::Stopped, None);
        if let Some(session) = self.store.get_mut(session_id) {
            interaction::evaluate(session, changed);
            streamer::drain(session, self.consumer.as_ref());
        }
        if self.store.remove(session_id).is_some() {
            info!(
                component = "manager",
                event = "manager.session.removed",
                session_id = %session_id,
                reason = reason,
                "Session removed"
            );
            self.consumer.on_session_removed(session_id);
        }
    }

    fn resolve_prompt(
        &mut self,
        session_id: &str,
        prompt_id: &str,
        decision: PromptDecision,
    ) -> Result<(), ManagerError> {
        let bridge = self.bridge();
        let session = self
            .store
            .get_mut(session_id)
            .ok_or_else(|| ManagerError::UnknownSession(session_id.to_string()))?;

        let Some(delivery) = interaction::prepare_decision(session, prompt_id, decision)? else {
            debug!(
                component = "manager",
                event = "manager.prompt.empty_input",
                session_id = %session.id(),
                prompt_id = %prompt_id,
                "Empty input; nothing sent"
            );
            return Ok(());
        };
        let session_id = session.id().to_string();

        let Some(bridge) = bridge else {
            let outcome = interaction::complete_delivery(
                session,
                prompt_id,
                Err(ManagerError::TransportUnavailable.to_string()),
            );
            return match outcome {
                DeliveryOutcome::Failed(e) => Err(e),
                _ => Err(ManagerError::TransportUnavailable),
            };
        };

        info!(
            component = "manager",
            event = "manager.prompt.delivering",
            session_id = %session_id,
            prompt_id = %prompt_id,
            transport = bridge.kind().as_str(),
            "Delivering decision"
        );

        let prompt_id = prompt_id.to_string();
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            let result = match delivery {
                Delivery::ToolApproval(response) => bridge.send_tool_approval(response).await,
                Delivery::Message(event) => bridge.send_event(event).await,
            }
            .map_err(|e| e.to_string());
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(ManagerCommand::DecisionDelivered {
                        session_id,
                        prompt_id,
                        result,
                    })
                    .await;
            }
        });
        Ok(())
    }

    fn decision_delivered(
        &mut self,
        session_id: &str,
        prompt_id: &str,
        result: Result<(), String>,
    ) {
        let Some(session) = self.store.get_mut(session_id) else {
            debug!(
                component = "manager",
                event = "manager.prompt.session_gone",
                session_id = %session_id,
                prompt_id = %prompt_id,
                "Decision delivered for a removed session"
            );
            return;
        };
        let session_id = session.id().to_string();

        match interaction::complete_delivery(session, prompt_id, result) {
            DeliveryOutcome::Delivered => {
                debug!(
                    component = "manager",
                    event = "manager.prompt.delivered",
                    session_id = %session_id,
                    prompt_id = %prompt_id,
                    "Decision delivered"
                );
                // A request may have arrived while this one was on the wire
                self.refresh_session(&session_id, false);
            }
            DeliveryOutcome::Failed(error) => {
                warn!(
                    component = "manager",
                    event = "manager.prompt.delivery_failed",
                    session_id = %session_id,
                    prompt_id = %prompt_id,
                    error = %error,
                    "Decision delivery failed; prompt stays pending"
                );
                self.consumer
                    .on_error(Some(&session_id), error.code(), &error.to_string());
                self.consumer.on_session_changed(&session.summary());
            }
            DeliveryOutcome::Stale => {}
        }
    }

    async fn expire_idle(&mut self, max_idle_secs: u64) {
        let now = now_secs();
        let expired: Vec<String> = self
            .store
            .active()
            .filter(|s| now.saturating_sub(s.updated_at()) >= max_idle_secs)
            .map(|s| s.id().to_string())
            .collect();

        for session_id in expired {
            info!(
                component = "manager",
                event = "manager.session.idle_timeout",
                session_id = %session_id,
                max_idle_secs,
                "Stopping idle session"
            );
            if let Err(e) = self.stop_workflow(&session_id).await {
                debug!(
                    component = "manager",
                    event = "manager.session.idle_stop_unsent",
                    session_id = %session_id,
                    error = %e,
                );
            }
        }
    }
}
