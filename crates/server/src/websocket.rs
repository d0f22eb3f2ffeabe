//! WebSocket handling for editor clients

use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use workflowdock_protocol::{ClientMessage, ServerMessage};

use crate::error::ManagerError;
use crate::manager::ManagerHandle;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: ManagerHandle,
    pub events: broadcast::Sender<ServerMessage>,
}

/// Editor-facing HTTP surface
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    Json(ServerMessage),
    Pong(Bytes),
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(100);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    // Subscribe before the snapshot so nothing falls between the two.
    spawn_broadcast_forwarder(state.events.subscribe(), outbound_tx.clone(), conn_id);
    send_json(
        &outbound_tx,
        ServerMessage::SessionsList {
            sessions: state.manager.sessions().as_ref().clone(),
        },
    )
    .await;

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    payload_preview = %truncate_for_log(&msg, 240),
                    "Failed to parse client message"
                );
                send_json(
                    &outbound_tx,
                    ServerMessage::Error {
                        code: "parse_error".into(),
                        message: e.to_string(),
                        session_id: None,
                    },
                )
                .await;
                continue;
            }
        };

        handle_client_message(client_msg, &outbound_tx, &state, conn_id).await;
    }

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

async fn send_json(tx: &mpsc::Sender<OutboundMessage>, msg: ServerMessage) {
    let _ = tx.send(OutboundMessage::Json(msg)).await;
}

async fn send_error(
    tx: &mpsc::Sender<OutboundMessage>,
    session_id: Option<String>,
    error: ManagerError,
) {
    send_json(
        tx,
        ServerMessage::Error {
            code: error.code().to_string(),
            message: error.to_string(),
            session_id,
        },
    )
    .await;
}

/// Drain the manager's broadcast into this client's outbound channel. Exits
/// when the client goes away.
fn spawn_broadcast_forwarder(
    mut rx: broadcast::Receiver<ServerMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    conn_id: u64,
) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if outbound_tx.send(OutboundMessage::Json(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        component = "websocket",
                        event = "ws.broadcast.lagged",
                        connection_id = conn_id,
                        skipped = n,
                        "Broadcast subscriber lagged, skipped {n} messages"
                    );
                    let _ = outbound_tx
                        .send(OutboundMessage::Json(ServerMessage::Error {
                            code: "lagged".to_string(),
                            message: format!("Subscriber lagged, skipped {n} messages"),
                            session_id: None,
                        }))
                        .await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn handle_client_message(
    msg: ClientMessage,
    client_tx: &mpsc::Sender<OutboundMessage>,
    state: &AppState,
    conn_id: u64,
) {
    debug!(
        component = "websocket",
        event = "ws.message.received",
        connection_id = conn_id,
        message = ?msg,
        "Received client message"
    );

    match msg {
        ClientMessage::ListSessions => {
            send_json(
                client_tx,
                ServerMessage::SessionsList {
                    sessions: state.manager.sessions().as_ref().clone(),
                },
            )
            .await;
        }

        ClientMessage::GetSession { session_id } => {
            match state.manager.session(session_id.clone()).await {
                Some(session) => {
                    send_json(client_tx, ServerMessage::SessionChanged { session }).await;
                }
                None => {
                    send_error(
                        client_tx,
                        Some(session_id.clone()),
                        ManagerError::UnknownSession(session_id),
                    )
                    .await;
                }
            }
        }

        ClientMessage::StartWorkflow {
            goal,
            metadata,
            additional_context,
        } => {
            if goal.trim().is_empty() {
                send_error(
                    client_tx,
                    None,
                    ManagerError::InvalidRequest("goal must not be empty".into()),
                )
                .await;
                return;
            }
            // Success is announced to every client via session_started.
            if let Err(e) = state
                .manager
                .start_workflow(goal, metadata, additional_context)
                .await
            {
                send_error(client_tx, None, e).await;
            }
        }

        ClientMessage::SendEvent {
            session_id,
            event_type,
            payload,
        } => {
            if let Err(e) = state
                .manager
                .send_control(session_id.clone(), event_type, payload)
                .await
            {
                send_error(client_tx, Some(session_id), e).await;
            }
        }

        ClientMessage::StopWorkflow { session_id } => {
            if let Err(e) = state.manager.stop_workflow(session_id.clone()).await {
                send_error(client_tx, Some(session_id), e).await;
            }
        }

        ClientMessage::DismissWorkflow { session_id } => {
            if let Err(e) = state.manager.dismiss_workflow(session_id.clone()).await {
                send_error(client_tx, Some(session_id), e).await;
            }
        }

        ClientMessage::ResolvePrompt {
            session_id,
            prompt_id,
            decision,
        } => {
            if let Err(e) = state
                .manager
                .resolve_prompt(session_id.clone(), prompt_id, decision)
                .await
            {
                send_error(client_tx, Some(session_id), e).await;
            }
        }
    }
}
