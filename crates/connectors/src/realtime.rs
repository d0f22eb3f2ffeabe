//! Real-time channel connector
//!
//! Event-subscription channel over WebSocket. Every frame is a JSON text
//! message shaped `{"event": name, "data": {...}}`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use workflowdock_protocol::{
    CommandRequest, StartWorkflowRequest, ToolApprovalResponse, WorkflowControlEvent,
    WorkflowEnvelope,
};

use crate::{
    error_is_fatal, error_message, CommandExecutor, ConnectorError, NormalizedEvent,
    TransportBridge, TransportKind,
};

/// What to do with one inbound frame
#[derive(Debug)]
enum FrameAction {
    Emit(NormalizedEvent),
    RunCommand {
        request_id: Value,
        request: CommandRequest,
    },
    Reply(Value),
    Ignore,
}

/// Connector for the WebSocket event-subscription channel.
pub struct RealtimeChannel {
    out_tx: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
}

impl RealtimeChannel {
    /// Connect to `url` and subscribe to `channel` when one is given.
    pub async fn connect(
        url: &str,
        channel: Option<&str>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<(Self, mpsc::Receiver<NormalizedEvent>), ConnectorError> {
        info!(
            component = "realtime_connector",
            event = "realtime.connect",
            url = %url,
            "Connecting to real-time channel"
        );
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ConnectorError::WebSocketError(e.to_string()))?;
        Self::from_stream(ws, channel, executor).await
    }

    /// Drive an already-established WebSocket.
    pub async fn from_stream<S>(
        ws: WebSocketStream<S>,
        channel: Option<&str>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<(Self, mpsc::Receiver<NormalizedEvent>), ConnectorError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, stream) = ws.split();
        let (event_tx, event_rx) = mpsc::channel::<NormalizedEvent>(256);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        let connected = Arc::new(AtomicBool::new(true));

        if let Some(channel) = channel {
            let subscribe = frame("subscribe", json!({ "channel": channel }));
            sink.send(Message::text(subscribe))
                .await
                .map_err(|e| ConnectorError::WebSocketError(e.to_string()))?;
        }

        let writer_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::text(text)).await {
                    warn!(
                        component = "realtime_connector",
                        event = "realtime.send_failed",
                        error = %e,
                        "Failed to send frame"
                    );
                    break;
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
        });

        tokio::spawn(Self::reader_task(
            stream,
            event_tx,
            out_tx.clone(),
            connected.clone(),
            executor,
        ));

        Ok((Self { out_tx, connected }, event_rx))
    }

    async fn reader_task<St>(
        mut stream: St,
        event_tx: mpsc::Sender<NormalizedEvent>,
        out_tx: mpsc::Sender<String>,
        connected: Arc<AtomicBool>,
        executor: Arc<dyn CommandExecutor>,
    ) where
        St: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin
            + Send
            + 'static,
    {
        let reason = loop {
            let text = match stream.next().await {
                Some(Ok(Message::Text(text))) => text.to_string(),
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "server closed".to_string());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => break format!("websocket error: {e}"),
                None => break "stream ended".to_string(),
            };

            let raw: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        component = "realtime_connector",
                        event = "realtime.parse_error",
                        error = %e,
                        "Failed to parse frame"
                    );
                    continue;
                }
            };

            match translate_frame(&raw) {
                FrameAction::Emit(event) => {
                    if event_tx.send(event).await.is_err() {
                        break "event consumer dropped".to_string();
                    }
                }
                FrameAction::RunCommand {
                    request_id,
                    request,
                } => {
                    let executor = executor.clone();
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        let result = executor.execute(request).await;
                        let reply = frame(
                            "command_result",
                            json!({
                                "requestId": request_id,
                                "exitCode": result.exit_code,
                                "output": result.output,
                            }),
                        );
                        let _ = out_tx.send(reply).await;
                    });
                }
                FrameAction::Reply(reply) => {
                    let _ = out_tx.send(reply.to_string()).await;
                }
                FrameAction::Ignore => {}
            }
        };

        connected.store(false, Ordering::SeqCst);
        info!(
            component = "realtime_connector",
            event = "realtime.closed",
            reason = %reason,
            "Real-time channel closed"
        );
        let _ = event_tx
            .send(NormalizedEvent::Closed {
                source: TransportKind::Realtime,
                reason,
            })
            .await;
    }

    async fn emit(&self, event: &str, data: Value) -> Result<(), ConnectorError> {
        if !self.is_connected() {
            return Err(ConnectorError::ChannelClosed);
        }
        self.out_tx
            .send(frame(event, data))
            .await
            .map_err(|_| ConnectorError::ChannelClosed)
    }
}

fn frame(event: &str, data: Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

fn translate_frame(raw: &Value) -> FrameAction {
    let event = raw
        .get("event")
        .or_else(|| raw.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let data = raw
        .get("data")
        .or_else(|| raw.get("payload"))
        .cloned()
        .unwrap_or(Value::Null);

    match event {
        "checkpoint" | "workflow_checkpoint" | "workflow_update" => {
            FrameAction::Emit(NormalizedEvent::Checkpoint {
                source: TransportKind::Realtime,
                envelope: WorkflowEnvelope::from_value(data),
            })
        }
        "error" | "workflow_error" => {
            let message = error_message(&data);
            let fatal = error_is_fatal(&data);
            FrameAction::Emit(NormalizedEvent::Error {
                source: TransportKind::Realtime,
                envelope: WorkflowEnvelope::from_value(data),
                message,
                fatal,
            })
        }
        "run_command" => {
            let request_id = data
                .get("requestId")
                .or_else(|| data.get("request_id"))
                .cloned()
                .unwrap_or(Value::Null);
            match serde_json::from_value::<CommandRequest>(data) {
                Ok(request) => FrameAction::RunCommand {
                    request_id,
                    request,
                },
                Err(e) => FrameAction::Reply(json!({
                    "event": "command_result",
                    "data": {
                        "requestId": request_id,
                        "exitCode": -1,
                        "output": format!("invalid run_command payload: {e}"),
                    }
                })),
            }
        }
        "ping" => FrameAction::Reply(json!({ "event": "pong", "data": data })),
        "subscribed" | "pong" | "welcome" => FrameAction::Ignore,
        other => {
            debug!(
                component = "realtime_connector",
                event = "realtime.unknown_event",
                frame_event = %other,
                "Unknown real-time event"
            );
            FrameAction::Ignore
        }
    }
}

#[async_trait]
impl TransportBridge for RealtimeChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Realtime
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.out_tx.is_closed()
    }

    /// The real-time channel has no request/response pairing; the backend id
    /// arrives with the first checkpoint.
    async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<Option<String>, ConnectorError> {
        self.emit("start_workflow", serde_json::to_value(&request)?)
            .await?;
        Ok(None)
    }

    async fn send_event(&self, event: WorkflowControlEvent) -> Result<(), ConnectorError> {
        self.emit("send_event", serde_json::to_value(&event)?).await
    }

    async fn send_tool_approval(
        &self,
        response: ToolApprovalResponse,
    ) -> Result<(), ConnectorError> {
        self.emit("tool_approval", serde_json::to_value(&response)?)
            .await
    }
}
