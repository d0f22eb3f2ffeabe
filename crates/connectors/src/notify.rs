//! Notify/request channel connector
//!
//! Talks to the intermediary over a byte stream (Unix socket or child stdio,
//! supplied by the bootstrapper) using newline-delimited JSON:
//!
//! - request: `{"id": n, "method": m, "params": {...}}`
//! - response: `{"id": n, "result": {...}}` or `{"id": n, "error": {...}}`
//! - notification: `{"method": m, "params": {...}}`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use workflowdock_protocol::{
    CommandRequest, StartWorkflowRequest, ToolApprovalResponse, WorkflowControlEvent,
    WorkflowEnvelope,
};

use crate::{
    error_is_fatal, error_message, CommandExecutor, ConnectorError, NormalizedEvent,
    TransportBridge, TransportKind,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// Connector for the bidirectional notify/request channel.
pub struct NotifyChannel {
    out_tx: mpsc::Sender<String>,
    next_id: AtomicU64,
    pending: PendingRequests,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl NotifyChannel {
    /// Wrap an already-open stream pair. Spawns the reader and writer tasks
    /// and returns the connector plus the receiver of normalized events.
    pub fn new<R, W>(
        reader: R,
        writer: W,
        executor: Arc<dyn CommandExecutor>,
    ) -> (Self, mpsc::Receiver<NormalizedEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (event_tx, event_rx) = mpsc::channel::<NormalizedEvent>(256);
        let (out_tx, out_rx) = mpsc::channel::<String>(256);
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::writer_task(writer, out_rx, connected.clone()));
        tokio::spawn(Self::reader_task(
            reader,
            event_tx,
            out_tx.clone(),
            pending.clone(),
            connected.clone(),
            executor,
        ));

        let channel = Self {
            out_tx,
            next_id: AtomicU64::new(1),
            pending,
            connected,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        };
        (channel, event_rx)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Send a request and wait for the correlated response.
    async fn request(&self, method: &str, params: Value) -> Result<Value, ConnectorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = json!({ "id": id, "method": method, "params": params }).to_string();
        if let Err(e) = self.write_line(line).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(ConnectorError::RemoteError(message)),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err(ConnectorError::ChannelClosed)
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ConnectorError::Timeout {
                    method: method.to_string(),
                    secs: self.request_timeout.as_secs(),
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), ConnectorError> {
        let line = json!({ "method": method, "params": params }).to_string();
        self.write_line(line).await
    }

    async fn write_line(&self, line: String) -> Result<(), ConnectorError> {
        if !self.is_connected() {
            return Err(ConnectorError::ChannelClosed);
        }
        debug!(
            component = "notify_connector",
            event = "notify.write",
            payload_len = line.len(),
            "Queueing line for intermediary"
        );
        self.out_tx
            .send(line)
            .await
            .map_err(|_| ConnectorError::ChannelClosed)
    }

    /// Dedicated writer task: reads from channel, writes NDJSON to the stream.
    async fn writer_task<W>(
        mut writer: W,
        mut rx: mpsc::Receiver<String>,
        connected: Arc<AtomicBool>,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!(
                    component = "notify_connector",
                    event = "notify.write_error",
                    error = %e,
                    "Failed to write to intermediary"
                );
                break;
            }
            if let Err(e) = writer.flush().await {
                error!(
                    component = "notify_connector",
                    event = "notify.flush_error",
                    error = %e,
                    "Failed to flush intermediary stream"
                );
                break;
            }
        }
        connected.store(false, Ordering::SeqCst);
        debug!(
            component = "notify_connector",
            event = "notify.writer.closed",
            "Writer task ended"
        );
    }

    /// Read lines, parse JSON, dispatch responses/requests/notifications.
    async fn reader_task<R>(
        reader: R,
        event_tx: mpsc::Sender<NormalizedEvent>,
        out_tx: mpsc::Sender<String>,
        pending: PendingRequests,
        connected: Arc<AtomicBool>,
        executor: Arc<dyn CommandExecutor>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut lines = BufReader::new(reader).lines();

        let reason = loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    let raw: Value = match serde_json::from_str(line) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(
                                component = "notify_connector",
                                event = "notify.parse_error",
                                error = %e,
                                line_preview = %line.chars().take(200).collect::<String>(),
                                "Failed to parse intermediary JSON"
                            );
                            continue;
                        }
                    };

                    if let Some(event) =
                        Self::dispatch_line(raw, &out_tx, &pending, &executor).await
                    {
                        if event_tx.send(event).await.is_err() {
                            info!(
                                component = "notify_connector",
                                event = "notify.event_channel_closed",
                                "Event channel closed, stopping reader"
                            );
                            break "event consumer dropped".to_string();
                        }
                    }
                }
                Ok(None) => break "intermediary closed the stream".to_string(),
                Err(e) => break format!("read_error: {e}"),
            }
        };

        connected.store(false, Ordering::SeqCst);
        // Fail outstanding requests right away instead of waiting for timeouts
        pending.lock().await.clear();
        info!(
            component = "notify_connector",
            event = "notify.closed",
            reason = %reason,
            "Notify channel closed"
        );
        let _ = event_tx
            .send(NormalizedEvent::Closed {
                source: TransportKind::Notify,
                reason,
            })
            .await;
    }

    /// Classify one inbound JSON line. Returns an event for the manager when
    /// the line is a workflow notification.
    async fn dispatch_line(
        raw: Value,
        out_tx: &mpsc::Sender<String>,
        pending: &PendingRequests,
        executor: &Arc<dyn CommandExecutor>,
    ) -> Option<NormalizedEvent> {
        let id = raw.get("id").and_then(Value::as_u64);
        let method = raw.get("method").and_then(Value::as_str);

        match (id, method) {
            // Response to one of our requests
            (Some(id), None) => {
                let outcome = match raw.get("error") {
                    Some(err) => Err(error_message(err)),
                    None => Ok(raw.get("result").cloned().unwrap_or(Value::Null)),
                };
                match pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => debug!(
                        component = "notify_connector",
                        event = "notify.response.orphan",
                        request_id = id,
                        "Response for unknown or expired request"
                    ),
                }
                None
            }

            // Request from the intermediary
            (Some(id), Some(method)) => {
                let params = raw.get("params").cloned().unwrap_or(Value::Null);
                Self::handle_request(id, method, params, out_tx, executor);
                None
            }

            (None, Some(method)) => {
                let params = raw.get("params").cloned().unwrap_or(Value::Null);
                translate_notification(method, params)
            }

            (None, None) => {
                debug!(
                    component = "notify_connector",
                    event = "notify.unknown_shape",
                    "Line is neither request, response nor notification"
                );
                None
            }
        }
    }

    /// Requests run on their own task so a slow command never stalls the reader.
    fn handle_request(
        id: u64,
        method: &str,
        params: Value,
        out_tx: &mpsc::Sender<String>,
        executor: &Arc<dyn CommandExecutor>,
    ) {
        let out_tx = out_tx.clone();
        match method {
            "runCommand" => {
                let executor = executor.clone();
                tokio::spawn(async move {
                    let response = match serde_json::from_value::<CommandRequest>(params) {
                        Ok(request) => {
                            info!(
                                component = "notify_connector",
                                event = "notify.run_command",
                                request_id = id,
                                command = %request.command,
                                "Backend requested local command"
                            );
                            let result = executor.execute(request).await;
                            json!({ "id": id, "result": result })
                        }
                        Err(e) => json!({
                            "id": id,
                            "error": { "message": format!("invalid runCommand params: {e}") }
                        }),
                    };
                    let _ = out_tx.send(response.to_string()).await;
                });
            }
            other => {
                warn!(
                    component = "notify_connector",
                    event = "notify.request.unsupported",
                    method = %other,
                    "Unsupported request from intermediary"
                );
                let response = json!({
                    "id": id,
                    "error": { "message": format!("unsupported method: {other}") }
                });
                tokio::spawn(async move {
                    let _ = out_tx.send(response.to_string()).await;
                });
            }
        }
    }
}

/// Map a notification method onto the normalized event shape.
fn translate_notification(method: &str, params: Value) -> Option<NormalizedEvent> {
    match method {
        "workflowUpdate" | "workflow_update" | "workflowStatus" => {
            Some(NormalizedEvent::Checkpoint {
                source: TransportKind::Notify,
                envelope: WorkflowEnvelope::from_value(params),
            })
        }
        "workflowError" | "workflow_error" => {
            let message = error_message(&params);
            let fatal = error_is_fatal(&params);
            Some(NormalizedEvent::Error {
                source: TransportKind::Notify,
                envelope: WorkflowEnvelope::from_value(params),
                message,
                fatal,
            })
        }
        "keepAlive" | "keep_alive" => None,
        other => {
            debug!(
                component = "notify_connector",
                event = "notify.unknown_method",
                method = %other,
                "Unknown notification method"
            );
            None
        }
    }
}

#[async_trait]
impl TransportBridge for NotifyChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Notify
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.out_tx.is_closed()
    }

    async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<Option<String>, ConnectorError> {
        let params = serde_json::to_value(&request)?;
        let result = self.request("startWorkflow", params).await?;
        Ok(WorkflowEnvelope::from_value(result).session_id())
    }

    async fn send_event(&self, event: WorkflowControlEvent) -> Result<(), ConnectorError> {
        let params = serde_json::to_value(&event)?;
        self.notify("sendEvent", params).await
    }

    async fn send_tool_approval(
        &self,
        response: ToolApprovalResponse,
    ) -> Result<(), ConnectorError> {
        let params = serde_json::to_value(&response)?;
        self.notify("toolApproval", params).await
    }
}
