//! workflowdock
//!
//! Session manager for remote agentic workflows. Tracks workflow runs
//! started from the editor, follows their progress over the intermediary's
//! transport channels, and streams messages and prompts to editor clients
//! over WebSocket.

mod checkpoint;
mod config;
mod consumer;
mod error;
mod interaction;
mod logging;
mod manager;
mod manager_command;
mod paths;
mod resolver;
mod router;
mod session;
mod shell;
mod state;
mod streamer;
mod transition;
mod websocket;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use workflowdock_connectors::{
    CommandExecutor, NormalizedEvent, NotifyChannel, RealtimeChannel, TransportBridge,
};

use crate::config::Config;
use crate::consumer::BroadcastConsumer;
use crate::manager::ManagerHandle;
use crate::shell::ShellExecutor;
use crate::websocket::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let data_dir = paths::init_data_dir(config.data_dir.as_deref())?;
    paths::ensure_dirs()?;
    let logging = logging::init_logging(&paths::log_dir(), paths::log_file_name())?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %data_dir.display(),
        bind = %config.bind,
        "Starting workflowdock"
    );

    let executor: Arc<dyn CommandExecutor> = Arc::new(ShellExecutor::new(
        config.command_cwd(),
        config.command_timeout(),
    ));

    let mut bridges: Vec<Arc<dyn TransportBridge>> = Vec::new();
    let mut inbound: Vec<mpsc::Receiver<NormalizedEvent>> = Vec::new();

    if let Some(socket) = &config.notify_socket {
        match connect_notify(socket, executor.clone()).await {
            Ok((bridge, events)) => {
                info!(
                    component = "server",
                    event = "server.transport.connected",
                    transport = "notify",
                    socket = %socket.display(),
                );
                bridges.push(Arc::new(bridge));
                inbound.push(events);
            }
            Err(e) => warn!(
                component = "server",
                event = "server.transport.connect_failed",
                transport = "notify",
                socket = %socket.display(),
                error = %e,
                "Notify channel unavailable"
            ),
        }
    }

    if let Some(url) = &config.realtime_url {
        match RealtimeChannel::connect(url, config.realtime_channel.as_deref(), executor.clone())
            .await
        {
            Ok((bridge, events)) => {
                info!(
                    component = "server",
                    event = "server.transport.connected",
                    transport = "realtime",
                    url = %url,
                );
                bridges.push(Arc::new(bridge));
                inbound.push(events);
            }
            Err(e) => warn!(
                component = "server",
                event = "server.transport.connect_failed",
                transport = "realtime",
                url = %url,
                error = %e,
                "Real-time channel unavailable"
            ),
        }
    }

    if bridges.is_empty() {
        warn!(
            component = "server",
            event = "server.transport.none",
            "No transport channel connected; workflow starts will be refused"
        );
    }

    let (events, _) = broadcast::channel(1024);
    let consumer = Arc::new(BroadcastConsumer::new(events.clone()));
    let manager = ManagerHandle::spawn(bridges, consumer);
    for rx in inbound {
        manager.forward_events(rx);
    }
    if let Some(timeout) = config.session_timeout() {
        manager.spawn_idle_reaper(timeout);
    }

    let app = websocket::router(AppState { manager, events });

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %config.bind,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(
        component = "server",
        event = "server.stopped",
        "Server stopped"
    );
    Ok(())
}

#[cfg(unix)]
async fn connect_notify(
    path: &Path,
    executor: Arc<dyn CommandExecutor>,
) -> anyhow::Result<(NotifyChannel, mpsc::Receiver<NormalizedEvent>)> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    let (reader, writer) = stream.into_split();
    Ok(NotifyChannel::new(reader, writer, executor))
}

#[cfg(not(unix))]
async fn connect_notify(
    path: &Path,
    _executor: Arc<dyn CommandExecutor>,
) -> anyhow::Result<(NotifyChannel, mpsc::Receiver<NormalizedEvent>)> {
    anyhow::bail!("notify sockets are not supported on this platform: {}", path.display())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(
            component = "server",
            event = "server.shutdown_requested",
            "Shutdown requested"
        );
    }
}
