//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Workflow session manager: bridges editor clients to a workflow backend.
#[derive(Debug, Clone, Parser)]
#[command(name = "workflowdock", version, about)]
pub struct Config {
    /// Address the editor-facing WebSocket server listens on
    #[arg(long, env = "WORKFLOWDOCK_BIND", default_value = "127.0.0.1:4100")]
    pub bind: SocketAddr,

    /// Data directory for logs (default: ~/.workflowdock)
    #[arg(long, env = "WORKFLOWDOCK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Unix socket of the intermediary's notify/request channel
    #[arg(long, env = "WORKFLOWDOCK_NOTIFY_SOCKET")]
    pub notify_socket: Option<PathBuf>,

    /// WebSocket URL of the intermediary's real-time channel
    #[arg(long, env = "WORKFLOWDOCK_REALTIME_URL")]
    pub realtime_url: Option<String>,

    /// Channel to subscribe to on the real-time connection
    #[arg(long, env = "WORKFLOWDOCK_REALTIME_CHANNEL")]
    pub realtime_channel: Option<String>,

    /// Stop sessions with no activity for this many seconds
    #[arg(long, env = "WORKFLOWDOCK_SESSION_TIMEOUT_SECS")]
    pub session_timeout_secs: Option<u64>,

    /// Time limit for commands the backend asks us to run
    #[arg(long, env = "WORKFLOWDOCK_COMMAND_TIMEOUT_SECS", default_value_t = 120)]
    pub command_timeout_secs: u64,

    /// Working directory for backend commands (default: current directory)
    #[arg(long, env = "WORKFLOWDOCK_COMMAND_CWD")]
    pub command_cwd: Option<PathBuf>,
}

impl Config {
    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn command_cwd(&self) -> PathBuf {
        self.command_cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
