//! Local command execution on behalf of the backend.
//!
//! The intermediary may ask us to run a command (tests, linters) in the
//! workspace. Output is captured and returned as one combined string.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};
use workflowdock_connectors::CommandExecutor;
use workflowdock_protocol::{CommandRequest, CommandResult};

/// Result of a shell command execution
pub struct ShellResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl ShellResult {
    fn into_command_result(self) -> CommandResult {
        let output = match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout,
            (true, false) => self.stderr,
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        };
        CommandResult {
            exit_code: self.exit_code.unwrap_or(-1),
            output,
        }
    }
}

/// Execute a command with timeout.
///
/// With no `args`, `command` is a shell line run via `sh -c`. Otherwise the
/// program is spawned directly with the given arguments.
pub async fn execute(command: &str, args: &[String], cwd: &str, timeout: Duration) -> ShellResult {
    let start = Instant::now();

    let result = tokio::time::timeout(timeout, run_command(command, args, cwd)).await;

    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok((stdout, stderr, exit_code))) => ShellResult {
            stdout,
            stderr,
            exit_code: Some(exit_code),
            duration_ms,
        },
        Ok(Err(e)) => ShellResult {
            stdout: String::new(),
            stderr: format!("Failed to execute command: {e}"),
            exit_code: None,
            duration_ms,
        },
        Err(_) => ShellResult {
            stdout: String::new(),
            stderr: format!("Command timed out after {}s", timeout.as_secs()),
            exit_code: None,
            duration_ms,
        },
    }
}

async fn run_command(
    command: &str,
    args: &[String],
    cwd: &str,
) -> Result<(String, String, i32), std::io::Error> {
    let mut cmd = if args.is_empty() {
        let mut sh = Command::new("sh");
        sh.arg("-c").arg(command);
        sh
    } else {
        let mut direct = Command::new(command);
        direct.args(args);
        direct
    };
    let output = cmd.current_dir(cwd).kill_on_drop(true).output().await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let exit_code = output.status.code().unwrap_or(-1);

    Ok((stdout, stderr, exit_code))
}

/// [`CommandExecutor`] backed by local processes
pub struct ShellExecutor {
    default_cwd: PathBuf,
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(default_cwd: PathBuf, timeout: Duration) -> Self {
        Self {
            default_cwd,
            timeout,
        }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, request: CommandRequest) -> CommandResult {
        let cwd = request
            .cwd
            .clone()
            .unwrap_or_else(|| self.default_cwd.to_string_lossy().into_owned());

        let result = execute(&request.command, &request.args, &cwd, self.timeout).await;
        if result.exit_code.is_none() {
            warn!(
                component = "shell",
                event = "shell.command.failed",
                command = %request.command,
                cwd = %cwd,
                duration_ms = result.duration_ms,
                error = %result.stderr,
                "Backend command did not complete"
            );
        } else {
            info!(
                component = "shell",
                event = "shell.command.completed",
                command = %request.command,
                cwd = %cwd,
                exit_code = result.exit_code.unwrap_or(-1),
                duration_ms = result.duration_ms,
            );
        }
        result.into_command_result()
    }
}
