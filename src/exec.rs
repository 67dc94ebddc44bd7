use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Time budget for `ssh -O` liveness and teardown probes.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);
/// Time budget for tmux control commands (list/create/rename/kill).
pub const TMUX_TIMEOUT: Duration = Duration::from_secs(3);
/// Time budget for generic remote shell commands.
pub const SHELL_TIMEOUT: Duration = Duration::from_secs(5);
/// Time budget for remote find/grep searches.
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Time budget for scp file transfers.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of one executed command, local or remote.
///
/// Failures are values, not errors: a refused command carries the sentinel
/// stderr `"no connection"`, an expired one `"timeout"`, so callers can
/// degrade without special-casing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Sentinel for commands refused because no control socket exists.
    pub fn no_connection() -> Self {
        Self::failure("no connection")
    }

    /// Sentinel for commands that exceeded their time budget.
    pub fn timed_out() -> Self {
        Self::failure("timeout")
    }
}

/// Quote a value for a POSIX shell: wrap in single quotes, escape any
/// embedded single quote as `'\''`. Always quotes, even when the value
/// looks harmless.
pub fn shell_quote(value: &str) -> String {
    let escaped = value.replace('\'', "'\\''");
    format!("'{escaped}'")
}

/// Runs a single argv under a time budget.
///
/// The seam between the clients and the operating system; tests swap in a
/// scripted runner instead of spawning real processes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String], timeout: Duration) -> CommandOutput;
}

/// Production runner backed by `tokio::process`.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String], timeout: Duration) -> CommandOutput {
        let (program, args) = match argv.split_first() {
            Some(parts) => parts,
            None => return CommandOutput::failure("empty command"),
        };

        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);

        match tokio::time::timeout(timeout, command.output()).await {
            Err(_) => CommandOutput::timed_out(),
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {
                CommandOutput::failure(format!("{program}: not found"))
            }
            Ok(Err(err)) => CommandOutput::failure(err.to_string()),
            Ok(Ok(output)) => CommandOutput {
                exit_code: output.status.code().unwrap_or(1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
        }
    }
}
