use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::connection::{ControlChannel, HostIdentity};
use crate::exec::{
    shell_quote, CommandOutput, CommandRunner, ProcessRunner, SEARCH_TIMEOUT, SHELL_TIMEOUT,
    TMUX_TIMEOUT, TRANSFER_TIMEOUT,
};
use crate::path::{is_safe_for_deletion, ValidatedPath};

use super::parse::{parse_sessions_output, parse_windows_output, SESSION_FORMAT, WINDOW_FORMAT};
use super::Session;

/// One entry from a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub hidden: bool,
}

/// What `search_files` matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Substring of the file name; hidden trees are skipped.
    Name,
    /// Line content inside files, case-insensitive.
    Content,
}

/// tmux and shell access to one remote host over a multiplexed ssh channel.
///
/// Every command here rides an existing control master; nothing in this
/// client ever dials out, so no call can hang on an auth prompt. Masters are
/// only created by the interactive commands built with [`attach_command`]
/// and [`new_session_command`], which run in a terminal where the user can
/// answer prompts.
///
/// [`attach_command`]: RemoteTmuxClient::attach_command
/// [`new_session_command`]: RemoteTmuxClient::new_session_command
pub struct RemoteTmuxClient {
    channel: ControlChannel,
    runner: Arc<dyn CommandRunner>,
}

impl RemoteTmuxClient {
    pub fn new(identity: HostIdentity) -> Result<Self> {
        Ok(Self {
            channel: ControlChannel::new(identity)?,
            runner: Arc::new(ProcessRunner),
        })
    }

    /// Client with an injected channel and runner (tests).
    #[cfg(test)]
    pub fn with_runner(channel: ControlChannel, runner: Arc<dyn CommandRunner>) -> Self {
        Self { channel, runner }
    }

    pub fn identity(&self) -> &HostIdentity {
        self.channel.identity()
    }

    /// Whether the control master answers `ssh -O check`.
    pub async fn is_connected(&self) -> bool {
        self.channel.is_alive(self.runner.as_ref()).await
    }

    /// Run a shell command through the multiplexed channel. Short-circuits
    /// when the master socket is gone so a dead host costs nothing and no
    /// background call can trigger an auth prompt.
    async fn run_shell(&self, command: &str, timeout: Duration) -> CommandOutput {
        if !self.channel.socket_exists() {
            return CommandOutput::no_connection();
        }
        let mut argv = self.channel.base_argv();
        argv.push(command.to_string());
        self.runner.run(&argv, timeout).await
    }

    /// Run tmux remotely with every argument singly quoted.
    async fn run_tmux(&self, args: &[&str]) -> CommandOutput {
        let quoted: Vec<String> = args.iter().map(|arg| shell_quote(arg)).collect();
        let command = format!("tmux {}", quoted.join(" "));
        self.run_shell(&command, TMUX_TIMEOUT).await
    }

    /// Probe for tmux on the remote host.
    pub async fn is_tmux_available(&self) -> bool {
        if !self.is_connected().await {
            return false;
        }
        let output = self.run_shell("command -v tmux", TMUX_TIMEOUT).await;
        let available = output.success() && output.stdout.contains("tmux");
        if !available {
            warn!("tmux not found on {}", self.channel.identity());
        }
        available
    }

    pub async fn has_server(&self) -> bool {
        if !self.is_connected().await {
            return false;
        }
        self.run_tmux(&["has-session"]).await.success()
    }

    /// All sessions with their windows attached, or `None` when the fetch
    /// failed and the caller should keep whatever snapshot it already has.
    /// A host whose tmux server simply is not running yields `Some(empty)`.
    pub async fn fetch_sessions(&self) -> Option<Vec<Session>> {
        let output = self
            .run_tmux(&["list-sessions", "-F", SESSION_FORMAT])
            .await;
        if !output.success() {
            if output.stderr.contains("no server running") {
                return Some(Vec::new());
            }
            return None;
        }

        let mut sessions = parse_sessions_output(&output.stdout);
        for session in &mut sessions {
            let windows = self
                .run_tmux(&["list-windows", "-t", &session.name, "-F", WINDOW_FORMAT])
                .await;
            if windows.success() {
                session.windows = parse_windows_output(&windows.stdout);
            }
        }
        Some(sessions)
    }

    /// Create a detached session. Names containing `:` or `.` are refused.
    pub async fn create_session(&self, name: &str) -> bool {
        if !super::valid_session_name(name) {
            return false;
        }
        self.run_tmux(&["new-session", "-d", "-s", name])
            .await
            .success()
    }

    pub async fn kill_session(&self, name: &str) -> bool {
        self.run_tmux(&["kill-session", "-t", name]).await.success()
    }

    pub async fn rename_session(&self, old_name: &str, new_name: &str) -> bool {
        if new_name.is_empty() {
            return false;
        }
        self.run_tmux(&["rename-session", "-t", old_name, new_name])
            .await
            .success()
    }

    pub async fn create_window(&self, session_name: &str, window_name: Option<&str>) -> bool {
        let mut args = vec!["new-window", "-t", session_name];
        if let Some(name) = window_name {
            args.extend(["-n", name]);
        }
        self.run_tmux(&args).await.success()
    }

    /// Interactive argv that attaches to a session, or to one of its
    /// windows, in a terminal. Allocates a TTY, and lets
    /// `ControlMaster=auto` establish the channel if none exists yet.
    pub fn attach_command(&self, session_name: &str, window_index: Option<usize>) -> Vec<String> {
        let target = match window_index {
            Some(index) => format!("{session_name}:{index}"),
            None => session_name.to_string(),
        };
        let mut argv = self.channel.interactive_argv();
        argv.push(format!("tmux attach-session -t {}", shell_quote(&target)));
        argv
    }

    /// Interactive argv that attaches to session `name`, creating it first
    /// when missing.
    pub fn new_session_command(&self, name: &str) -> Vec<String> {
        let mut argv = self.channel.interactive_argv();
        argv.push(format!("tmux new-session -A -s {}", shell_quote(name)));
        argv
    }

    /// Tear down the control channel for this host.
    pub async fn close_connection(&self, force: bool) {
        self.channel.close(self.runner.as_ref(), force).await;
    }

    /// Remote `$HOME`, or `None` when it cannot be determined.
    pub async fn home_dir(&self) -> Option<String> {
        if !self.is_connected().await {
            return None;
        }
        let output = self.run_shell("echo $HOME", SHELL_TIMEOUT).await;
        if !output.success() {
            return None;
        }
        let home = output.stdout.trim();
        if home.is_empty() {
            None
        } else {
            Some(home.to_string())
        }
    }

    /// List a remote directory, or `None` when the host is unreachable or
    /// the listing failed. Directories sort before files, each group
    /// case-insensitively by name.
    pub async fn list_dir(&self, path: &ValidatedPath) -> Option<Vec<RemoteEntry>> {
        if !self.is_connected().await {
            return None;
        }
        let command = format!("ls -Al {} 2>&1", path.quoted());
        let output = self.run_shell(&command, SHELL_TIMEOUT).await;
        if !output.success() {
            warn!(
                "listing {} on {} failed: {}",
                path.as_str(),
                self.channel.identity(),
                output.stderr.trim()
            );
            return None;
        }

        let mut entries: Vec<RemoteEntry> =
            output.stdout.lines().filter_map(parse_ls_line).collect();
        entries.sort_by_key(|entry| (!entry.is_dir, entry.name.to_lowercase()));
        Some(entries)
    }

    pub async fn file_exists(&self, path: &ValidatedPath) -> bool {
        self.probe("test -e", path).await
    }

    pub async fn is_dir(&self, path: &ValidatedPath) -> bool {
        self.probe("test -d", path).await
    }

    async fn probe(&self, test: &str, path: &ValidatedPath) -> bool {
        if !self.is_connected().await {
            return false;
        }
        let command = format!("{test} {} && echo yes || echo no", path.quoted());
        let output = self.run_shell(&command, SHELL_TIMEOUT).await;
        output.success() && output.stdout.contains("yes")
    }

    pub async fn rename_path(&self, from: &ValidatedPath, to: &ValidatedPath) -> bool {
        if !self.is_connected().await {
            return false;
        }
        let command = format!("mv {} {}", from.quoted(), to.quoted());
        let output = self.run_shell(&command, SHELL_TIMEOUT).await;
        if !output.success() {
            error!(
                "rename on {} failed: {}",
                self.channel.identity(),
                output.stderr.trim()
            );
        }
        output.success()
    }

    /// Delete a file or directory tree. Roots like `/home` and `/tmp` are
    /// refused here even though they are browsable.
    pub async fn delete_path(&self, path: &ValidatedPath) -> bool {
        if let Err(rejection) = is_safe_for_deletion(path.as_str()) {
            warn!(
                "refusing to delete {} on {}: {}",
                path.as_str(),
                self.channel.identity(),
                rejection
            );
            return false;
        }
        if !self.is_connected().await {
            return false;
        }
        let command = format!("rm -rf {}", path.quoted());
        let output = self.run_shell(&command, SHELL_TIMEOUT).await;
        if output.success() {
            info!("deleted {} on {}", path.as_str(), self.channel.identity());
        } else {
            error!(
                "deleting {} on {} failed: {}",
                path.as_str(),
                self.channel.identity(),
                output.stderr.trim()
            );
        }
        output.success()
    }

    pub async fn create_directory(&self, path: &ValidatedPath) -> bool {
        if !self.is_connected().await {
            return false;
        }
        let command = format!("mkdir -p {}", path.quoted());
        self.run_shell(&command, SHELL_TIMEOUT).await.success()
    }

    pub async fn copy_path(&self, from: &ValidatedPath, to: &ValidatedPath) -> bool {
        if !self.is_connected().await {
            return false;
        }
        let command = format!("cp -r {} {}", from.quoted(), to.quoted());
        self.run_shell(&command, SHELL_TIMEOUT).await.success()
    }

    /// Copy one remote file to the local filesystem over the multiplexed
    /// channel.
    pub async fn download_file(&self, remote: &ValidatedPath, local: &Path) -> bool {
        if !self.is_connected().await {
            return false;
        }
        let argv = self.channel.scp_argv(remote.as_str(), local);
        let output = self.runner.run(&argv, TRANSFER_TIMEOUT).await;
        if !output.success() {
            error!(
                "download from {} failed: {}",
                self.channel.identity(),
                output.stderr.trim()
            );
        }
        output.success()
    }

    /// Find files under `root` by name or content. Results are full remote
    /// paths, capped at 100.
    pub async fn search_files(
        &self,
        root: &ValidatedPath,
        query: &str,
        mode: SearchMode,
    ) -> Vec<String> {
        if query.is_empty() || !self.is_connected().await {
            return Vec::new();
        }
        let command = match mode {
            SearchMode::Name => format!(
                "find {} -name {} -not -path {} 2>/dev/null | head -100",
                root.quoted(),
                shell_quote(&format!("*{query}*")),
                shell_quote("*/.*"),
            ),
            SearchMode::Content => format!(
                "grep -r -l -i {} {} 2>/dev/null | head -100",
                shell_quote(query),
                root.quoted(),
            ),
        };
        let output = self.run_shell(&command, SEARCH_TIMEOUT).await;
        if !output.success() {
            return Vec::new();
        }
        output
            .stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.to_string())
            .collect()
    }
}

/// Parse one `ls -Al` line: eight metadata fields, then the name (which may
/// itself contain spaces). Some ls variants emit seven metadata fields, so
/// the name position falls back once. Symlink targets are stripped.
fn parse_ls_line(line: &str) -> Option<RemoteEntry> {
    if line.is_empty() || line.starts_with("total ") {
        return None;
    }

    let perms = line.split_whitespace().next()?;
    let mut name = skip_fields(line, 8).or_else(|| skip_fields(line, 7))?;
    if let Some(idx) = name.find(" -> ") {
        name = &name[..idx];
    }
    if name == "." || name == ".." {
        return None;
    }

    Some(RemoteEntry {
        name: name.to_string(),
        is_dir: perms.starts_with('d'),
        hidden: name.starts_with('.'),
    })
}

/// Whatever follows the first `count` whitespace-separated fields, or `None`
/// when the line is too short.
fn skip_fields(line: &str, count: usize) -> Option<&str> {
    let mut remainder = line;
    for _ in 0..count {
        remainder = remainder.trim_start();
        let end = remainder.find(char::is_whitespace)?;
        remainder = &remainder[end..];
    }
    let rest = remainder.trim_start();
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}
