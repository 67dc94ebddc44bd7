use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::exec::{CommandOutput, CommandRunner, ProcessRunner, TMUX_TIMEOUT};

use super::parse::{parse_sessions_output, parse_windows_output, SESSION_FORMAT, WINDOW_FORMAT};
use super::{Session, Window};

/// Set when running inside a Flatpak sandbox; host commands must then go
/// through `flatpak-spawn --host`.
static FLATPAK: Lazy<bool> = Lazy::new(|| Path::new("/.flatpak-info").exists());

/// Client for the tmux server on the local machine.
///
/// Local calls are cheap and must reflect truth instantly, so nothing here
/// is cached.
pub struct LocalTmuxClient {
    runner: Arc<dyn CommandRunner>,
    tmux_path: Option<PathBuf>,
    flatpak: bool,
}

impl LocalTmuxClient {
    pub fn new() -> Self {
        let flatpak = *FLATPAK;
        let tmux_path = if flatpak {
            // The sandbox cannot see the host PATH; resolution happens on
            // the host side of flatpak-spawn.
            Some(PathBuf::from("tmux"))
        } else {
            which::which("tmux").ok()
        };
        if tmux_path.is_none() {
            debug!("tmux not found on PATH, local client disabled");
        }
        Self {
            runner: Arc::new(ProcessRunner),
            tmux_path,
            flatpak,
        }
    }

    /// Client with an injected runner (tests).
    #[cfg(test)]
    pub fn with_runner(runner: Arc<dyn CommandRunner>, flatpak: bool) -> Self {
        Self {
            runner,
            tmux_path: Some(PathBuf::from("tmux")),
            flatpak,
        }
    }

    pub fn is_available(&self) -> bool {
        self.tmux_path.is_some()
    }

    fn tmux_argv(&self, args: &[&str]) -> Vec<String> {
        let mut argv: Vec<String> = if self.flatpak {
            vec![
                "flatpak-spawn".to_string(),
                "--host".to_string(),
                "tmux".to_string(),
            ]
        } else {
            let tmux = match &self.tmux_path {
                Some(path) => path.display().to_string(),
                None => "tmux".to_string(),
            };
            vec![tmux]
        };
        argv.extend(args.iter().map(|arg| arg.to_string()));
        argv
    }

    async fn run_tmux(&self, args: &[&str]) -> CommandOutput {
        self.runner.run(&self.tmux_argv(args), TMUX_TIMEOUT).await
    }

    /// Whether a tmux server is currently running for this user.
    pub async fn has_server(&self) -> bool {
        if !self.is_available() {
            return false;
        }
        self.run_tmux(&["has-session"]).await.success()
    }

    /// All local sessions with their windows attached. Empty when no server
    /// is running.
    pub async fn list_sessions(&self) -> Vec<Session> {
        if !self.has_server().await {
            return Vec::new();
        }

        let output = self
            .run_tmux(&["list-sessions", "-F", SESSION_FORMAT])
            .await;
        if !output.success() {
            return Vec::new();
        }

        let mut sessions = parse_sessions_output(&output.stdout);
        for session in &mut sessions {
            session.windows = self.list_windows(&session.name).await;
        }
        sessions
    }

    async fn list_windows(&self, session_name: &str) -> Vec<Window> {
        let output = self
            .run_tmux(&["list-windows", "-t", session_name, "-F", WINDOW_FORMAT])
            .await;
        if !output.success() {
            return Vec::new();
        }
        parse_windows_output(&output.stdout)
    }

    /// Create a detached session. Names containing `:` or `.` are refused.
    pub async fn create_session(&self, name: &str) -> bool {
        if !self.is_available() || !super::valid_session_name(name) {
            return false;
        }
        self.run_tmux(&["new-session", "-d", "-s", name])
            .await
            .success()
    }

    pub async fn kill_session(&self, name: &str) -> bool {
        if !self.is_available() {
            return false;
        }
        self.run_tmux(&["kill-session", "-t", name]).await.success()
    }

    pub async fn rename_session(&self, old_name: &str, new_name: &str) -> bool {
        if !self.is_available() || new_name.is_empty() {
            return false;
        }
        self.run_tmux(&["rename-session", "-t", old_name, new_name])
            .await
            .success()
    }

    pub async fn rename_window(
        &self,
        session_name: &str,
        window_index: usize,
        new_name: &str,
    ) -> bool {
        if !self.is_available() || new_name.is_empty() {
            return false;
        }
        let target = format!("{session_name}:{window_index}");
        self.run_tmux(&["rename-window", "-t", &target, new_name])
            .await
            .success()
    }

    pub async fn create_window(&self, session_name: &str, window_name: Option<&str>) -> bool {
        if !self.is_available() {
            return false;
        }
        let mut args = vec!["new-window", "-t", session_name];
        if let Some(name) = window_name {
            args.extend(["-n", name]);
        }
        self.run_tmux(&args).await.success()
    }

    /// Ask the shell in a window to exit, letting its processes shut down,
    /// rather than killing the window outright.
    pub async fn exit_window(&self, session_name: &str, window_index: usize) -> bool {
        if !self.is_available() {
            return false;
        }
        let target = format!("{session_name}:{window_index}");
        self.run_tmux(&["send-keys", "-t", &target, "exit", "Enter"])
            .await
            .success()
    }

    /// Split the active pane side by side, or a specific pane when a target
    /// is given.
    pub async fn split_horizontal(&self, target: Option<&str>) -> bool {
        self.split("-h", target).await
    }

    /// Split the active pane top over bottom.
    pub async fn split_vertical(&self, target: Option<&str>) -> bool {
        self.split("-v", target).await
    }

    async fn split(&self, direction: &str, target: Option<&str>) -> bool {
        if !self.is_available() {
            return false;
        }
        let mut args = vec!["split-window", direction];
        if let Some(target) = target {
            args.extend(["-t", target]);
        }
        self.run_tmux(&args).await.success()
    }

    pub async fn swap_windows(
        &self,
        session_name: &str,
        src_index: usize,
        dst_index: usize,
    ) -> bool {
        if !self.is_available() {
            return false;
        }
        let src = format!("{session_name}:{src_index}");
        let dst = format!("{session_name}:{dst_index}");
        self.run_tmux(&["swap-window", "-s", &src, "-t", &dst])
            .await
            .success()
    }

    /// Argv a terminal widget spawns to attach to a session, or to one of
    /// its windows. Builds the command only; nothing is executed.
    pub fn attach_command(&self, session_name: &str, window_index: Option<usize>) -> Vec<String> {
        let target = match window_index {
            Some(index) => format!("{session_name}:{index}"),
            None => session_name.to_string(),
        };

        if self.flatpak {
            vec![
                "flatpak-spawn".to_string(),
                "--host".to_string(),
                "--env=TERM=xterm-256color".to_string(),
                "tmux".to_string(),
                "attach-session".to_string(),
                "-t".to_string(),
                target,
            ]
        } else {
            vec![
                "tmux".to_string(),
                "attach-session".to_string(),
                "-t".to_string(),
                target,
            ]
        }
    }
}

impl Default for LocalTmuxClient {
    fn default() -> Self {
        Self::new()
    }
}
