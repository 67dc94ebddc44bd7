use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::exec::{CommandRunner, LIVENESS_TIMEOUT};

/// The `(host, user, port)` key identifying one remote target.
///
/// Immutable once created; the map key for connections and cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostIdentity {
    pub host: String,
    pub user: String,
    pub port: u16,
}

impl HostIdentity {
    pub fn new(host: &str, user: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            port,
        }
    }

    /// The `user@host` destination ssh expects.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// File name of this identity's control socket.
    pub fn socket_file_name(&self) -> String {
        format!("{}@{}-{}", self.user, self.host, self.port)
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Per-user directory holding one control socket per remote host. Created
/// on demand.
pub fn control_socket_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not resolve home directory")?;
    let dir = home.join(".ssh").join("muxdeck-sockets");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create socket directory {}", dir.display()))?;
    Ok(dir)
}

/// Handle on one host's multiplexed SSH control connection.
///
/// Holds the socket path and builds every ssh/scp argv that talks through
/// it. Never dials: masters are only created by the interactive commands the
/// user runs in a terminal (`ControlMaster=auto`), so background queries can
/// never trigger an auth prompt.
#[derive(Debug)]
pub struct ControlChannel {
    identity: HostIdentity,
    socket_path: PathBuf,
}

impl ControlChannel {
    /// Resolve the deterministic socket path for this identity, creating the
    /// socket directory if needed.
    pub fn new(identity: HostIdentity) -> Result<Self> {
        let socket_path = control_socket_dir()?.join(identity.socket_file_name());
        debug!(
            "control channel for {} at {}",
            identity,
            socket_path.display()
        );
        Ok(Self {
            identity,
            socket_path,
        })
    }

    /// Channel with an explicit socket path (tests, nonstandard layouts).
    pub fn with_socket_path(identity: HostIdentity, socket_path: PathBuf) -> Self {
        Self {
            identity,
            socket_path,
        }
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Cheap precondition used before every command: does the socket file
    /// exist? Not proof of life on its own; see [`ControlChannel::is_alive`].
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    fn control_path_option(&self) -> String {
        format!("ControlPath={}", self.socket_path.display())
    }

    /// Base argv for non-interactive commands through an existing master.
    pub fn base_argv(&self) -> Vec<String> {
        vec![
            "ssh".to_string(),
            "-p".to_string(),
            self.identity.port.to_string(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-o".to_string(),
            self.control_path_option(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=2".to_string(),
            self.identity.destination(),
        ]
    }

    /// Liveness probe argv. `-O` operations address the master purely
    /// through its socket, so no port is passed.
    pub fn check_argv(&self) -> Vec<String> {
        vec![
            "ssh".to_string(),
            "-O".to_string(),
            "check".to_string(),
            "-o".to_string(),
            self.control_path_option(),
            self.identity.destination(),
        ]
    }

    /// Teardown argv (`ssh -O exit`).
    pub fn exit_argv(&self) -> Vec<String> {
        vec![
            "ssh".to_string(),
            "-O".to_string(),
            "exit".to_string(),
            "-o".to_string(),
            self.control_path_option(),
            self.identity.destination(),
        ]
    }

    /// Base argv for interactive attach/new-session commands; the one place
    /// a master may be created.
    pub fn interactive_argv(&self) -> Vec<String> {
        vec![
            "ssh".to_string(),
            "-p".to_string(),
            self.identity.port.to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            self.control_path_option(),
            "-o".to_string(),
            "ControlPersist=600".to_string(),
            "-t".to_string(),
            self.identity.destination(),
        ]
    }

    /// scp argv for downloading one remote file over the master.
    pub fn scp_argv(&self, remote_path: &str, local_path: &Path) -> Vec<String> {
        vec![
            "scp".to_string(),
            "-P".to_string(),
            self.identity.port.to_string(),
            "-o".to_string(),
            self.control_path_option(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            format!("{}:{}", self.identity.destination(), remote_path),
            local_path.display().to_string(),
        ]
    }

    /// True only if the socket file exists AND `ssh -O check` answers within
    /// the liveness budget. A stale socket left by a crashed master fails
    /// the second half.
    pub async fn is_alive(&self, runner: &dyn CommandRunner) -> bool {
        if !self.socket_exists() {
            return false;
        }
        runner
            .run(&self.check_argv(), LIVENESS_TIMEOUT)
            .await
            .success()
    }

    /// Best-effort teardown: ask the master to exit; with `force`, remove a
    /// socket file that survived. Never fails.
    pub async fn close(&self, runner: &dyn CommandRunner, force: bool) {
        if !self.socket_exists() {
            return;
        }

        info!("closing ssh control connection to {}", self.identity);
        let output = runner.run(&self.exit_argv(), LIVENESS_TIMEOUT).await;
        if !output.success() {
            debug!(
                "ssh -O exit for {}: {}",
                self.identity,
                output.stderr.trim()
            );
        }

        if force && self.socket_exists() {
            if let Err(err) = std::fs::remove_file(&self.socket_path) {
                debug!(
                    "failed to remove control socket {}: {}",
                    self.socket_path.display(),
                    err
                );
            }
        }
    }
}
