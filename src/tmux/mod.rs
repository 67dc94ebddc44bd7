//! tmux session models and the local/remote clients that produce them.

mod local;
mod parse;
mod remote;

pub use local::LocalTmuxClient;
pub use parse::{
    parse_session_line, parse_sessions_output, parse_window_line, parse_windows_output,
    SESSION_FORMAT, WINDOW_FORMAT,
};
pub use remote::{RemoteEntry, RemoteTmuxClient, SearchMode};

use serde::{Deserialize, Serialize};

/// One tmux window inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// Window index within its session
    pub index: usize,
    /// Window name
    pub name: String,
    /// Whether this is the session's active window
    pub active: bool,
}

/// One tmux session on a local or remote host.
///
/// Snapshots are rebuilt wholesale on every fetch; `windows` is filled in
/// right after parsing, never merged into an older copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session name
    pub name: String,
    /// Number of windows reported by tmux
    pub window_count: usize,
    /// Whether any client is attached
    pub attached: bool,
    /// Ordered window list
    #[serde(default)]
    pub windows: Vec<Window>,
}

impl Session {
    pub fn new(name: &str, window_count: usize, attached: bool) -> Self {
        Self {
            name: name.to_string(),
            window_count,
            attached,
            windows: Vec::new(),
        }
    }
}

/// Session names collide with tmux target syntax if they contain `:` or `.`.
fn valid_session_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(':') && !name.contains('.')
}
