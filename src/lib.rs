//! Multiplexed ssh connection management and tmux session orchestration for
//! dashboards that watch several hosts at once.
//!
//! The crate is built in three layers:
//!
//! - [`connection`]: one ssh ControlMaster channel per host, addressed
//!   through a per-host socket. Nothing in this crate dials a host on its
//!   own; masters only come from interactive commands run in a terminal,
//!   where the user can answer auth prompts.
//! - [`tmux`]: local and remote tmux clients, the output parsers, and the
//!   session models they share. Remote file browsing rides the same
//!   multiplexed channel, with every path vetted by [`path`] first.
//! - [`orchestrator`]: cache-backed refresh fan-out over every registered
//!   host, bounded by a worker pool and reported to the consumer through an
//!   event channel.

pub mod cache;
pub mod config;
pub mod connection;
pub mod exec;
pub mod orchestrator;
pub mod path;
pub mod tmux;

pub use cache::{CacheState, SessionCache};
pub use config::OrchestratorConfig;
pub use connection::{ControlChannel, HostIdentity};
pub use exec::{CommandOutput, CommandRunner};
pub use orchestrator::{HostInventory, HostReport, RefreshEvent, RefreshOrchestrator};
pub use path::{validate_remote_path, PathRejection, ValidatedPath};
pub use tmux::{
    LocalTmuxClient, RemoteEntry, RemoteTmuxClient, SearchMode, Session, Window,
};
