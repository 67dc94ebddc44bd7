use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the refresh orchestrator.
///
/// Defaults are sized for interactive dashboards: a handful of hosts kept
/// live without flooding any of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent host fetches per batch
    pub worker_limit: usize,
    /// How long a cached snapshot stays fresh
    pub cache_ttl: Duration,
    /// Quiet window that coalesces bursty refresh requests
    pub debounce: Duration,
    /// Delay between convergence poll attempts
    pub poll_interval: Duration,
    /// Convergence poll attempts before giving up
    pub poll_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_limit: 3,
            cache_ttl: Duration::from_secs(5),
            debounce: Duration::from_millis(150),
            poll_interval: Duration::from_secs(2),
            poll_attempts: 120,
        }
    }
}
