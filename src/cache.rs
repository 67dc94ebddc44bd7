use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::connection::HostIdentity;
use crate::tmux::Session;

struct CacheEntry {
    sessions: Vec<Session>,
    fetched_at: Instant,
}

/// Where a host's cache entry stands relative to the TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Never fetched, or invalidated.
    Empty,
    /// Within the TTL; serve without fetching.
    Fresh,
    /// Past the TTL; still held, but a read must refetch first.
    Stale,
}

/// Per-host session snapshots with a fixed TTL.
///
/// Entries are replaced wholesale. A failed fetch never touches the old
/// entry, so readers keep the last good snapshot until a fetch succeeds or
/// the host is invalidated.
pub struct SessionCache {
    entries: HashMap<HostIdentity, CacheEntry>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Snapshot for `identity` if it is still fresh at `now`.
    pub fn get(&self, identity: &HostIdentity, now: Instant) -> Option<&[Session]> {
        let entry = self.entries.get(identity)?;
        if now.duration_since(entry.fetched_at) < self.ttl {
            Some(&entry.sessions)
        } else {
            None
        }
    }

    /// Replace the snapshot for `identity` wholesale. The freshness clock
    /// never rewinds when results land out of order.
    pub fn refresh(&mut self, identity: HostIdentity, sessions: Vec<Session>, now: Instant) {
        let fetched_at = match self.entries.get(&identity) {
            Some(entry) if entry.fetched_at > now => entry.fetched_at,
            _ => now,
        };
        self.entries.insert(
            identity,
            CacheEntry {
                sessions,
                fetched_at,
            },
        );
    }

    /// Drop the snapshot so the next read forces a fetch.
    pub fn invalidate(&mut self, identity: &HostIdentity) {
        if self.entries.remove(identity).is_some() {
            debug!("session cache invalidated for {identity}");
        }
    }

    pub fn state(&self, identity: &HostIdentity, now: Instant) -> CacheState {
        match self.entries.get(identity) {
            None => CacheState::Empty,
            Some(entry) if now.duration_since(entry.fetched_at) < self.ttl => CacheState::Fresh,
            Some(_) => CacheState::Stale,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
