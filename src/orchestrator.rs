use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::{CacheState, SessionCache};
use crate::config::OrchestratorConfig;
use crate::connection::HostIdentity;
use crate::tmux::{RemoteTmuxClient, Session};

/// What one refresh learned about a host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostInventory {
    /// tmux answered, possibly with zero sessions.
    Sessions(Vec<Session>),
    /// The channel is up but the host has no tmux binary.
    NoTmux,
    /// No live control channel, or the host stopped answering.
    Unreachable,
}

/// Inventory for one host out of a refresh batch.
#[derive(Debug, Clone, PartialEq)]
pub struct HostReport {
    pub identity: HostIdentity,
    pub inventory: HostInventory,
}

/// Events delivered to the consumer driving a UI.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshEvent {
    /// One full fan-out finished; a slow host delays the event rather than
    /// splitting it.
    BatchCompleted(Vec<HostReport>),
    /// A convergence poll found sessions on a host.
    HostConverged {
        identity: HostIdentity,
        sessions: Vec<Session>,
    },
}

/// Coordinates session refreshes across every registered host.
///
/// Fetches fan out on worker tasks, but the cache and client registry are
/// only written from the consumer side (via [`absorb`] and the mutation
/// methods), so UI state never races a background batch. Background work
/// reports through the event channel handed out by [`new`].
///
/// [`absorb`]: RefreshOrchestrator::absorb
/// [`new`]: RefreshOrchestrator::new
pub struct RefreshOrchestrator {
    config: OrchestratorConfig,
    clients: HashMap<HostIdentity, Arc<RemoteTmuxClient>>,
    cache: SessionCache,
    limiter: Arc<Semaphore>,
    closing: Arc<AtomicBool>,
    events: UnboundedSender<RefreshEvent>,
    pending_refresh: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
}

impl RefreshOrchestrator {
    pub fn new(config: OrchestratorConfig) -> (Self, UnboundedReceiver<RefreshEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            limiter: Arc::new(Semaphore::new(config.worker_limit)),
            cache: SessionCache::new(config.cache_ttl),
            config,
            clients: HashMap::new(),
            closing: Arc::new(AtomicBool::new(false)),
            events,
            pending_refresh: None,
            poll_task: None,
        };
        (orchestrator, rx)
    }

    /// One shared client per host, created on first use and reused for
    /// every later operation so all of them ride the same control channel.
    pub fn client_for(&mut self, identity: &HostIdentity) -> Result<Arc<RemoteTmuxClient>> {
        if let Some(client) = self.clients.get(identity) {
            return Ok(client.clone());
        }
        debug!("creating remote client for {identity}");
        let client = Arc::new(RemoteTmuxClient::new(identity.clone())?);
        self.clients.insert(identity.clone(), client.clone());
        Ok(client)
    }

    /// Seed the registry with a ready-made client.
    pub fn register_client(&mut self, client: Arc<RemoteTmuxClient>) {
        self.clients.insert(client.identity().clone(), client);
    }

    pub fn hosts(&self) -> Vec<HostIdentity> {
        self.clients.keys().cloned().collect()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn cache_state(&self, identity: &HostIdentity) -> CacheState {
        self.cache.state(identity, Instant::now())
    }

    /// Sessions for one host, served from cache while fresh. A failed fetch
    /// yields the empty list and leaves the previous snapshot in place.
    pub async fn list_sessions(&mut self, identity: &HostIdentity) -> Result<Vec<Session>> {
        let client = self.client_for(identity)?;
        if let Some(held) = self.cache.get(identity, Instant::now()) {
            return Ok(held.to_vec());
        }
        match client.fetch_sessions().await {
            Some(sessions) => {
                self.cache
                    .refresh(identity.clone(), sessions.clone(), Instant::now());
                Ok(sessions)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Create a detached session on `identity`; on success the host's cache
    /// is invalidated so the next read reflects it.
    pub async fn create_session(&mut self, identity: &HostIdentity, name: &str) -> Result<bool> {
        let client = self.client_for(identity)?;
        let done = client.create_session(name).await;
        if done {
            self.cache.invalidate(identity);
        }
        Ok(done)
    }

    pub async fn rename_session(
        &mut self,
        identity: &HostIdentity,
        old_name: &str,
        new_name: &str,
    ) -> Result<bool> {
        let client = self.client_for(identity)?;
        let done = client.rename_session(old_name, new_name).await;
        if done {
            self.cache.invalidate(identity);
        }
        Ok(done)
    }

    pub async fn kill_session(&mut self, identity: &HostIdentity, name: &str) -> Result<bool> {
        let client = self.client_for(identity)?;
        let done = client.kill_session(name).await;
        if done {
            self.cache.invalidate(identity);
        }
        Ok(done)
    }

    pub async fn create_window(
        &mut self,
        identity: &HostIdentity,
        session_name: &str,
        window_name: Option<&str>,
    ) -> Result<bool> {
        let client = self.client_for(identity)?;
        let done = client.create_window(session_name, window_name).await;
        if done {
            self.cache.invalidate(identity);
        }
        Ok(done)
    }

    /// Interactive argv for attaching to a session (or one of its windows)
    /// on `identity`.
    pub fn attach_command(
        &mut self,
        identity: &HostIdentity,
        session_name: &str,
        window_index: Option<usize>,
    ) -> Result<Vec<String>> {
        Ok(self
            .client_for(identity)?
            .attach_command(session_name, window_index))
    }

    /// Interactive argv that attaches to a session, creating it if missing.
    pub fn new_session_command(
        &mut self,
        identity: &HostIdentity,
        name: &str,
    ) -> Result<Vec<String>> {
        Ok(self.client_for(identity)?.new_session_command(name))
    }

    /// Fan out a refresh across every registered host right now.
    pub fn spawn_refresh(&mut self) -> JoinHandle<()> {
        let clients: Vec<Arc<RemoteTmuxClient>> = self.clients.values().cloned().collect();
        let limiter = self.limiter.clone();
        let closing = self.closing.clone();
        let events = self.events.clone();
        tokio::spawn(run_batch(clients, limiter, closing, events))
    }

    /// Coalesce bursty refresh requests with the configured quiet window.
    pub fn schedule_refresh(&mut self) {
        self.schedule_refresh_after(self.config.debounce);
    }

    /// Coalesce bursty refresh requests: restart the quiet-window timer,
    /// and fan out only when no further request lands within it. Replacing
    /// the timer can only cancel a window that has not elapsed yet; a batch
    /// that already fired runs detached and still delivers its event.
    pub fn schedule_refresh_after(&mut self, delay: Duration) {
        if let Some(pending) = self.pending_refresh.take() {
            pending.abort();
        }
        let clients: Vec<Arc<RemoteTmuxClient>> = self.clients.values().cloned().collect();
        let limiter = self.limiter.clone();
        let closing = self.closing.clone();
        let events = self.events.clone();
        self.pending_refresh = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(run_batch(clients, limiter, closing, events));
        }));
    }

    /// Poll one host until sessions appear, for workflows that just started
    /// a session out of band (an interactive attach creating it, say). Only
    /// one poller runs at a time; a new call replaces the old target.
    pub fn poll_until_sessions_found(&mut self, identity: &HostIdentity) -> Result<()> {
        let client = self.client_for(identity)?;
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }

        let interval = self.config.poll_interval;
        let attempts = self.config.poll_attempts;
        let closing = self.closing.clone();
        let events = self.events.clone();
        let identity = identity.clone();
        self.poll_task = Some(tokio::spawn(async move {
            for _ in 0..attempts {
                tokio::time::sleep(interval).await;
                if closing.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(sessions) = client.fetch_sessions().await {
                    if !sessions.is_empty() {
                        if closing.load(Ordering::SeqCst) {
                            return;
                        }
                        let _ = events.send(RefreshEvent::HostConverged { identity, sessions });
                        return;
                    }
                }
            }
            debug!("gave up waiting for sessions on {identity}");
        }));
        Ok(())
    }

    /// Commit a background result into the cache. Only the consumer loop
    /// calls this, which keeps every cache write on one task.
    pub fn absorb(&mut self, event: &RefreshEvent) {
        let now = Instant::now();
        match event {
            RefreshEvent::BatchCompleted(reports) => {
                for report in reports {
                    if let HostInventory::Sessions(sessions) = &report.inventory {
                        self.cache
                            .refresh(report.identity.clone(), sessions.clone(), now);
                    }
                }
            }
            RefreshEvent::HostConverged { identity, sessions } => {
                self.cache.refresh(identity.clone(), sessions.clone(), now);
            }
        }
    }

    /// Stop background work and tear down every control channel. In-flight
    /// batch results are discarded rather than delivered.
    pub async fn shutdown(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(pending) = self.pending_refresh.take() {
            pending.abort();
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.limiter.close();

        for client in self.clients.values() {
            client.close_connection(true).await;
        }
        self.clients.clear();
        self.cache.clear();
        info!("orchestrator shut down");
    }
}

/// One fan-out: fetch every host with at most `worker_limit` in flight,
/// wait for all of them, then deliver a single batch event.
async fn run_batch(
    clients: Vec<Arc<RemoteTmuxClient>>,
    limiter: Arc<Semaphore>,
    closing: Arc<AtomicBool>,
    events: UnboundedSender<RefreshEvent>,
) {
    let mut handles = Vec::with_capacity(clients.len());
    for client in clients {
        let limiter = limiter.clone();
        let closing = closing.clone();
        handles.push(tokio::spawn(async move {
            let _permit = match limiter.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return None,
            };
            if closing.load(Ordering::SeqCst) {
                return None;
            }
            Some(fetch_host(&client).await)
        }));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Ok(Some(report)) = handle.await {
            reports.push(report);
        }
    }

    if closing.load(Ordering::SeqCst) {
        debug!("dropping refresh results, shutting down");
        return;
    }
    let _ = events.send(RefreshEvent::BatchCompleted(reports));
}

/// Classify one host: unreachable, reachable without tmux, or its sessions.
async fn fetch_host(client: &RemoteTmuxClient) -> HostReport {
    let identity = client.identity().clone();
    if !client.is_connected().await {
        return HostReport {
            identity,
            inventory: HostInventory::Unreachable,
        };
    }
    if !client.is_tmux_available().await {
        return HostReport {
            identity,
            inventory: HostInventory::NoTmux,
        };
    }
    match client.fetch_sessions().await {
        Some(sessions) => HostReport {
            identity,
            inventory: HostInventory::Sessions(sessions),
        },
        None => {
            debug!("session fetch failed for {identity}");
            HostReport {
                identity,
                inventory: HostInventory::Unreachable,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use tempfile::TempDir;

    use crate::connection::ControlChannel;
    use crate::exec::testing::ScriptedRunner;
    use crate::exec::CommandOutput;

    fn host(name: &str) -> HostIdentity {
        HostIdentity::new(name, "alice", 22)
    }

    fn healthy_responder() -> impl Fn(&[String]) -> CommandOutput {
        |argv: &[String]| {
            let command = argv.last().map(String::as_str).unwrap_or("");
            if argv.contains(&"check".to_string()) {
                CommandOutput::ok("Master running")
            } else if command == "command -v tmux" {
                CommandOutput::ok("/usr/bin/tmux\n")
            } else if command.contains("list-sessions") {
                CommandOutput::ok("dev:1:0\n")
            } else if command.contains("list-windows") {
                CommandOutput::ok("0:shell:1\n")
            } else {
                CommandOutput::ok("")
            }
        }
    }

    /// Orchestrator whose hosts all answer through one shared scripted
    /// runner. Hosts flagged `false` get no control socket.
    fn scripted(
        dir: &TempDir,
        hosts: &[(&str, bool)],
        runner: Arc<ScriptedRunner>,
        config: OrchestratorConfig,
    ) -> (RefreshOrchestrator, UnboundedReceiver<RefreshEvent>) {
        let (mut orchestrator, rx) = RefreshOrchestrator::new(config);
        for (name, with_socket) in hosts {
            let identity = host(name);
            let socket = dir.path().join(identity.socket_file_name());
            if *with_socket {
                std::fs::write(&socket, b"").unwrap();
            }
            let channel = ControlChannel::with_socket_path(identity, socket);
            orchestrator.register_client(Arc::new(RemoteTmuxClient::with_runner(
                channel,
                runner.clone(),
            )));
        }
        (orchestrator, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_fans_out_with_bounded_workers() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new(healthy_responder()).with_delay(Duration::from_millis(100)),
        );
        let hosts: Vec<(String, bool)> = (0..10).map(|i| (format!("h{i}"), true)).collect();
        let host_refs: Vec<(&str, bool)> =
            hosts.iter().map(|(name, up)| (name.as_str(), *up)).collect();
        let (mut orchestrator, mut rx) =
            scripted(&dir, &host_refs, runner.clone(), OrchestratorConfig::default());

        orchestrator.spawn_refresh();

        let reports = match rx.recv().await.unwrap() {
            RefreshEvent::BatchCompleted(reports) => reports,
            other => panic!("expected a batch event, got {other:?}"),
        };
        assert_eq!(reports.len(), 10);
        assert!(reports
            .iter()
            .all(|report| matches!(report.inventory, HostInventory::Sessions(_))));
        assert_eq!(runner.max_in_flight(), 3);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_isolates_dead_hosts() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(healthy_responder()));
        let (mut orchestrator, mut rx) = scripted(
            &dir,
            &[("h1", true), ("h2", false), ("h3", true)],
            runner.clone(),
            OrchestratorConfig::default(),
        );

        orchestrator.spawn_refresh();
        let event = rx.recv().await.unwrap();
        let reports = match &event {
            RefreshEvent::BatchCompleted(reports) => reports,
            other => panic!("expected a batch event, got {other:?}"),
        };
        assert_eq!(reports.len(), 3);

        let inventory_of = |name: &str| {
            &reports
                .iter()
                .find(|report| report.identity == host(name))
                .unwrap()
                .inventory
        };
        assert!(matches!(inventory_of("h1"), HostInventory::Sessions(s) if s.len() == 1));
        assert_eq!(*inventory_of("h2"), HostInventory::Unreachable);
        assert!(matches!(inventory_of("h3"), HostInventory::Sessions(_)));

        // Committing the batch makes live hosts readable from cache and
        // leaves the dead one empty.
        orchestrator.absorb(&event);
        assert_eq!(orchestrator.cache_state(&host("h1")), CacheState::Fresh);
        assert_eq!(orchestrator.cache_state(&host("h2")), CacheState::Empty);

        let before = runner.calls_containing("list-sessions");
        let sessions = orchestrator.list_sessions(&host("h1")).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(runner.calls_containing("list-sessions"), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_tags_hosts_without_tmux() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|argv: &[String]| {
            let command = argv.last().map(String::as_str).unwrap_or("");
            if argv.contains(&"check".to_string()) {
                CommandOutput::ok("Master running")
            } else if command == "command -v tmux" {
                CommandOutput::ok("")
            } else {
                CommandOutput::ok("")
            }
        }));
        let (mut orchestrator, mut rx) = scripted(
            &dir,
            &[("h1", true)],
            runner,
            OrchestratorConfig::default(),
        );

        orchestrator.spawn_refresh();
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            RefreshEvent::BatchCompleted(vec![HostReport {
                identity: host("h1"),
                inventory: HostInventory::NoTmux,
            }])
        );

        orchestrator.absorb(&event);
        assert_eq!(orchestrator.cache_state(&host("h1")), CacheState::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_refresh_coalesces_bursts() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(healthy_responder()));
        let (mut orchestrator, mut rx) = scripted(
            &dir,
            &[("h1", true), ("h2", true)],
            runner.clone(),
            OrchestratorConfig::default(),
        );

        orchestrator.schedule_refresh_after(Duration::from_millis(150));
        tokio::time::sleep(Duration::from_millis(10)).await;
        orchestrator.schedule_refresh_after(Duration::from_millis(150));
        tokio::time::sleep(Duration::from_millis(10)).await;
        orchestrator.schedule_refresh();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RefreshEvent::BatchCompleted(ref reports) if reports.len() == 2));

        // Three requests, one fan-out.
        assert_eq!(runner.calls_containing("list-sessions"), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_keeps_fired_batch_delivering() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new(healthy_responder()).with_delay(Duration::from_millis(500)),
        );
        let (mut orchestrator, mut rx) = scripted(
            &dir,
            &[("h1", true)],
            runner.clone(),
            OrchestratorConfig::default(),
        );

        orchestrator.schedule_refresh_after(Duration::from_millis(150));
        // Past the quiet window: the first batch is mid-fetch when the next
        // request lands, so it must still deliver.
        tokio::time::sleep(Duration::from_millis(200)).await;
        orchestrator.schedule_refresh_after(Duration::from_millis(150));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, RefreshEvent::BatchCompleted(_)));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, RefreshEvent::BatchCompleted(_)));
        assert_eq!(runner.calls_containing("list-sessions"), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_converges_when_sessions_appear() {
        let dir = TempDir::new().unwrap();
        let fetches = Arc::new(AtomicUsize::new(0));
        let seen = fetches.clone();
        let runner = Arc::new(ScriptedRunner::new(move |argv: &[String]| {
            let command = argv.last().map(String::as_str).unwrap_or("");
            if command.contains("list-sessions") {
                let attempt = seen.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    CommandOutput::failure("no server running on /tmp/tmux-1000/default")
                } else {
                    CommandOutput::ok("dev:1:0\n")
                }
            } else if command.contains("list-windows") {
                CommandOutput::ok("0:shell:1\n")
            } else {
                CommandOutput::ok("")
            }
        }));
        let (mut orchestrator, mut rx) = scripted(
            &dir,
            &[("h1", true)],
            runner,
            OrchestratorConfig::default(),
        );

        orchestrator.poll_until_sessions_found(&host("h1")).unwrap();

        let (identity, sessions) = match rx.recv().await.unwrap() {
            RefreshEvent::HostConverged { identity, sessions } => (identity, sessions),
            other => panic!("expected convergence, got {other:?}"),
        };
        assert_eq!(identity, host("h1"));
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].windows.len(), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_gives_up_after_attempt_budget() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|argv: &[String]| {
            let command = argv.last().map(String::as_str).unwrap_or("");
            if command.contains("list-sessions") {
                CommandOutput::failure("no server running on /tmp/tmux-1000/default")
            } else {
                CommandOutput::ok("")
            }
        }));
        let config = OrchestratorConfig {
            poll_attempts: 3,
            ..OrchestratorConfig::default()
        };
        let (mut orchestrator, mut rx) = scripted(&dir, &[("h1", true)], runner.clone(), config);

        orchestrator.poll_until_sessions_found(&host("h1")).unwrap();

        // Well past every attempt.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(runner.calls_containing("list-sessions"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_silences_pending_poll() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(healthy_responder()));
        let (mut orchestrator, mut rx) = scripted(
            &dir,
            &[("h1", true)],
            runner.clone(),
            OrchestratorConfig::default(),
        );

        // The host would converge on the first attempt, but shutdown lands
        // before the poll interval elapses.
        orchestrator.poll_until_sessions_found(&host("h1")).unwrap();
        orchestrator.shutdown().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(runner.calls_containing("list-sessions"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutations_invalidate_cache() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(healthy_responder()));
        let (mut orchestrator, _rx) = scripted(
            &dir,
            &[("h1", true)],
            runner.clone(),
            OrchestratorConfig::default(),
        );

        orchestrator.list_sessions(&host("h1")).await.unwrap();
        orchestrator.list_sessions(&host("h1")).await.unwrap();
        assert_eq!(runner.calls_containing("list-sessions"), 1);

        assert!(orchestrator.create_session(&host("h1"), "work").await.unwrap());
        orchestrator.list_sessions(&host("h1")).await.unwrap();
        assert_eq!(runner.calls_containing("list-sessions"), 2);

        assert!(orchestrator
            .rename_session(&host("h1"), "work", "play")
            .await
            .unwrap());
        orchestrator.list_sessions(&host("h1")).await.unwrap();
        assert_eq!(runner.calls_containing("list-sessions"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_serves_until_ttl_expires() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(healthy_responder()));
        let (mut orchestrator, _rx) = scripted(
            &dir,
            &[("h1", true)],
            runner.clone(),
            OrchestratorConfig::default(),
        );

        orchestrator.list_sessions(&host("h1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        orchestrator.list_sessions(&host("h1")).await.unwrap();
        assert_eq!(runner.calls_containing("list-sessions"), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        orchestrator.list_sessions(&host("h1")).await.unwrap();
        assert_eq!(runner.calls_containing("list-sessions"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_preserves_old_snapshot() {
        let dir = TempDir::new().unwrap();
        let failing = Arc::new(AtomicBool::new(false));
        let flag = failing.clone();
        let runner = Arc::new(ScriptedRunner::new(move |argv: &[String]| {
            let command = argv.last().map(String::as_str).unwrap_or("");
            if command.contains("list-sessions") {
                if flag.load(Ordering::SeqCst) {
                    CommandOutput::timed_out()
                } else {
                    CommandOutput::ok("dev:1:0\n")
                }
            } else if command.contains("list-windows") {
                CommandOutput::ok("0:shell:1\n")
            } else {
                CommandOutput::ok("")
            }
        }));
        let (mut orchestrator, _rx) = scripted(
            &dir,
            &[("h1", true)],
            runner,
            OrchestratorConfig::default(),
        );

        let first = orchestrator.list_sessions(&host("h1")).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        failing.store(true, Ordering::SeqCst);

        let during_outage = orchestrator.list_sessions(&host("h1")).await.unwrap();
        assert!(during_outage.is_empty());
        // The stale entry survived the failed fetch.
        assert_eq!(orchestrator.cache_state(&host("h1")), CacheState::Stale);

        failing.store(false, Ordering::SeqCst);
        let healed = orchestrator.list_sessions(&host("h1")).await.unwrap();
        assert_eq!(healed.len(), 1);
        assert_eq!(orchestrator.cache_state(&host("h1")), CacheState::Fresh);
    }

    #[tokio::test]
    async fn test_registry_reuses_one_client_per_host() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(healthy_responder()));
        let (mut orchestrator, _rx) = scripted(
            &dir,
            &[("h1", true)],
            runner,
            OrchestratorConfig::default(),
        );

        let first = orchestrator.client_for(&host("h1")).unwrap();
        let second = orchestrator.client_for(&host("h1")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let attach = orchestrator.attach_command(&host("h1"), "dev", Some(2)).unwrap();
        assert_eq!(attach.last().unwrap(), "tmux attach-session -t 'dev:2'");
        let fresh = orchestrator.new_session_command(&host("h1"), "scratch").unwrap();
        assert_eq!(fresh.last().unwrap(), "tmux new-session -A -s 'scratch'");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_tears_everything_down() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(healthy_responder()));
        let (mut orchestrator, mut rx) = scripted(
            &dir,
            &[("h1", true), ("h2", true)],
            runner.clone(),
            OrchestratorConfig::default(),
        );

        orchestrator.list_sessions(&host("h1")).await.unwrap();
        orchestrator.shutdown().await;

        assert!(orchestrator.is_closing());
        assert!(orchestrator.hosts().is_empty());
        assert_eq!(orchestrator.cache_state(&host("h1")), CacheState::Empty);

        let exits = runner
            .calls()
            .iter()
            .filter(|call| call.argv.contains(&"exit".to_string()))
            .count();
        assert_eq!(exits, 2);
        assert!(!dir.path().join(host("h1").socket_file_name()).exists());
        assert!(!dir.path().join(host("h2").socket_file_name()).exists());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_results_discarded_when_closing() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(healthy_responder()));
        let (mut orchestrator, mut rx) = scripted(
            &dir,
            &[("h1", true)],
            runner.clone(),
            OrchestratorConfig::default(),
        );

        let batch = orchestrator.spawn_refresh();
        orchestrator.shutdown().await;
        batch.await.unwrap();

        assert!(rx.try_recv().is_err());
        // Workers bailed before fetching anything.
        assert_eq!(runner.calls_containing("list-sessions"), 0);
    }
}
