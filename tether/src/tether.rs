//! The supervisor.
//!
//! A single task owns every lifecycle transition: it decodes the
//! configuration, drives the extensions, launches sessions and publishes
//! their status. Everything else (the reaper, signal adapters, the binary)
//! talks to it through [`TetherHandle`] messages.

use crate::channel::{Channel, diff};
use crate::config::{
    ExecutorConfig, Rejected, SessionConfig, SessionStatus, Snapshot, encode_statuses, session_key,
};
use crate::error::{LaunchError, TetherError};
use crate::extension::{Extension, ExtensionRegistry, RollbackPolicy};
use crate::ops::Operations;
use crate::reaper::{ExitHandler, ProcessTable, Reaper};
use crate::session::Session;
use nix::sys::signal::Signal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TetherOptions {
    /// How long sessions get between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// How long to wait for exits after SIGKILL.
    pub kill_wait: Duration,
    pub rollback: RollbackPolicy,
}

impl Default for TetherOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            kill_wait: Duration::from_secs(5),
            rollback: RollbackPolicy::StopStarted,
        }
    }
}

type Reply = oneshot::Sender<Result<(), TetherError>>;

enum Event {
    Stop,
    Reload(Reply),
    SessionExited(Arc<Session>),
    Resize {
        id: String,
        rows: u16,
        cols: u16,
        reply: Reply,
    },
    Signal {
        id: String,
        signal: Signal,
        reply: Reply,
    },
    /// Grace period of a removed session ran out.
    Escalate(String),
}

enum Flow {
    Continue,
    Shutdown,
}

pub struct Tether {
    channel: Arc<dyn Channel>,
    ops: Arc<dyn Operations>,
    options: TetherOptions,
    extensions: ExtensionRegistry,
    events: mpsc::UnboundedSender<Event>,
    inbox: mpsc::UnboundedReceiver<Event>,
    stopped: watch::Sender<bool>,
}

impl Tether {
    pub fn new(channel: Arc<dyn Channel>, ops: Arc<dyn Operations>, options: TetherOptions) -> Self {
        let (events, inbox) = mpsc::unbounded_channel();
        let (stopped, _) = watch::channel(false);
        Self {
            channel,
            ops,
            options,
            extensions: ExtensionRegistry::new(),
            events,
            inbox,
            stopped,
        }
    }

    pub fn register(&mut self, name: &str, extension: Box<dyn Extension>) -> Result<(), TetherError> {
        self.extensions.register(name, extension)
    }

    pub fn extensions_mut(&mut self) -> &mut ExtensionRegistry {
        &mut self.extensions
    }

    pub fn handle(&self) -> TetherHandle {
        TetherHandle {
            events: self.events.clone(),
            stopped: self.stopped.subscribe(),
        }
    }

    /// Run until stopped. Returns early with an error when the initial
    /// configuration cannot be decoded or an extension fails to start.
    pub async fn start(self) -> Result<(), TetherError> {
        let Tether {
            channel,
            ops,
            options,
            extensions,
            events,
            inbox,
            stopped,
        } = self;

        let mut supervisor = Supervisor {
            channel,
            ops,
            options,
            extensions,
            events,
            inbox,
            table: Arc::new(ProcessTable::new()),
            reaper: None,
            config: ExecutorConfig::default(),
            live: HashMap::new(),
            removed: HashMap::new(),
            finished: HashSet::new(),
            stopping: false,
        };

        let result = supervisor.run().await;
        stopped.send_replace(true);
        tracing::info!("Tether stopped");
        result
    }
}

struct Supervisor {
    channel: Arc<dyn Channel>,
    ops: Arc<dyn Operations>,
    options: TetherOptions,
    extensions: ExtensionRegistry,
    events: mpsc::UnboundedSender<Event>,
    inbox: mpsc::UnboundedReceiver<Event>,
    table: Arc<ProcessTable>,
    reaper: Option<Reaper>,
    config: ExecutorConfig,
    /// Running sessions that are still configured.
    live: HashMap<String, Arc<Session>>,
    /// Running sessions the host removed; they are being terminated.
    removed: HashMap<String, Arc<Session>>,
    /// Sessions that exited or failed to launch. Never launched again.
    finished: HashSet<String>,
    stopping: bool,
}

impl Supervisor {
    async fn run(&mut self) -> Result<(), TetherError> {
        let kv = self.channel.load()?;
        let Snapshot { config, rejected } = Snapshot::decode(&kv)?;
        self.config = config;
        tracing::info!(
            "Starting tether for {} ({}), {} session(s)",
            self.config.id,
            self.config.name,
            self.config.sessions.len()
        );

        self.reject(rejected);
        self.ops.setup()?;

        if let Err(e) = self.extensions.start_all(self.options.rollback) {
            self.cleanup();
            return Err(e.into());
        }

        let events = self.events.clone();
        let on_exit: ExitHandler = Arc::new(move |session| {
            events
                .send(Event::SessionExited(session))
                .map_err(|_| TetherError::NotRunning)
        });
        match Reaper::start(self.table.clone(), on_exit) {
            Ok(reaper) => self.reaper = Some(reaper),
            Err(e) => {
                self.extensions.stop_all();
                self.cleanup();
                return Err(e);
            }
        }

        if let Err(e) = self.extensions.reload_all(&self.config) {
            tracing::error!("Applying initial configuration failed: {}", e);
            self.teardown().await;
            return Err(e.into());
        }
        self.launch_pending();

        loop {
            let Some(event) = self.inbox.recv().await else {
                break;
            };
            if let Flow::Shutdown = self.handle(event) {
                break;
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn handle(&mut self, event: Event) -> Flow {
        match event {
            Event::Stop => {
                tracing::info!("Stop requested");
                Flow::Shutdown
            }
            Event::Reload(reply) => {
                let result = self.reload();
                if let Err(e) = &result {
                    tracing::error!("Reload failed: {}", e);
                }
                let _ = reply.send(result);
                Flow::Continue
            }
            Event::SessionExited(session) => self.session_exited(session),
            Event::Resize {
                id,
                rows,
                cols,
                reply,
            } => {
                let result = self
                    .session(&id)
                    .and_then(|s| s.resize(rows, cols).map_err(TetherError::from));
                let _ = reply.send(result);
                Flow::Continue
            }
            Event::Signal { id, signal, reply } => {
                let result = self
                    .session(&id)
                    .and_then(|s| s.signal(signal).map_err(TetherError::from));
                let _ = reply.send(result);
                Flow::Continue
            }
            Event::Escalate(id) => {
                if let Some(session) = self.removed.get(&id) {
                    tracing::warn!("Session {} ignored SIGTERM, killing it", id);
                    if let Err(e) = session.signal(Signal::SIGKILL) {
                        tracing::warn!("Failed to kill session {}: {}", id, e);
                    }
                }
                Flow::Continue
            }
        }
    }

    fn session(&self, id: &str) -> Result<Arc<Session>, TetherError> {
        self.live
            .get(id)
            .or_else(|| self.removed.get(id))
            .cloned()
            .ok_or_else(|| TetherError::SessionNotFound(id.to_string()))
    }

    /// Re-read the configuration, terminate sessions the host dropped,
    /// reload the extensions, and launch sessions that are new. Entries
    /// that do not decode are reported and otherwise left as they are.
    fn reload(&mut self) -> Result<(), TetherError> {
        let kv = self.channel.load()?;
        let Snapshot { config, rejected } = Snapshot::decode(&kv)?;
        let rejected = self.reject(rejected);

        let dropped: Vec<String> = self
            .live
            .keys()
            .filter(|id| !config.sessions.contains_key(*id) && !rejected.contains(*id))
            .cloned()
            .collect();
        for id in dropped {
            if let Some(session) = self.live.remove(&id) {
                self.terminate_removed(id, session);
            }
        }
        self.finished
            .retain(|id| config.sessions.contains_key(id) || rejected.contains(id));
        self.config = config;

        self.extensions.reload_all(&self.config)?;
        self.launch_pending();
        Ok(())
    }

    /// Log entries that did not decode and report bad sessions that never
    /// ran through their `error` key. Returns the rejected session ids.
    fn reject(&self, rejected: Vec<Rejected>) -> HashSet<String> {
        let mut ids = HashSet::new();
        let mut statuses = BTreeMap::new();
        for entry in rejected {
            tracing::error!("Ignoring {} {}: {}", entry.section, entry.id, entry.error);
            if !entry.is_session() {
                continue;
            }
            if !self.live.contains_key(&entry.id) && !self.finished.contains(&entry.id) {
                let status = SessionStatus {
                    error: Some(entry.error.to_string()),
                    ..Default::default()
                };
                statuses.insert(entry.id.clone(), status);
            }
            ids.insert(entry.id);
        }
        self.publish(&statuses);
        ids
    }

    fn terminate_removed(&mut self, id: String, session: Arc<Session>) {
        tracing::info!("Session {} was removed, terminating it", id);
        if let Err(e) = session.signal(Signal::SIGTERM) {
            tracing::warn!("Failed to signal session {}: {}", id, e);
        }
        self.removed.insert(id.clone(), session);

        let events = self.events.clone();
        let grace = self.options.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(Event::Escalate(id));
        });
    }

    fn launch_pending(&mut self) {
        let pending: Vec<SessionConfig> = self
            .config
            .sessions
            .values()
            .filter(|s| {
                !self.live.contains_key(&s.id)
                    && !self.removed.contains_key(&s.id)
                    && !self.finished.contains(&s.id)
            })
            .cloned()
            .collect();

        let mut statuses = BTreeMap::new();
        for config in pending {
            if config.is_complete() {
                tracing::debug!("Session {} already completed, not relaunching", config.id);
                self.finished.insert(config.id);
                continue;
            }
            let id = config.id.clone();
            let status = self.launch(config);
            statuses.insert(id, status);
        }
        self.publish(&statuses);
    }

    fn launch(&mut self, config: SessionConfig) -> SessionStatus {
        let session = Session::new(config);
        let env = self.ops.process_env(session.config());
        let result = self
            .ops
            .session_io(session.config())
            .map_err(LaunchError::from)
            .and_then(|io| session.launch(&self.table, env, io));

        let mut status = status_of(&session);
        match result {
            Ok(_) => {
                self.live.insert(session.id().to_string(), session);
            }
            Err(e) => {
                tracing::error!("Failed to launch session {}: {}", session.id(), e);
                self.finished.insert(session.id().to_string());
                status.error = Some(e.to_string());
            }
        }
        status
    }

    fn session_exited(&mut self, session: Arc<Session>) -> Flow {
        let id = session.id().to_string();
        tracing::info!(
            "Session {} exited with status {}",
            id,
            session.exit_status().unwrap_or_default()
        );
        session.detach();

        if self.removed.remove(&id).is_some() {
            return Flow::Continue;
        }
        self.live.remove(&id);
        self.finished.insert(id.clone());

        let mut statuses = BTreeMap::new();
        statuses.insert(id, status_of(&session));
        self.publish(&statuses);

        if !self.stopping && self.ops.handle_session_exit(&self.config, session.config()) {
            tracing::info!("Primary session {} exited, shutting down", session.id());
            return Flow::Shutdown;
        }
        Flow::Continue
    }

    /// Write status keys the channel does not hold yet. Status goes only to
    /// sessions whose `cmd` is still in the channel, so an entry the host
    /// deleted is never brought back as bare status keys.
    fn publish(&self, statuses: &BTreeMap<String, SessionStatus>) {
        if statuses.is_empty() {
            return;
        }
        let current = match self.channel.load() {
            Ok(kv) => kv,
            Err(e) => {
                tracing::error!("Failed to read channel before publishing status: {}", e);
                return;
            }
        };

        let configured: BTreeMap<String, SessionStatus> = statuses
            .iter()
            .filter(|(id, _)| {
                let present = current.contains_key(&session_key(id, "cmd"));
                if !present {
                    tracing::debug!("Session {} is no longer configured, dropping its status", id);
                }
                present
            })
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect();

        let mut next = current.clone();
        next.extend(encode_statuses(&configured));
        let delta = diff(&current, &next);
        if delta.is_empty() {
            return;
        }
        if let Err(e) = self.channel.apply(&delta) {
            tracing::error!("Failed to publish session status: {}", e);
        }
    }

    fn running(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.live.values().chain(self.removed.values())
    }

    fn signal_all(&self, signal: Signal) {
        for session in self.running() {
            if let Err(e) = session.signal(signal) {
                tracing::warn!("Failed to send {} to session {}: {}", signal, session.id(), e);
            }
        }
    }

    /// Handle events until every running session has exited or `window`
    /// has passed.
    async fn wait_for_exits(&mut self, window: Duration) {
        let deadline = Instant::now() + window;
        while self.running().next().is_some() {
            match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(event)) => self.handle_stopping(event),
                Ok(None) | Err(_) => break,
            }
        }
    }

    fn handle_stopping(&mut self, event: Event) {
        match event {
            Event::Reload(reply) => {
                let _ = reply.send(Err(TetherError::NotRunning));
            }
            Event::Stop | Event::Escalate(_) => {}
            other => {
                self.handle(other);
            }
        }
    }

    async fn shutdown(&mut self) {
        self.stopping = true;
        tracing::info!("Shutting down tether");

        if self.running().next().is_some() {
            self.signal_all(Signal::SIGTERM);
            self.wait_for_exits(self.options.grace_period).await;
        }
        if self.running().next().is_some() {
            tracing::warn!("Sessions still running after grace period, killing them");
            self.signal_all(Signal::SIGKILL);
            self.wait_for_exits(self.options.kill_wait).await;
        }

        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.stopping = true;
        self.extensions.stop_all();
        if let Some(reaper) = self.reaper.as_mut() {
            reaper.stop().await;
        }
        self.cleanup();
    }

    fn cleanup(&self) {
        if let Err(e) = self.ops.cleanup() {
            tracing::warn!("Cleanup failed: {}", e);
        }
    }
}

fn status_of(session: &Session) -> SessionStatus {
    SessionStatus {
        pid: session.pid().map(|pid| pid.as_raw()),
        started: session.started(),
        finished: session.finished(),
        exit_status: session.exit_status(),
        error: None,
    }
}

/// Cloneable control surface of a running tether.
#[derive(Clone)]
pub struct TetherHandle {
    events: mpsc::UnboundedSender<Event>,
    stopped: watch::Receiver<bool>,
}

impl TetherHandle {
    /// Request an orderly shutdown and wait for it to finish. Calling it
    /// again after the tether stopped returns immediately.
    pub async fn stop(&self) {
        let _ = self.events.send(Event::Stop);
        self.stopped().await;
    }

    /// Wait for the tether to stop without asking it to.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    pub async fn reload(&self) -> Result<(), TetherError> {
        self.request(Event::Reload).await
    }

    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), TetherError> {
        let id = id.to_string();
        self.request(|reply| Event::Resize {
            id,
            rows,
            cols,
            reply,
        })
        .await
    }

    pub async fn signal(&self, id: &str, signal: Signal) -> Result<(), TetherError> {
        let id = id.to_string();
        self.request(|reply| Event::Signal { id, signal, reply }).await
    }

    async fn request(&self, event: impl FnOnce(Reply) -> Event) -> Result<(), TetherError> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(event(reply))
            .map_err(|_| TetherError::NotRunning)?;
        response.await.map_err(|_| TetherError::NotRunning)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::config::encode;
    use crate::extensions::mock::RecordingOps;

    fn channel_for(config: &ExecutorConfig) -> Arc<MemoryChannel> {
        Arc::new(MemoryChannel::new(encode(config)))
    }

    #[tokio::test]
    async fn test_start_and_stop_without_sessions() {
        let channel = channel_for(&ExecutorConfig::new("abc", "web", 0));
        let ops = Arc::new(RecordingOps::default());
        let tether = Tether::new(channel, ops.clone(), TetherOptions::default());
        let handle = tether.handle();

        let task = tokio::spawn(tether.start());
        handle.stop().await;
        handle.stop().await;

        task.await.unwrap().unwrap();
        assert!(handle.is_stopped());
        assert_eq!(ops.calls(), vec!["setup", "cleanup"]);
        assert!(matches!(handle.reload().await, Err(TetherError::NotRunning)));
    }

    #[tokio::test]
    async fn test_bad_configuration_fails_start() {
        let channel = Arc::new(MemoryChannel::default());
        let ops = Arc::new(RecordingOps::default());
        let tether = Tether::new(channel, ops.clone(), TetherOptions::default());
        let handle = tether.handle();

        let err = tether.start().await.unwrap_err();
        assert!(matches!(err, TetherError::Config(_)));
        assert!(handle.is_stopped());
        assert!(ops.calls().is_empty());
    }

    #[tokio::test]
    async fn test_bad_session_entry_does_not_fail_start() {
        let mut config = ExecutorConfig::new("abc", "web", 0);
        config.add_session(SessionConfig::new("exec-1", "true", &[]));
        let mut kv = encode(&config);
        kv.insert("session.exec-1.rows".to_string(), "tall".to_string());
        let channel = Arc::new(MemoryChannel::new(kv));
        let ops = Arc::new(RecordingOps::default());
        let tether = Tether::new(channel.clone(), ops, TetherOptions::default());
        let handle = tether.handle();

        let task = tokio::spawn(tether.start());
        handle.stop().await;
        task.await.unwrap().unwrap();

        let error = channel.get("session.exec-1.error").unwrap();
        assert!(error.contains("session.exec-1.rows"));
        assert!(channel.get("session.exec-1.pid").is_none());
    }

    #[tokio::test]
    async fn test_failed_setup_fails_start() {
        let channel = channel_for(&ExecutorConfig::new("abc", "web", 0));
        let ops = Arc::new(RecordingOps::default());
        ops.fail_on("setup");
        let tether = Tether::new(channel, ops, TetherOptions::default());

        let err = tether.start().await.unwrap_err();
        assert!(matches!(err, TetherError::Extension(_)));
    }

    #[tokio::test]
    async fn test_unknown_session_requests() {
        let channel = channel_for(&ExecutorConfig::new("abc", "web", 0));
        let ops = Arc::new(RecordingOps::default());
        let tether = Tether::new(channel, ops, TetherOptions::default());
        let handle = tether.handle();
        let task = tokio::spawn(tether.start());

        let err = handle.resize("nope", 24, 80).await.unwrap_err();
        assert!(matches!(err, TetherError::SessionNotFound(ref id) if id == "nope"));
        let err = handle.signal("nope", Signal::SIGHUP).await.unwrap_err();
        assert!(matches!(err, TetherError::SessionNotFound(_)));

        handle.stop().await;
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_default_options() {
        let options = TetherOptions::default();
        assert_eq!(options.grace_period, Duration::from_secs(10));
        assert_eq!(options.kill_wait, Duration::from_secs(5));
        assert_eq!(options.rollback, RollbackPolicy::StopStarted);
    }
}
