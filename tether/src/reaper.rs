//! Child reaping.
//!
//! As PID 1 (or a child subreaper) the tether inherits every orphaned
//! descendant, so it has to collect all of them, not only the processes it
//! started itself. SIGCHLD is turned into a message for a dedicated worker,
//! which drains every reapable child per notification and hands exits of
//! known sessions back to the core.

use crate::error::TetherError;
use crate::session::Session;
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::process::Child;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Called once for every session whose process exit has been recorded.
pub type ExitHandler = Arc<dyn Fn(Arc<Session>) -> Result<(), TetherError> + Send + Sync>;

/// PID → session correlation for processes the tether launched.
#[derive(Default)]
pub struct ProcessTable {
    inner: Mutex<HashMap<Pid, Arc<Session>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Pid, Arc<Session>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a process and record it before the reaper can look it up.
    ///
    /// Everywhere else the lock covers a single lookup or removal. Here it
    /// covers the fork and exec too: a child that exits before its pid is
    /// recorded would be reaped as an orphan and its exit status lost.
    /// Holding the lock makes the reaper's `remove` wait for the entry.
    pub fn spawn_tracked<F>(&self, session: &Arc<Session>, spawn: F) -> std::io::Result<Child>
    where
        F: FnOnce() -> std::io::Result<Child>,
    {
        let mut table = self.lock();
        let child = spawn()?;
        table.insert(Pid::from_raw(child.id() as i32), session.clone());
        Ok(child)
    }

    pub fn insert(&self, pid: Pid, session: Arc<Session>) {
        self.lock().insert(pid, session);
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<Session>> {
        self.lock().remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of child status changes.
pub trait Waiter: Send {
    /// Non-blocking wait for any child.
    fn wait_any(&mut self) -> nix::Result<WaitStatus>;
}

pub struct SystemWaiter;

impl Waiter for SystemWaiter {
    fn wait_any(&mut self) -> nix::Result<WaitStatus> {
        waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperEvent {
    ChildStateChanged,
    Shutdown,
}

/// Reap every child that is currently reapable. Returns how many exits
/// were collected.
pub fn reap_batch(table: &ProcessTable, waiter: &mut dyn Waiter, on_exit: &ExitHandler) -> usize {
    let mut reaped = 0;
    loop {
        tracing::trace!("Inspecting children with status change");
        match waiter.wait_any() {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => {
                tracing::trace!("No more child processes to reap");
                break;
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!("waitpid failed: {}", e);
                break;
            }
            Ok(status) => {
                if let Some((pid, code)) = exit_code(status) {
                    reaped += 1;
                    if let Err(e) = finish(table, pid, code, on_exit) {
                        tracing::error!("Handling exit of process {} failed: {}", pid, e);
                    }
                } else {
                    tracing::debug!("Non-exit status change: {:?}", status);
                }
            }
        }
    }
    reaped
}

/// Exit code for a terminal status; signals map to 128 + signal number.
fn exit_code(status: WaitStatus) -> Option<(Pid, i32)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid, code)),
        WaitStatus::Signaled(pid, signal, _) => Some((pid, 128 + signal as i32)),
        _ => None,
    }
}

fn finish(table: &ProcessTable, pid: Pid, code: i32, on_exit: &ExitHandler) -> Result<(), TetherError> {
    tracing::debug!("Reaped process {}, exit code {}", pid, code);

    let Some(session) = table.remove(pid) else {
        tracing::info!("Reaped zombie process PID {}", pid);
        return Ok(());
    };

    if !session.record_exit(code) {
        tracing::warn!("Session {} already has an exit status", session.id());
        return Ok(());
    }
    on_exit(session)
}

/// The running reaper worker.
pub struct Reaper {
    events: mpsc::UnboundedSender<ReaperEvent>,
    worker: Option<JoinHandle<()>>,
    signals: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Register for SIGCHLD and start the reaping worker.
    pub fn start(table: Arc<ProcessTable>, on_exit: ExitHandler) -> Result<Self, TetherError> {
        Self::start_with(table, on_exit, Box::new(SystemWaiter))
    }

    pub fn start_with(
        table: Arc<ProcessTable>,
        on_exit: ExitHandler,
        mut waiter: Box<dyn Waiter>,
    ) -> Result<Self, TetherError> {
        let mut sigchld = signal(SignalKind::child())?;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let notify = tx.clone();
        let signals = tokio::spawn(async move {
            while sigchld.recv().await.is_some() {
                if notify.send(ReaperEvent::ChildStateChanged).is_err() {
                    break;
                }
            }
        });

        let worker = tokio::spawn(async move {
            // children may have exited before the handler was installed
            reap_batch(&table, waiter.as_mut(), &on_exit);

            while let Some(event) = rx.recv().await {
                match event {
                    ReaperEvent::ChildStateChanged => {
                        reap_batch(&table, waiter.as_mut(), &on_exit);
                    }
                    ReaperEvent::Shutdown => break,
                }
            }
            tracing::info!("Reaper stopped");
        });

        tracing::info!("Started reaping child processes");
        Ok(Self {
            events: tx,
            worker: Some(worker),
            signals: Some(signals),
        })
    }

    /// Deliver a status-change notification as if SIGCHLD had arrived.
    pub fn notify(&self) {
        let _ = self.events.send(ReaperEvent::ChildStateChanged);
    }

    /// Stop listening for SIGCHLD and wait for the worker to finish.
    /// Later calls do nothing.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        tracing::info!("Shutting down reaper");

        if let Some(signals) = self.signals.take() {
            signals.abort();
        }
        let _ = self.events.send(ReaperEvent::Shutdown);
        let _ = worker.await;
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if let Some(signals) = self.signals.take() {
            signals.abort();
        }
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}
