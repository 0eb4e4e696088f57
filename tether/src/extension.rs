//! Extension framework.
//!
//! Extensions are started and reloaded in registration order and stopped in
//! reverse, so an extension can rely on everything registered before it.

use crate::config::ExecutorConfig;
use crate::error::{ExtensionError, TetherError};
use crate::ops::Operations;
use std::fmt;
use std::sync::Arc;

pub trait Extension: Send {
    fn start(&mut self) -> Result<(), ExtensionError> {
        Ok(())
    }

    fn reload(&mut self, _config: &ExecutorConfig) -> Result<(), ExtensionError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ExtensionError> {
        Ok(())
    }
}

/// Shared state for extensions that act on the guest.
#[derive(Clone)]
pub struct ExtensionBase {
    name: String,
    ops: Arc<dyn Operations>,
}

impl ExtensionBase {
    pub fn new(name: &str, ops: Arc<dyn Operations>) -> Self {
        Self {
            name: name.to_string(),
            ops,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ops(&self) -> &dyn Operations {
        self.ops.as_ref()
    }

    /// Attach the extension's name to a failure.
    pub fn fail(&self, err: impl fmt::Display) -> ExtensionError {
        ExtensionError::failed(&self.name, err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionState {
    Registered,
    Started,
    Stopped,
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionState::Registered => write!(f, "registered"),
            ExtensionState::Started => write!(f, "started"),
            ExtensionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What to do with already-started extensions when a later one fails to
/// start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackPolicy {
    /// Stop them again, in reverse order.
    #[default]
    StopStarted,
    /// Leave them running.
    None,
}

struct Entry {
    name: String,
    extension: Box<dyn Extension>,
    state: ExtensionState,
}

impl Entry {
    fn invalid(&self, action: &str) -> ExtensionError {
        ExtensionError::InvalidState {
            name: self.name.clone(),
            state: self.state.to_string(),
            action: action.to_string(),
        }
    }
}

#[derive(Default)]
pub struct ExtensionRegistry {
    entries: Vec<Entry>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, extension: Box<dyn Extension>) -> Result<(), TetherError> {
        if self.entries.iter().any(|e| e.name == name) {
            return Err(TetherError::DuplicateExtension(name.to_string()));
        }
        tracing::debug!("Registered extension {}", name);
        self.entries.push(Entry {
            name: name.to_string(),
            extension,
            state: ExtensionState::Registered,
        });
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn state(&self, name: &str) -> Option<ExtensionState> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start every extension in registration order. On the first failure
    /// the already-started ones are handled per `policy` and the error is
    /// returned.
    pub fn start_all(&mut self, policy: RollbackPolicy) -> Result<(), ExtensionError> {
        let mut failure = None;
        for entry in self.entries.iter_mut() {
            if entry.state != ExtensionState::Registered {
                failure = Some(entry.invalid("start"));
                break;
            }
            tracing::info!("Starting extension {}", entry.name);
            if let Err(e) = entry.extension.start() {
                tracing::error!("Extension {} failed to start: {}", entry.name, e);
                failure = Some(e);
                break;
            }
            entry.state = ExtensionState::Started;
        }

        let Some(err) = failure else {
            return Ok(());
        };
        match policy {
            RollbackPolicy::StopStarted => {
                self.stop_all();
            }
            RollbackPolicy::None => {
                tracing::warn!("Leaving started extensions running after failed start");
            }
        }
        Err(err)
    }

    /// Reload every started extension in registration order, stopping at the
    /// first failure.
    pub fn reload_all(&mut self, config: &ExecutorConfig) -> Result<(), ExtensionError> {
        for entry in self.entries.iter_mut() {
            match entry.state {
                ExtensionState::Started => {}
                ExtensionState::Registered => continue,
                ExtensionState::Stopped => return Err(entry.invalid("reload")),
            }
            tracing::debug!("Reloading extension {}", entry.name);
            entry.extension.reload(config)?;
        }
        Ok(())
    }

    /// Stop every started extension in reverse order. Failures are logged
    /// and returned but never keep the remaining extensions from stopping.
    pub fn stop_all(&mut self) -> Vec<(String, ExtensionError)> {
        let mut failures = Vec::new();
        for entry in self.entries.iter_mut().rev() {
            if entry.state != ExtensionState::Started {
                continue;
            }
            tracing::info!("Stopping extension {}", entry.name);
            if let Err(e) = entry.extension.stop() {
                tracing::error!("Extension {} failed to stop: {}", entry.name, e);
                failures.push((entry.name.clone(), e));
            }
            entry.state = ExtensionState::Stopped;
        }
        failures
    }
}
