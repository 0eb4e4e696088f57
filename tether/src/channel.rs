//! The key/value store shared between the host and the tether.
//!
//! The host owns the backing store (VM metadata). Inside the guest it shows
//! up either as a JSON file the host keeps in sync, or as an in-memory map
//! when the tether is embedded.

use crate::config::KeyValues;
use crate::error::ChannelError;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Changes to apply to the channel: keys to set, then keys to remove.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub set: KeyValues,
    pub remove: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

/// Compute the changes that turn `old` into `new`.
pub fn diff(old: &KeyValues, new: &KeyValues) -> Delta {
    let set = new
        .iter()
        .filter(|(k, v)| old.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let remove = old
        .keys()
        .filter(|k| !new.contains_key(*k))
        .cloned()
        .collect();
    Delta { set, remove }
}

pub trait Channel: Send + Sync {
    fn load(&self) -> Result<KeyValues, ChannelError>;

    fn apply(&self, delta: &Delta) -> Result<(), ChannelError>;
}

/// In-process channel; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    inner: Arc<Mutex<KeyValues>>,
}

impl MemoryChannel {
    pub fn new(initial: KeyValues) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().ok()?.get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) {
        if let Ok(mut kv) = self.inner.lock() {
            kv.insert(key.to_string(), value.to_string());
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut kv) = self.inner.lock() {
            kv.remove(key);
        }
    }

    pub fn snapshot(&self) -> KeyValues {
        self.inner.lock().map(|kv| kv.clone()).unwrap_or_default()
    }
}

impl Channel for MemoryChannel {
    fn load(&self) -> Result<KeyValues, ChannelError> {
        Ok(self.inner.lock().map_err(|_| ChannelError::Poisoned)?.clone())
    }

    fn apply(&self, delta: &Delta) -> Result<(), ChannelError> {
        let mut kv = self.inner.lock().map_err(|_| ChannelError::Poisoned)?;
        apply_to(&mut kv, delta);
        Ok(())
    }
}

fn apply_to(kv: &mut KeyValues, delta: &Delta) {
    for (k, v) in &delta.set {
        kv.insert(k.clone(), v.clone());
    }
    for k in &delta.remove {
        kv.remove(k);
    }
}

/// Channel persisted as a flat JSON object.
pub struct FileChannel {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<KeyValues, ChannelError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(KeyValues::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(KeyValues::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, kv: &KeyValues) -> Result<(), ChannelError> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(kv)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Channel for FileChannel {
    fn load(&self) -> Result<KeyValues, ChannelError> {
        let _guard = self.lock.lock().map_err(|_| ChannelError::Poisoned)?;
        self.read()
    }

    fn apply(&self, delta: &Delta) -> Result<(), ChannelError> {
        if delta.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().map_err(|_| ChannelError::Poisoned)?;
        let mut kv = self.read()?;
        apply_to(&mut kv, delta);
        tracing::debug!(
            "Writing {} updated and {} removed keys to {:?}",
            delta.set.len(),
            delta.remove.len(),
            self.path
        );
        self.write(&kv)
    }
}
