#![allow(dead_code)]

use moor_tether::attach::RawInput;
use moor_tether::config::{KeyValues, encode};
use moor_tether::{
    DiskMount, ExecutorConfig, ExtensionError, MemoryChannel, NetworkEndpoint, Operations,
    SessionConfig, SessionIo, TetherOptions,
};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Output sink shared by every session of a test.
#[derive(Clone, Default)]
pub struct Output(Arc<Mutex<Vec<u8>>>);

impl Output {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Operations that touch nothing outside the test process.
#[derive(Default)]
pub struct TestOps {
    pub output: Output,
    pub calls: Mutex<Vec<String>>,
}

impl TestOps {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) -> Result<(), ExtensionError> {
        self.calls.lock().unwrap().push(call.to_string());
        Ok(())
    }
}

impl Operations for TestOps {
    fn setup(&self) -> Result<(), ExtensionError> {
        self.record("setup")
    }

    fn cleanup(&self) -> Result<(), ExtensionError> {
        self.record("cleanup")
    }

    fn set_hostname(&self, hostname: &str, _aliases: &[String]) -> Result<(), ExtensionError> {
        self.record(&format!("hostname {}", hostname))
    }

    fn apply_endpoint(&self, endpoint: &NetworkEndpoint) -> Result<(), ExtensionError> {
        self.record(&format!("endpoint {}", endpoint.name))
    }

    fn mount_label(&self, disk: &DiskMount) -> Result<(), ExtensionError> {
        self.record(&format!("mount {}", disk.label))
    }

    fn unmount(&self, target: &Path) -> Result<(), ExtensionError> {
        self.record(&format!("unmount {}", target.display()))
    }

    fn fork(&self) -> Result<(), ExtensionError> {
        self.record("fork")
    }

    fn session_io(&self, _session: &SessionConfig) -> io::Result<SessionIo> {
        Ok(SessionIo {
            input: Box::new(RawInput::new(io::empty())),
            stdout: Box::new(self.output.clone()),
            stderr: Box::new(self.output.clone()),
        })
    }
}

pub fn options() -> TetherOptions {
    TetherOptions {
        grace_period: Duration::from_secs(2),
        kill_wait: Duration::from_secs(1),
        ..Default::default()
    }
}

pub fn executor(sessions: Vec<SessionConfig>) -> ExecutorConfig {
    let mut config = ExecutorConfig::new("vm1", "test", 1_700_000_000);
    for session in sessions {
        config.add_session(session);
    }
    config
}

/// Replace the desired configuration the way the host would, keeping
/// status keys of sessions that are still configured.
pub fn replace_config(channel: &MemoryChannel, config: &ExecutorConfig) {
    let desired: KeyValues = encode(config);
    for key in channel.snapshot().keys() {
        let keep = config
            .sessions
            .keys()
            .any(|id| key.starts_with(&format!("session.{}.", id)));
        if !keep && !desired.contains_key(key) {
            channel.remove(key);
        }
    }
    for (key, value) in &desired {
        channel.set(key, value);
    }
}

/// Poll the channel until `key` shows up.
pub async fn wait_for_key(channel: &MemoryChannel, key: &str) -> String {
    let wait = async {
        loop {
            if let Some(value) = channel.get(key) {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", key))
}

pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let wait = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}
