//! Supervised processes.
//!
//! A `Session` is created from its configuration, launched once, and gets
//! its exit status from the reaper. The PTY or pipes are wired to the
//! session's I/O through a [`Bridge`].

use crate::attach::InputSource;
use crate::bridge::{Bridge, Control, PtyReader, PtyWriter};
use crate::config::SessionConfig;
use crate::error::LaunchError;
use crate::reaper::ProcessTable;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::pty::{Winsize, openpty};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock};

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Where a session's input comes from and its output goes.
pub struct SessionIo {
    pub input: Box<dyn InputSource>,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitRecord {
    status: i32,
    finished: i64,
}

pub struct Session {
    config: SessionConfig,
    pid: OnceLock<Pid>,
    started: OnceLock<i64>,
    exit: OnceLock<ExitRecord>,
    pty: OnceLock<Arc<File>>,
    bridge: Mutex<Option<Bridge>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.config.id)
            .field("pid", &self.pid.get())
            .field("exit", &self.exit.get())
            .finish()
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            pid: OnceLock::new(),
            started: OnceLock::new(),
            exit: OnceLock::new(),
            pty: OnceLock::new(),
            bridge: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid.get().copied()
    }

    pub fn started(&self) -> Option<i64> {
        self.started.get().copied()
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit.get().map(|e| e.status)
    }

    pub fn finished(&self) -> Option<i64> {
        self.exit.get().map(|e| e.finished)
    }

    pub fn has_exited(&self) -> bool {
        self.exit.get().is_some()
    }

    /// Set the exit status. Only the reaper calls this, and only the first
    /// call has any effect.
    pub(crate) fn record_exit(&self, status: i32) -> bool {
        self.exit
            .set(ExitRecord {
                status,
                finished: chrono::Utc::now().timestamp(),
            })
            .is_ok()
    }

    /// Send `signal` to the process if it is still running.
    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        match self.pid() {
            Some(pid) if !self.has_exited() => kill(pid, signal),
            _ => Ok(()),
        }
    }

    pub fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        match self.pty.get() {
            Some(pty) => crate::bridge::set_window_size(pty.as_raw_fd(), cols, rows),
            None => Ok(()),
        }
    }

    /// Stop tracking the copy workers; they end on their own once the
    /// process side closes.
    pub fn detach(&self) {
        if let Ok(mut bridge) = self.bridge.lock() {
            bridge.take();
        }
    }

    /// Start the process and wire its I/O.
    ///
    /// `env` is the environment the process runs with; the executable is
    /// searched for in its `PATH`.
    pub fn launch(
        self: &Arc<Self>,
        table: &ProcessTable,
        env: Vec<String>,
        io: SessionIo,
    ) -> Result<Pid, LaunchError> {
        if self.pid.get().is_some() {
            return Err(LaunchError::AlreadyStarted(self.id().to_string()));
        }
        let config = &self.config;
        if config.cmd.is_empty() {
            return Err(LaunchError::Invalid(format!("{}: empty command", config.id)));
        }

        let dir = config.dir.clone().unwrap_or_else(|| "/".to_string());
        let path = look_path(&config.cmd, &env, Path::new(&dir))?;

        let mut cmd = Command::new(&path);
        cmd.arg0(&config.cmd)
            .args(&config.args)
            .env_clear()
            .envs(env.iter().filter_map(|e| e.split_once('=')))
            .current_dir(&dir);
        if let Some(uid) = config.user {
            cmd.uid(uid);
        }
        if let Some(gid) = config.group {
            cmd.gid(gid);
        }

        tracing::info!(
            "Launching session {} ({}): {:?} {:?}",
            config.id,
            config.name,
            path,
            config.args
        );

        let mut bridge = Bridge::new();
        let pid = if config.tty {
            self.launch_pty(table, cmd, io, &mut bridge)?
        } else {
            self.launch_pipes(table, cmd, io, &mut bridge)?
        };

        let _ = self.started.set(chrono::Utc::now().timestamp());
        if let Ok(mut slot) = self.bridge.lock() {
            *slot = Some(bridge);
        }
        tracing::info!("Session {} running as pid {}", config.id, pid);
        Ok(pid)
    }

    fn launch_pty(
        self: &Arc<Self>,
        table: &ProcessTable,
        mut cmd: Command,
        io: SessionIo,
        bridge: &mut Bridge,
    ) -> Result<Pid, LaunchError> {
        let size = Winsize {
            ws_row: self.config.rows.unwrap_or(DEFAULT_ROWS),
            ws_col: self.config.cols.unwrap_or(DEFAULT_COLS),
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&size), None::<&nix::sys::termios::Termios>)?;
        set_cloexec(&pty.master)?;
        set_cloexec(&pty.slave)?;

        cmd.stdin(Stdio::from(pty.slave.try_clone()?))
            .stdout(Stdio::from(pty.slave.try_clone()?))
            .stderr(Stdio::from(pty.slave));

        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()?;
                if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = table.spawn_tracked(self, || cmd.spawn())?;
        let pid = Pid::from_raw(child.id() as i32);
        self.mark_started(pid);
        // the Command still holds copies of the slave side
        drop(cmd);
        drop(child);

        let master = Arc::new(File::from(pty.master));
        let _ = self.pty.set(master.clone());

        let id = self.id();
        bridge.output(
            format!("{}-pty-out", id),
            PtyReader(master.clone()),
            io.stdout,
        )?;
        bridge.input(
            format!("{}-pty-in", id),
            io.input,
            PtyWriter(master.clone()),
            Control::new(pid, Some(master)),
        )?;
        Ok(pid)
    }

    fn launch_pipes(
        self: &Arc<Self>,
        table: &ProcessTable,
        mut cmd: Command,
        io: SessionIo,
        bridge: &mut Bridge,
    ) -> Result<Pid, LaunchError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = table.spawn_tracked(self, || cmd.spawn())?;
        let pid = Pid::from_raw(child.id() as i32);
        self.mark_started(pid);

        let id = self.id();
        if let Some(stdout) = child.stdout.take() {
            bridge.output(format!("{}-stdout", id), stdout, io.stdout)?;
        }
        if let Some(stderr) = child.stderr.take() {
            bridge.output(format!("{}-stderr", id), stderr, io.stderr)?;
        }
        if let Some(stdin) = child.stdin.take() {
            bridge.input(
                format!("{}-stdin", id),
                io.input,
                stdin,
                Control::new(pid, None),
            )?;
        }
        // dropping the handle neither waits nor kills; the reaper owns the exit
        drop(child);
        Ok(pid)
    }

    fn mark_started(&self, pid: Pid) {
        let _ = self.pid.set(pid);
    }
}

fn set_cloexec(fd: &OwnedFd) -> nix::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn find_executable(file: &Path) -> Result<(), LaunchError> {
    let name = file.display().to_string();
    let meta = std::fs::metadata(file).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => LaunchError::NotFound(name.clone()),
        io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied(name.clone()),
        _ => LaunchError::Io(e),
    })?;

    if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
        Ok(())
    } else {
        Err(LaunchError::PermissionDenied(name))
    }
}

/// Resolve `file` the way a shell would, but against the session's own
/// environment rather than the tether's.
///
/// Names starting with `./` or `../` are resolved against `dir` only, other
/// names containing a `/` are used as they are, and bare names are searched
/// in the `PATH` entry of `env`. An empty `PATH` element means `dir`.
pub fn look_path(file: &str, env: &[String], dir: &Path) -> Result<PathBuf, LaunchError> {
    if file.starts_with("./") || file.starts_with("../") {
        let path = dir.join(file);
        find_executable(&path)?;
        return Ok(path);
    }

    if file.contains('/') {
        let path = PathBuf::from(file);
        find_executable(&path)?;
        return Ok(path);
    }

    let path_env = env
        .iter()
        .find_map(|entry| entry.strip_prefix("PATH="))
        .unwrap_or_default();

    if !path_env.is_empty() {
        for element in path_env.split(':') {
            let candidate = if element.is_empty() {
                dir.join(file)
            } else {
                Path::new(element).join(file)
            };
            if find_executable(&candidate).is_ok() {
                return Ok(candidate);
            }
        }
    }

    Err(LaunchError::NotFound(file.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_look_path_searches_session_path() {
        let usr_bin = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        let foo = touch(bin.path(), "foo", 0o755);

        let env = vec![format!(
            "PATH={}:{}",
            usr_bin.path().display(),
            bin.path().display()
        )];
        let resolved = look_path("foo", &env, Path::new("/")).unwrap();
        assert_eq!(resolved, foo);
    }

    #[test]
    fn test_look_path_first_match_wins() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let expected = touch(first.path(), "tool", 0o755);
        touch(second.path(), "tool", 0o755);

        let env = vec![format!(
            "PATH={}:{}",
            first.path().display(),
            second.path().display()
        )];
        assert_eq!(look_path("tool", &env, Path::new("/")).unwrap(), expected);
    }

    #[test]
    fn test_look_path_skips_non_executable() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        touch(first.path(), "tool", 0o644);
        let expected = touch(second.path(), "tool", 0o700);

        let env = vec![format!(
            "PATH={}:{}",
            first.path().display(),
            second.path().display()
        )];
        assert_eq!(look_path("tool", &env, Path::new("/")).unwrap(), expected);
    }

    #[test]
    fn test_look_path_relative_ignores_path() {
        let workdir = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        touch(elsewhere.path(), "foo", 0o755);

        let env = vec![format!("PATH={}", elsewhere.path().display())];
        let missing = look_path("./foo", &env, workdir.path());
        assert!(matches!(missing, Err(LaunchError::NotFound(_))));

        touch(workdir.path(), "foo", 0o755);
        let resolved = look_path("./foo", &env, workdir.path()).unwrap();
        assert_eq!(resolved, workdir.path().join("./foo"));
    }

    #[test]
    fn test_look_path_empty_element_is_workdir() {
        let workdir = TempDir::new().unwrap();
        let expected = touch(workdir.path(), "local", 0o755);

        let env = vec!["PATH=/nonexistent::".to_string()];
        assert_eq!(look_path("local", &env, workdir.path()).unwrap(), expected);
    }

    #[test]
    fn test_look_path_not_found() {
        let env = vec!["HOME=/root".to_string()];
        let result = look_path("definitely-not-here", &env, Path::new("/"));
        assert!(matches!(result, Err(LaunchError::NotFound(_))));
    }

    #[test]
    fn test_look_path_qualified() {
        let dir = TempDir::new().unwrap();
        let exe = touch(dir.path(), "run", 0o755);
        let data = touch(dir.path(), "data", 0o644);

        let env = Vec::new();
        assert_eq!(
            look_path(exe.to_str().unwrap(), &env, Path::new("/")).unwrap(),
            exe
        );
        assert!(matches!(
            look_path(data.to_str().unwrap(), &env, Path::new("/")),
            Err(LaunchError::PermissionDenied(_))
        ));
        assert!(matches!(
            look_path(dir.path().to_str().unwrap(), &env, Path::new("/")),
            Err(LaunchError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_record_exit_once() {
        let session = Session::new(SessionConfig::new("s1", "/bin/true", &[]));
        assert!(session.record_exit(0));
        assert!(!session.record_exit(1));
        assert_eq!(session.exit_status(), Some(0));
        assert!(session.finished().is_some());
    }

    #[test]
    fn test_signal_before_launch_is_noop() {
        let session = Session::new(SessionConfig::new("s1", "/bin/true", &[]));
        assert!(session.signal(Signal::SIGTERM).is_ok());
        assert!(session.resize(24, 80).is_ok());
    }
}
