//! Guest OS facilities used by the core and the extensions.

use crate::attach::{RawInput, connect_vsock, framed_transport};
use crate::config::{DiskMount, ExecutorConfig, NetworkEndpoint, SessionConfig, codec};
use crate::error::ExtensionError;
use crate::netif;
use crate::session::SessionIo;
use moor_mount::MountSpec;
use std::fs::OpenOptions;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub trait Operations: Send + Sync {
    fn setup(&self) -> Result<(), ExtensionError>;

    fn cleanup(&self) -> Result<(), ExtensionError>;

    fn set_hostname(&self, hostname: &str, aliases: &[String]) -> Result<(), ExtensionError>;

    fn apply_endpoint(&self, endpoint: &NetworkEndpoint) -> Result<(), ExtensionError>;

    fn mount_label(&self, disk: &DiskMount) -> Result<(), ExtensionError>;

    fn unmount(&self, target: &Path) -> Result<(), ExtensionError>;

    /// Prepare for and perform a live fork of the VM.
    fn fork(&self) -> Result<(), ExtensionError>;

    fn session_io(&self, session: &SessionConfig) -> io::Result<SessionIo>;

    /// Environment a session's process runs with.
    fn process_env(&self, session: &SessionConfig) -> Vec<String> {
        let mut env = session.env.clone();
        if session.env_value("PATH").is_none() {
            env.push(format!("PATH={}", DEFAULT_PATH));
        }
        if session.env_value("HOME").is_none() {
            env.push("HOME=/".to_string());
        }
        if session.tty && session.env_value("TERM").is_none() {
            env.push("TERM=xterm".to_string());
        }
        env
    }

    /// Whether this exit ends the tether. The primary session shares the
    /// executor's id.
    fn handle_session_exit(&self, config: &ExecutorConfig, session: &SessionConfig) -> bool {
        session.id == config.id
    }
}

/// Operations against the running Linux guest.
pub struct LinuxOperations {
    log_dir: PathBuf,
}

impl LinuxOperations {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    pub fn session_log_path(&self, id: &str) -> PathBuf {
        self.log_dir
            .join(format!("{}.log", codec::escape_segment(id).replace('/', "%2F")))
    }
}

impl Operations for LinuxOperations {
    fn setup(&self) -> Result<(), ExtensionError> {
        std::fs::create_dir_all(&self.log_dir)?;
        if let Err(e) = netif::link_up("lo") {
            tracing::warn!("Failed to bring up loopback: {}", e);
        }
        Ok(())
    }

    fn cleanup(&self) -> Result<(), ExtensionError> {
        nix::unistd::sync();
        Ok(())
    }

    fn set_hostname(&self, hostname: &str, aliases: &[String]) -> Result<(), ExtensionError> {
        tracing::info!("Setting hostname to {} (aliases {:?})", hostname, aliases);
        nix::unistd::sethostname(hostname)?;
        write_hostname_files(Path::new("/"), hostname, aliases)?;
        Ok(())
    }

    fn apply_endpoint(&self, endpoint: &NetworkEndpoint) -> Result<(), ExtensionError> {
        let iface = &endpoint.interface;
        tracing::info!("Applying network endpoint {} on {}", endpoint.name, iface);

        if let Some(mtu) = endpoint.mtu {
            netif::set_mtu(iface, mtu)?;
        }
        if let Some(cidr) = endpoint.ip {
            let IpAddr::V4(addr) = cidr.addr else {
                return Err(ExtensionError::NotSupported(format!("IPv6 address {}", cidr)));
            };
            netif::set_address(iface, addr, cidr.prefix)?;
        }
        netif::link_up(iface)?;

        if let Some(gateway) = endpoint.gateway {
            let IpAddr::V4(gateway) = gateway else {
                return Err(ExtensionError::NotSupported(format!("IPv6 gateway {}", gateway)));
            };
            netif::add_default_route(iface, gateway)?;
        }

        add_nameservers(Path::new("/"), &endpoint.nameservers)?;
        Ok(())
    }

    fn mount_label(&self, disk: &DiskMount) -> Result<(), ExtensionError> {
        let spec = MountSpec::new(disk.fstype(), disk.options.clone()).read_only(disk.read_only);
        moor_mount::mount_label(&disk.label, Path::new(&disk.target), &spec)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), ExtensionError> {
        moor_mount::unmount(target)?;
        Ok(())
    }

    fn fork(&self) -> Result<(), ExtensionError> {
        Err(ExtensionError::NotSupported(
            "live fork is not available in this guest".to_string(),
        ))
    }

    fn session_io(&self, session: &SessionConfig) -> io::Result<SessionIo> {
        if let Some(port) = session.attach {
            tracing::info!("Attaching session {} to host port {}", session.id, port);
            let (input, stdout, stderr) = framed_transport(connect_vsock(port)?)?;
            return Ok(SessionIo {
                input: Box::new(input),
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
            });
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_log_path(&session.id))?;
        Ok(SessionIo {
            input: Box::new(RawInput::new(io::empty())),
            stderr: Box::new(log.try_clone()?),
            stdout: Box::new(log),
        })
    }
}

/// Write `/etc/hostname` and make the name resolve locally via `/etc/hosts`.
pub fn write_hostname_files(root: &Path, hostname: &str, aliases: &[String]) -> io::Result<()> {
    let etc = root.join("etc");
    std::fs::create_dir_all(&etc)?;
    std::fs::write(etc.join("hostname"), format!("{}\n", hostname))?;

    let mut names = vec![hostname.to_string()];
    names.extend(aliases.iter().cloned());
    let names = names.join(" ");

    let hosts = format!(
        "127.0.0.1 localhost {names}\n::1 localhost ip6-localhost ip6-loopback {names}\n"
    );
    std::fs::write(etc.join("hosts"), hosts)
}

/// Add `nameserver` lines to `/etc/resolv.conf` for servers not listed yet.
pub fn add_nameservers(root: &Path, servers: &[IpAddr]) -> io::Result<()> {
    if servers.is_empty() {
        return Ok(());
    }
    let etc = root.join("etc");
    std::fs::create_dir_all(&etc)?;
    let path = etc.join("resolv.conf");

    let mut contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    for server in servers {
        let line = format!("nameserver {}", server);
        if !contents.lines().any(|l| l.trim() == line) {
            if !contents.is_empty() && !contents.ends_with('\n') {
                contents.push('\n');
            }
            contents.push_str(&line);
            contents.push('\n');
        }
    }
    std::fs::write(path, contents)
}
