//! Configuration snapshot exchanged with the host through the channel.

pub mod codec;

use crate::error::ConfigError;
use codec::{Decode, Decoder, Encode, Encoder, Scalar};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

pub use codec::{KeyValues, decode, encode};

/// Filesystem type used when a disk does not name one.
pub const DEFAULT_FSTYPE: &str = "ext4";

/// The whole desired and observed state of one container VM.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorConfig {
    pub id: String,
    pub name: String,
    /// Unix seconds.
    pub created: i64,
    pub hostname: Option<String>,
    pub aliases: Vec<String>,
    /// Live-fork requested by the host.
    pub fork: bool,
    pub sessions: BTreeMap<String, SessionConfig>,
    pub networks: BTreeMap<String, NetworkEndpoint>,
    pub mounts: BTreeMap<String, DiskMount>,
}

impl ExecutorConfig {
    pub fn new(id: &str, name: &str, created: i64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            created,
            ..Default::default()
        }
    }

    pub fn add_session(&mut self, session: SessionConfig) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn add_network(&mut self, endpoint: NetworkEndpoint) {
        self.networks.insert(endpoint.name.clone(), endpoint);
    }

    pub fn add_mount(&mut self, disk: DiskMount) {
        self.mounts.insert(disk.label.clone(), disk);
    }
}

impl Encode for ExecutorConfig {
    fn encode(&self, enc: &mut Encoder<'_>) {
        let mut executor = enc.nested("executor");
        executor.scalar("id", &self.id);
        executor.scalar("name", &self.name);
        executor.scalar("created", &self.created);

        enc.optional("hostname", &self.hostname);
        enc.list("aliases", &self.aliases);
        enc.scalar("fork", &self.fork);
        enc.map(SESSION, &self.sessions);
        enc.map(NETWORK, &self.networks);
        enc.map(MOUNT, &self.mounts);
    }
}

impl ExecutorConfig {
    /// Decode the executor strictly and its maps entry by entry, collecting
    /// the entries that fail in `rejected`.
    fn decode_entries(dec: &Decoder<'_>, rejected: &mut Vec<Rejected>) -> Result<Self, ConfigError> {
        let executor = dec.nested("executor");
        Ok(Self {
            id: executor.required("id")?,
            name: executor.required("name")?,
            created: executor.required("created")?,
            hostname: dec.optional("hostname")?,
            aliases: dec.list("aliases")?,
            fork: dec.flag("fork")?,
            sessions: lenient_map(dec, SESSION, rejected),
            networks: lenient_map(dec, NETWORK, rejected),
            mounts: lenient_map(dec, MOUNT, rejected),
        })
    }
}

impl Decode for ExecutorConfig {
    fn decode(dec: &Decoder<'_>) -> Result<Self, ConfigError> {
        let mut rejected = Vec::new();
        let config = Self::decode_entries(dec, &mut rejected)?;
        match rejected.into_iter().next() {
            Some(entry) => Err(entry.error),
            None => Ok(config),
        }
    }
}

const SESSION: &str = "session";
const NETWORK: &str = "network";
const MOUNT: &str = "mount";

fn lenient_map<T: Decode>(
    dec: &Decoder<'_>,
    section: &'static str,
    rejected: &mut Vec<Rejected>,
) -> BTreeMap<String, T> {
    let (entries, failed) = dec.map_lenient(section);
    rejected.extend(
        failed
            .into_iter()
            .map(|(id, error)| Rejected { section, id, error }),
    );
    entries
}

/// A map entry left out of a [`Snapshot`] because it did not decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    /// `session`, `network` or `mount`.
    pub section: &'static str,
    pub id: String,
    pub error: ConfigError,
}

impl Rejected {
    pub fn is_session(&self) -> bool {
        self.section == SESSION
    }
}

/// What the tether acts on after reading the channel. A bad session,
/// network or mount entry only drops that entry.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub config: ExecutorConfig,
    pub rejected: Vec<Rejected>,
}

impl Snapshot {
    /// Fails only when the executor keys themselves are unreadable.
    pub fn decode(kv: &KeyValues) -> Result<Self, ConfigError> {
        let mut rejected = Vec::new();
        let config = ExecutorConfig::decode_entries(&Decoder::root(kv), &mut rejected)?;
        Ok(Self { config, rejected })
    }
}

/// Channel key of one field of a session entry, e.g. `session.<id>.cmd`.
pub fn session_key(id: &str, field: &str) -> String {
    format!("{}.{}.{}", SESSION, codec::escape_segment(id), field)
}

/// One process the tether should run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionConfig {
    pub id: String,
    pub name: String,
    pub cmd: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` entries, in order.
    pub env: Vec<String>,
    pub dir: Option<String>,
    pub user: Option<u32>,
    pub group: Option<u32>,
    pub tty: bool,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    /// vsock port on the host to attach the session's I/O to.
    pub attach: Option<u32>,
    pub status: SessionStatus,
}

impl SessionConfig {
    pub fn new(id: &str, cmd: &str, args: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            cmd: cmd.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Value of `key` in the session's own environment.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// True once the session has run to completion or failed to launch.
    pub fn is_complete(&self) -> bool {
        self.status.exit_status.is_some() || self.status.error.is_some()
    }
}

impl Encode for SessionConfig {
    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.scalar("name", &self.name);
        enc.scalar("cmd", &self.cmd);
        enc.list("args", &self.args);
        enc.list("env", &self.env);
        enc.optional("dir", &self.dir);
        enc.optional("user", &self.user);
        enc.optional("group", &self.group);
        enc.scalar("tty", &self.tty);
        enc.optional("rows", &self.rows);
        enc.optional("cols", &self.cols);
        enc.optional("attach", &self.attach);
        self.status.encode(enc);
    }
}

impl Decode for SessionConfig {
    fn decode(dec: &Decoder<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            id: dec.entry_key().to_string(),
            name: dec.required("name")?,
            cmd: dec.required("cmd")?,
            args: dec.list("args")?,
            env: dec.list("env")?,
            dir: dec.optional("dir")?,
            user: dec.optional("user")?,
            group: dec.optional("group")?,
            tty: dec.flag("tty")?,
            rows: dec.optional("rows")?,
            cols: dec.optional("cols")?,
            attach: dec.optional("attach")?,
            status: SessionStatus::decode(dec)?,
        })
    }
}

/// Fields the tether reports back for a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub pid: Option<i32>,
    pub started: Option<i64>,
    pub finished: Option<i64>,
    pub exit_status: Option<i32>,
    /// Launch failure, if the process never ran.
    pub error: Option<String>,
}

impl Encode for SessionStatus {
    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.optional("pid", &self.pid);
        enc.optional("started", &self.started);
        enc.optional("finished", &self.finished);
        enc.optional("exit_status", &self.exit_status);
        enc.optional("error", &self.error);
    }
}

impl Decode for SessionStatus {
    fn decode(dec: &Decoder<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            pid: dec.optional("pid")?,
            started: dec.optional("started")?,
            finished: dec.optional("finished")?,
            exit_status: dec.optional("exit_status")?,
            error: dec.optional("error")?,
        })
    }
}

struct StatusReport<'a>(&'a BTreeMap<String, SessionStatus>);

impl Encode for StatusReport<'_> {
    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.map(SESSION, self.0);
    }
}

/// Keys reporting the given session statuses, e.g. `session.<id>.pid`.
pub fn encode_statuses(statuses: &BTreeMap<String, SessionStatus>) -> KeyValues {
    encode(&StatusReport(statuses))
}

/// An address with its prefix length, e.g. `172.16.0.2/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl Scalar for Cidr {
    fn to_value(&self) -> String {
        self.to_string()
    }

    fn from_value(value: &str) -> Result<Self, String> {
        let (addr, prefix) = value
            .split_once('/')
            .ok_or_else(|| "expected address/prefix".to_string())?;
        let addr: IpAddr = addr.parse().map_err(|e| format!("{}", e))?;
        let prefix: u8 = prefix.parse().map_err(|e| format!("{}", e))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(format!("prefix {} exceeds {}", prefix, max));
        }
        Ok(Cidr { addr, prefix })
    }
}

/// A guest network interface and how to configure it.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkEndpoint {
    pub name: String,
    pub interface: String,
    /// No address means bring the link up only.
    pub ip: Option<Cidr>,
    pub gateway: Option<IpAddr>,
    pub nameservers: Vec<IpAddr>,
    pub mtu: Option<u32>,
}

impl NetworkEndpoint {
    pub fn new(name: &str, interface: &str) -> Self {
        Self {
            name: name.to_string(),
            interface: interface.to_string(),
            ip: None,
            gateway: None,
            nameservers: Vec::new(),
            mtu: None,
        }
    }
}

impl Encode for NetworkEndpoint {
    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.scalar("interface", &self.interface);
        enc.optional("ip", &self.ip);
        enc.optional("gateway", &self.gateway);
        enc.list("nameservers", &self.nameservers);
        enc.optional("mtu", &self.mtu);
    }
}

impl Decode for NetworkEndpoint {
    fn decode(dec: &Decoder<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            name: dec.entry_key().to_string(),
            interface: dec.required("interface")?,
            ip: dec.optional("ip")?,
            gateway: dec.optional("gateway")?,
            nameservers: dec.list("nameservers")?,
            mtu: dec.optional("mtu")?,
        })
    }
}

/// A labelled disk to mount in the guest.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskMount {
    pub label: String,
    pub target: String,
    pub fstype: Option<String>,
    pub options: Vec<String>,
    pub read_only: bool,
}

impl DiskMount {
    pub fn new(label: &str, target: &str) -> Self {
        Self {
            label: label.to_string(),
            target: target.to_string(),
            fstype: None,
            options: Vec::new(),
            read_only: false,
        }
    }

    pub fn fstype(&self) -> &str {
        self.fstype.as_deref().unwrap_or(DEFAULT_FSTYPE)
    }
}

impl Encode for DiskMount {
    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.scalar("target", &self.target);
        enc.optional("fstype", &self.fstype);
        enc.list("options", &self.options);
        enc.scalar("read_only", &self.read_only);
    }
}

impl Decode for DiskMount {
    fn decode(dec: &Decoder<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            label: dec.entry_key().to_string(),
            target: dec.required("target")?,
            fstype: dec.optional("fstype")?,
            options: dec.list("options")?,
            read_only: dec.flag("read_only")?,
        })
    }
}
