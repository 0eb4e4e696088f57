//! Moor tether: the supervisor that runs as PID 1 inside each container VM.
//!
//! It pulls the desired state of the VM from a key/value channel shared with
//! the host, launches and reaps the container's processes, drives guest-side
//! extensions (network, hostname, disks, live fork) and reports session
//! status back through the same channel.

pub mod attach;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod extension;
pub mod extensions;
pub mod netif;
pub mod ops;
pub mod reaper;
pub mod session;
pub mod tether;

pub use channel::{Channel, Delta, FileChannel, MemoryChannel};
pub use config::{
    DiskMount, ExecutorConfig, NetworkEndpoint, Rejected, SessionConfig, SessionStatus, Snapshot,
};
pub use error::{ChannelError, ConfigError, ExtensionError, LaunchError, TetherError};
pub use extension::{Extension, ExtensionBase, ExtensionRegistry, ExtensionState, RollbackPolicy};
pub use ops::{LinuxOperations, Operations};
pub use session::{Session, SessionIo};
pub use tether::{Tether, TetherHandle, TetherOptions};
