use thiserror::Error;

/// Failures decoding a configuration snapshot from the channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required key: {0}")]
    MissingKey(String),

    #[error("malformed value for {key}: {value:?} ({reason})")]
    Malformed {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel poisoned")]
    Poisoned,
}

/// Failures launching a single session. Never fatal to the tether.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("{0}: no such executable in PATH")]
    NotFound(String),

    #[error("{0}: permission denied")]
    PermissionDenied(String),

    #[error("session already started: {0}")]
    AlreadyStarted(String),

    #[error("invalid session configuration: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}

#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("extension {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("extension {name} is {state}, cannot {action}")]
    InvalidState {
        name: String,
        state: String,
        action: String,
    },

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("mount error: {0}")]
    Mount(#[from] moor_mount::MountError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}

impl ExtensionError {
    pub fn failed(name: &str, reason: impl ToString) -> Self {
        ExtensionError::Failed {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("duplicate extension: {0}")]
    DuplicateExtension(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Channel(#[from] ChannelError),

    #[error("{0}")]
    Extension(#[from] ExtensionError),

    #[error("tether is not running")]
    NotRunning,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}
