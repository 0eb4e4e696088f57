//! moor-tether: guest supervisor for moor container VMs.
//!
//! Usage:
//!   moor-tether [--config /.moor/config.json] [--log-dir /var/log/moor]

use clap::{Parser, ValueEnum};
use moor_tether::{FileChannel, LinuxOperations, RollbackPolicy, Tether, TetherHandle, TetherOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum Rollback {
    /// Stop extensions that already started
    StopStarted,
    /// Leave them running
    #[value(name = "none")]
    Keep,
}

impl From<Rollback> for RollbackPolicy {
    fn from(value: Rollback) -> Self {
        match value {
            Rollback::StopStarted => RollbackPolicy::StopStarted,
            Rollback::Keep => RollbackPolicy::None,
        }
    }
}

#[derive(Parser)]
#[command(name = "moor-tether")]
#[command(about = "Supervisor running as init inside a moor container VM")]
struct Cli {
    /// Key/value channel shared with the host
    #[arg(long, env = "MOOR_TETHER_CONFIG", default_value = "/.moor/config.json")]
    config: PathBuf,

    /// Directory for the output of sessions without an attach port
    #[arg(long, default_value = "/var/log/moor")]
    log_dir: PathBuf,

    /// Seconds sessions get to exit after SIGTERM
    #[arg(long, default_value_t = 10)]
    grace_secs: u64,

    /// What to do with started extensions when a later one fails to start
    #[arg(long, value_enum, default_value = "stop-started")]
    rollback: Rollback,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,
}

/// SIGTERM and SIGINT stop the tether, SIGHUP reloads its configuration.
async fn forward_signals(handle: TetherHandle) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT");
                break;
            }
            _ = sighup.recv() => {
                tracing::info!("Received SIGHUP, reloading configuration");
                if let Err(e) = handle.reload().await {
                    tracing::error!("Reload failed: {}", e);
                }
            }
        }
    }
    handle.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::process::id() != 1 {
        // orphans of our sessions must still come back to us
        if let Err(e) = nix::sys::prctl::set_child_subreaper(true) {
            tracing::warn!("Failed to become child subreaper: {}", e);
        }
    }

    tracing::info!("Reading configuration from {:?}", cli.config);
    let channel = Arc::new(FileChannel::new(&cli.config));
    let ops = Arc::new(LinuxOperations::new(&cli.log_dir));
    let options = TetherOptions {
        grace_period: Duration::from_secs(cli.grace_secs),
        rollback: cli.rollback.into(),
        ..Default::default()
    };

    let mut tether = Tether::new(channel, ops.clone(), options);
    if let Err(e) = moor_tether::extensions::register_defaults(tether.extensions_mut(), ops) {
        tracing::error!("Failed to register extensions: {}", e);
        return ExitCode::FAILURE;
    }

    let handle = tether.handle();
    tokio::spawn(async move {
        if let Err(e) = forward_signals(handle).await {
            tracing::error!("Failed to install signal handlers: {}", e);
        }
    });

    match tether.start().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Tether failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
