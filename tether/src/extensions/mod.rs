//! Extensions registered by the `moor-tether` binary, in dependency order.

mod fork;
mod hostname;
mod mount;
mod network;

pub use fork::ForkExtension;
pub use hostname::HostnameExtension;
pub use mount::MountExtension;
pub use network::NetworkExtension;

use crate::error::TetherError;
use crate::extension::ExtensionRegistry;
use crate::ops::Operations;
use std::sync::Arc;

/// Register the standard guest extensions: network first so that names
/// resolve, then hostname, disks, and live-fork last.
pub fn register_defaults(
    registry: &mut ExtensionRegistry,
    ops: Arc<dyn Operations>,
) -> Result<(), TetherError> {
    registry.register(network::NAME, Box::new(NetworkExtension::new(ops.clone())))?;
    registry.register(hostname::NAME, Box::new(HostnameExtension::new(ops.clone())))?;
    registry.register(mount::NAME, Box::new(MountExtension::new(ops.clone())))?;
    registry.register(fork::NAME, Box::new(ForkExtension::new(ops)))?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::mock::RecordingOps;
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::extension::RollbackPolicy;

    #[test]
    fn test_register_defaults_order() {
        let ops = Arc::new(RecordingOps::default());
        let mut registry = ExtensionRegistry::new();
        register_defaults(&mut registry, ops.clone()).unwrap();
        assert_eq!(registry.names(), vec!["network", "hostname", "mount", "fork"]);

        registry.start_all(RollbackPolicy::StopStarted).unwrap();
        let mut config = ExecutorConfig::new("abc", "web", 0);
        config.hostname = Some("web".to_string());
        config.add_network(crate::config::NetworkEndpoint::new("bridge", "eth0"));
        registry.reload_all(&config).unwrap();

        assert_eq!(ops.calls(), vec!["endpoint bridge ", "hostname web "]);
    }
}
