use crate::config::{ExecutorConfig, NetworkEndpoint};
use crate::error::ExtensionError;
use crate::extension::{Extension, ExtensionBase};
use crate::ops::Operations;
use std::collections::BTreeMap;
use std::sync::Arc;

pub(super) const NAME: &str = "network";

/// Applies network endpoints. An endpoint is applied again only when its
/// configuration changes.
pub struct NetworkExtension {
    base: ExtensionBase,
    applied: BTreeMap<String, NetworkEndpoint>,
}

impl NetworkExtension {
    pub fn new(ops: Arc<dyn Operations>) -> Self {
        Self {
            base: ExtensionBase::new(NAME, ops),
            applied: BTreeMap::new(),
        }
    }
}

impl Extension for NetworkExtension {
    fn reload(&mut self, config: &ExecutorConfig) -> Result<(), ExtensionError> {
        for (name, endpoint) in &config.networks {
            if self.applied.get(name) == Some(endpoint) {
                continue;
            }
            self.base
                .ops()
                .apply_endpoint(endpoint)
                .map_err(|e| self.base.fail(format!("endpoint {}: {}", name, e)))?;
            self.applied.insert(name.clone(), endpoint.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cidr;
    use crate::config::codec::Scalar;
    use crate::extensions::mock::RecordingOps;

    fn config_with(ip: &str) -> ExecutorConfig {
        let mut config = ExecutorConfig::new("abc", "web", 0);
        let mut endpoint = NetworkEndpoint::new("bridge", "eth0");
        endpoint.ip = Some(Cidr::from_value(ip).unwrap());
        config.add_network(endpoint);
        config
    }

    #[test]
    fn test_applies_only_changes() {
        let ops = Arc::new(RecordingOps::default());
        let mut ext = NetworkExtension::new(ops.clone());

        ext.reload(&config_with("172.16.0.2/16")).unwrap();
        ext.reload(&config_with("172.16.0.2/16")).unwrap();
        ext.reload(&config_with("172.16.0.3/16")).unwrap();

        assert_eq!(
            ops.calls(),
            vec!["endpoint bridge 172.16.0.2/16", "endpoint bridge 172.16.0.3/16"]
        );
    }

    #[test]
    fn test_failure_is_retried_on_next_reload() {
        let ops = Arc::new(RecordingOps::default());
        ops.fail_on("endpoint bridge 10.0.0.2/24");
        let mut ext = NetworkExtension::new(ops.clone());

        let err = ext.reload(&config_with("10.0.0.2/24")).unwrap_err();
        assert!(matches!(err, ExtensionError::Failed { ref name, .. } if name == "network"));

        ops.failing.lock().unwrap().clear();
        ext.reload(&config_with("10.0.0.2/24")).unwrap();
        assert_eq!(ops.calls().len(), 2);
    }
}
