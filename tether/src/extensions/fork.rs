use crate::config::ExecutorConfig;
use crate::error::ExtensionError;
use crate::extension::{Extension, ExtensionBase};
use crate::ops::Operations;
use std::sync::Arc;

pub(super) const NAME: &str = "fork";

/// Triggers a live fork when the host raises the `fork` flag.
pub struct ForkExtension {
    base: ExtensionBase,
    requested: bool,
}

impl ForkExtension {
    pub fn new(ops: Arc<dyn Operations>) -> Self {
        Self {
            base: ExtensionBase::new(NAME, ops),
            requested: false,
        }
    }
}

impl Extension for ForkExtension {
    fn reload(&mut self, config: &ExecutorConfig) -> Result<(), ExtensionError> {
        let flipped = config.fork && !self.requested;
        self.requested = config.fork;
        if !flipped {
            return Ok(());
        }
        tracing::info!("Live fork requested");
        self.base.ops().fork().map_err(|e| self.base.fail(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::mock::RecordingOps;

    #[test]
    fn test_forks_on_rising_edge() {
        let ops = Arc::new(RecordingOps::default());
        let mut ext = ForkExtension::new(ops.clone());
        let mut config = ExecutorConfig::new("abc", "web", 0);

        ext.reload(&config).unwrap();
        config.fork = true;
        ext.reload(&config).unwrap();
        ext.reload(&config).unwrap();
        config.fork = false;
        ext.reload(&config).unwrap();
        config.fork = true;
        ext.reload(&config).unwrap();

        assert_eq!(ops.calls(), vec!["fork", "fork"]);
    }
}
