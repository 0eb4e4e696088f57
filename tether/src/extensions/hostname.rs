use crate::config::ExecutorConfig;
use crate::error::ExtensionError;
use crate::extension::{Extension, ExtensionBase};
use crate::ops::Operations;
use std::sync::Arc;

pub(super) const NAME: &str = "hostname";

pub struct HostnameExtension {
    base: ExtensionBase,
    current: Option<(String, Vec<String>)>,
}

impl HostnameExtension {
    pub fn new(ops: Arc<dyn Operations>) -> Self {
        Self {
            base: ExtensionBase::new(NAME, ops),
            current: None,
        }
    }
}

impl Extension for HostnameExtension {
    fn reload(&mut self, config: &ExecutorConfig) -> Result<(), ExtensionError> {
        let Some(hostname) = &config.hostname else {
            return Ok(());
        };
        let wanted = (hostname.clone(), config.aliases.clone());
        if self.current.as_ref() == Some(&wanted) {
            return Ok(());
        }

        self.base
            .ops()
            .set_hostname(&wanted.0, &wanted.1)
            .map_err(|e| self.base.fail(e))?;
        self.current = Some(wanted);
        Ok(())
    }
}
