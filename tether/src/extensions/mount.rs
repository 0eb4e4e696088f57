use crate::config::{DiskMount, ExecutorConfig};
use crate::error::ExtensionError;
use crate::extension::{Extension, ExtensionBase};
use crate::ops::Operations;
use std::path::Path;
use std::sync::Arc;

pub(super) const NAME: &str = "mount";

/// Mounts labelled disks as they appear in the configuration and unmounts
/// them, last mounted first, on stop.
pub struct MountExtension {
    base: ExtensionBase,
    mounted: Vec<DiskMount>,
}

impl MountExtension {
    pub fn new(ops: Arc<dyn Operations>) -> Self {
        Self {
            base: ExtensionBase::new(NAME, ops),
            mounted: Vec::new(),
        }
    }
}

impl Extension for MountExtension {
    fn reload(&mut self, config: &ExecutorConfig) -> Result<(), ExtensionError> {
        for disk in config.mounts.values() {
            if self.mounted.iter().any(|m| m.label == disk.label) {
                continue;
            }
            tracing::info!("Mounting disk {} at {}", disk.label, disk.target);
            self.base
                .ops()
                .mount_label(disk)
                .map_err(|e| self.base.fail(format!("disk {}: {}", disk.label, e)))?;
            self.mounted.push(disk.clone());
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ExtensionError> {
        let mut first_error = None;
        while let Some(disk) = self.mounted.pop() {
            if let Err(e) = self.base.ops().unmount(Path::new(&disk.target)) {
                tracing::warn!("Failed to unmount {}: {}", disk.target, e);
                if first_error.is_none() {
                    first_error = Some(self.base.fail(format!("unmount {}: {}", disk.target, e)));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
