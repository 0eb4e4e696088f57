mod disk;
mod error;

pub use disk::{DEV_BY_LABEL, device_for_label, mount_label, unmount};
pub use error::MountError;

/// How a labelled block device should be mounted.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub fstype: String,
    pub options: Vec<String>,
    pub read_only: bool,
}

impl MountSpec {
    pub fn new(fstype: &str, options: Vec<String>) -> Self {
        Self {
            fstype: fstype.to_string(),
            options,
            read_only: false,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}
