use crate::MountSpec;
use crate::error::MountError;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::path::{Path, PathBuf};

/// Directory populated by udev with one symlink per filesystem label.
pub const DEV_BY_LABEL: &str = "/dev/disk/by-label";

/// Resolve the device node for a filesystem label under `base`.
pub fn device_for_label(base: &Path, label: &str) -> Result<PathBuf, MountError> {
    if label.is_empty() || label.contains('/') {
        return Err(MountError::InvalidSpec(format!("bad disk label: {:?}", label)));
    }

    let device = base.join(label);
    if !device.exists() {
        return Err(MountError::DeviceNotFound(label.to_string()));
    }
    Ok(device)
}

/// Mount the device carrying `label` on `target`.
///
/// Well-known options (`noatime`, `nosuid`, `nodev`, `noexec`, `ro`) become
/// mount flags; everything else is passed through as filesystem data.
pub fn mount_label(label: &str, target: &Path, spec: &MountSpec) -> Result<(), MountError> {
    let device = device_for_label(Path::new(DEV_BY_LABEL), label)?;
    std::fs::create_dir_all(target)?;

    let (mut flags, data) = split_options(&spec.options);
    if spec.read_only {
        flags |= MsFlags::MS_RDONLY;
    }

    tracing::info!(
        "Mounting {:?} ({}) on {:?} as {} with flags {:?}, data {:?}",
        device,
        label,
        target,
        spec.fstype,
        flags,
        data
    );

    let data = (!data.is_empty()).then_some(data.as_str());
    mount(
        Some(device.as_path()),
        target,
        Some(spec.fstype.as_str()),
        flags,
        data,
    )
    .map_err(|e| MountError::MountFailed(format!("{} on {:?}: {}", label, target, e)))?;

    tracing::info!("Mounted {} at {:?}", label, target);
    Ok(())
}

fn split_options(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for opt in options {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "rw" | "defaults" => {}
            other => data.push(other),
        }
    }

    (flags, data.join(","))
}

/// Unmount a filesystem at the given path.
pub fn unmount(target: &Path) -> Result<(), MountError> {
    tracing::debug!("Unmounting {:?}", target);

    umount2(target, MntFlags::MNT_DETACH)
        .map_err(|e| MountError::UnmountFailed(format!("unmount failed: {}", e)))?;

    tracing::info!("Unmounted {:?}", target);
    Ok(())
}
