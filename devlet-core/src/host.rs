//! Privileged host operations behind the `DeviceHandler` trait.
//!
//! Everything that writes to the host filesystem with elevated privileges
//! (mdev provisioning control files, device-node ownership, SELinux labels)
//! goes through this trait so components receive it by constructor injection
//! and tests can substitute a fake without touching global state.

use crate::error::{DevletError, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;
use uuid::Uuid;

/// Unprivileged uid/gid that owns device nodes handed to workload containers.
pub const UNPRIVILEGED_UID: u32 = 107;

/// Privileged host operations needed by the plugins and the mdev manager.
pub trait DeviceHandler: Send + Sync {
    /// Provision one mediated device of `type_id` on the parent card, by
    /// writing the generated UUID into the type's `create` control file.
    fn create_mdev(&self, type_id: &str, parent: &str, uuid: &Uuid) -> Result<()>;

    /// Destroy a mediated device by writing to its `remove` control file.
    fn remove_mdev(&self, uuid: &str) -> Result<()>;

    /// Read how many more instances of `type_id` the parent card can host.
    fn read_mdev_available_instances(&self, type_id: &str, parent: &str) -> Result<u32>;

    /// Hand ownership of a device node or socket to the unprivileged user.
    fn chown_unprivileged(&self, path: &Path) -> Result<()>;

    /// Apply a security-context label to a file.
    fn relabel(&self, label: &str, path: &Path) -> Result<()>;
}

/// `DeviceHandler` implementation that mutates the real host filesystem.
pub struct LocalDeviceHandler {
    mdev_bus_root: PathBuf,
    mdev_devices_root: PathBuf,
    unprivileged_uid: u32,
}

impl LocalDeviceHandler {
    pub fn new(mdev_bus_root: impl Into<PathBuf>, mdev_devices_root: impl Into<PathBuf>) -> Self {
        Self {
            mdev_bus_root: mdev_bus_root.into(),
            mdev_devices_root: mdev_devices_root.into(),
            unprivileged_uid: UNPRIVILEGED_UID,
        }
    }

    fn supported_type_dir(&self, type_id: &str, parent: &str) -> PathBuf {
        self.mdev_bus_root.join(parent).join("mdev_supported_types").join(type_id)
    }
}

impl Default for LocalDeviceHandler {
    fn default() -> Self {
        Self::new(crate::paths::MDEV_BUS_PATH, crate::paths::MDEV_DEVICES_PATH)
    }
}

impl DeviceHandler for LocalDeviceHandler {
    fn create_mdev(&self, type_id: &str, parent: &str, uuid: &Uuid) -> Result<()> {
        let create = self.supported_type_dir(type_id, parent).join("create");
        debug!(%type_id, %parent, %uuid, "creating mediated device");
        std::fs::write(&create, uuid.to_string()).map_err(|e| DevletError::io(&create, e))
    }

    fn remove_mdev(&self, uuid: &str) -> Result<()> {
        let remove = self.mdev_devices_root.join(uuid).join("remove");
        debug!(%uuid, "removing mediated device");
        std::fs::write(&remove, "1").map_err(|e| DevletError::io(&remove, e))
    }

    fn read_mdev_available_instances(&self, type_id: &str, parent: &str) -> Result<u32> {
        let path = self.supported_type_dir(type_id, parent).join("available_instances");
        let value = crate::sysfs::read_value(&path)?;
        value
            .parse()
            .map_err(|_| DevletError::Internal(format!("unparsable available_instances at {:?}", path)))
    }

    fn chown_unprivileged(&self, path: &Path) -> Result<()> {
        std::os::unix::fs::chown(path, Some(self.unprivileged_uid), Some(self.unprivileged_uid))
            .map_err(|e| DevletError::Permissions { path: path.to_path_buf(), reason: e.to_string() })
    }

    fn relabel(&self, label: &str, path: &Path) -> Result<()> {
        let status = Command::new("chcon")
            .arg("-t")
            .arg(label)
            .arg(path)
            .status()
            .map_err(|e| DevletError::Permissions { path: path.to_path_buf(), reason: e.to_string() })?;
        if !status.success() {
            return Err(DevletError::Permissions {
                path: path.to_path_buf(),
                reason: format!("chcon exited with {}", status),
            });
        }
        Ok(())
    }
}
