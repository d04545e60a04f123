//! Centralized path configuration for devlet.
//!
//! All host paths go through this module so the daemon, the plugins and the
//! tests agree on where the sysfs trees and the device-plugin directory live,
//! whether running on the host or inside a container with the host root
//! mounted elsewhere.

use std::path::PathBuf;

/// Sysfs tree of PCI devices.
pub const PCI_DEVICES_PATH: &str = "/sys/bus/pci/devices";

/// Sysfs tree of instantiated mediated devices.
pub const MDEV_DEVICES_PATH: &str = "/sys/bus/mdev/devices";

/// Sysfs tree of mediated-device-capable parent cards.
pub const MDEV_BUS_PATH: &str = "/sys/class/mdev_bus";

/// Sysfs tree of USB devices.
pub const USB_DEVICES_PATH: &str = "/sys/bus/usb/devices";

/// Name of the node agent's registration socket inside the plugin directory.
pub const REGISTRY_SOCKET_NAME: &str = "kubelet.sock";

/// Get the device-plugin directory shared with the node agent.
///
/// Resolution order:
/// 1. `DEVLET_PLUGIN_DIR` environment variable
/// 2. the node agent's well-known device-plugin directory
pub fn plugin_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DEVLET_PLUGIN_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from("/var/lib/kubelet/device-plugins")
}

/// Get the host filesystem root.
///
/// `/` when running on the host directly; the mount point of the host root
/// when running containerized (`DEVLET_HOST_ROOT`).
pub fn host_root() -> PathBuf {
    std::env::var("DEVLET_HOST_ROOT").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/"))
}

/// Get the daemon configuration file path.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DEVLET_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/devlet/config.json")
}
