//! Per-device-class discovery and allocation.
//!
//! Each submodule scans its corner of sysfs, matches the configured
//! selectors and builds a [`crate::plugin::PluginRuntime`] whose capability
//! table carries the class-specific `Allocate` and health-monitoring logic.

use crate::plugin::PluginPaths;
use devlet_api::deviceplugin::v1beta1 as api;
use std::path::PathBuf;

pub mod generic;
pub mod mediated;
pub mod pci;
pub mod socket;
pub mod usb;

/// Absolute path of the VFIO container control node.
pub const VFIO_CONTAINER_PATH: &str = "/dev/vfio/vfio";

/// Directory of per-IOMMU-group VFIO device nodes.
pub const VFIO_DEVICE_DIR: &str = "/dev/vfio";

/// The device specs a container needs to drive a VFIO-backed device: the
/// VFIO container node plus the IOMMU group's own node.
pub fn vfio_device_specs(iommu_group: &str) -> Vec<api::DeviceSpec> {
    let group_path = format!("{}/{}", VFIO_DEVICE_DIR, iommu_group);
    vec![
        api::DeviceSpec {
            container_path: VFIO_CONTAINER_PATH.to_string(),
            host_path: VFIO_CONTAINER_PATH.to_string(),
            permissions: "mrw".to_string(),
        },
        api::DeviceSpec {
            container_path: group_path.clone(),
            host_path: group_path,
            permissions: "mrw".to_string(),
        },
    ]
}

/// Where the sysfs trees and the plugin directory live. Overridable so tests
/// can point everything at a fake tree.
#[derive(Debug, Clone)]
pub struct DiscoveryPaths {
    pub pci_root: PathBuf,
    pub mdev_devices_root: PathBuf,
    pub mdev_bus_root: PathBuf,
    pub usb_root: PathBuf,
    pub plugin: PluginPaths,
}

impl Default for DiscoveryPaths {
    fn default() -> Self {
        Self {
            pci_root: PathBuf::from(crate::paths::PCI_DEVICES_PATH),
            mdev_devices_root: PathBuf::from(crate::paths::MDEV_DEVICES_PATH),
            mdev_bus_root: PathBuf::from(crate::paths::MDEV_BUS_PATH),
            usb_root: PathBuf::from(crate::paths::USB_DEVICES_PATH),
            plugin: PluginPaths::default(),
        }
    }
}
