//! Mediated (virtual-GPU-like) device discovery and allocation.
//!
//! Mediated devices are enumerated from the mdev device tree. Each instance
//! is advertised by its IOMMU group like a PCI device, but allocation
//! re-checks that the VFIO node still exists: the types manager can tear an
//! mdev down at any moment.

use crate::error::{DevletError, Result};
use crate::plugin::{topology, DevicePluginOps, PluginPaths, PluginRuntime};
use crate::sysfs;
use devlet_api::deviceplugin::v1beta1 as api;
use devlet_api::HEALTHY;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable prefix carrying allocated mdev UUIDs.
pub const MDEV_RESOURCE_PREFIX: &str = "MDEV_PCI_RESOURCE";

/// One instantiated mediated device.
#[derive(Debug, Clone)]
pub struct MdevDevice {
    pub uuid: String,
    /// Normalized type name used for selector matching, e.g. "GRID_T4-1B",
    /// or the raw type id when the card exposes no display name.
    pub type_name: String,
    /// PCI address of the physical parent card.
    pub parent_address: String,
    pub iommu_group: String,
    pub numa_node: i32,
}

/// Normalize an mdev type name or selector for comparison.
pub fn normalize_selector(selector: &str) -> String {
    selector.trim().replace(' ', "_")
}

/// Resolve the type name of an mdev instance: the type's `name` attribute
/// when present, the `mdev_type` symlink basename otherwise.
fn read_type_name(uuid_dir: &Path) -> Option<String> {
    let type_link = uuid_dir.join("mdev_type");
    match std::fs::read_to_string(type_link.join("name")) {
        Ok(name) => Some(normalize_selector(&name)),
        Err(_) => sysfs::read_link_name(&type_link),
    }
}

/// The parent card's PCI address, two levels above the resolved type
/// directory (`<parent>/mdev_supported_types/<type>`).
fn read_parent_address(uuid_dir: &Path) -> Option<String> {
    let type_dir = std::fs::canonicalize(uuid_dir.join("mdev_type")).ok()?;
    let supported_types_dir = type_dir.parent()?;
    supported_types_dir.parent()?.file_name().map(|n| n.to_string_lossy().to_string())
}

/// Walk the mdev tree and index instances by normalized type name.
pub fn discover_mdevs(
    mdev_devices_root: &Path,
    pci_root: &Path,
) -> HashMap<String, Vec<MdevDevice>> {
    let mut by_type: HashMap<String, Vec<MdevDevice>> = HashMap::new();
    let entries = match std::fs::read_dir(mdev_devices_root) {
        Ok(entries) => entries,
        Err(_) => {
            debug!(path = ?mdev_devices_root, "no mediated devices present");
            return by_type;
        }
    };

    for entry in entries.flatten() {
        let uuid = entry.file_name().to_string_lossy().to_string();
        let uuid_dir = entry.path();

        let Some(type_name) = read_type_name(&uuid_dir) else {
            debug!(uuid = %uuid, "mdev has no resolvable type, skipping");
            continue;
        };
        let Some(parent_address) = read_parent_address(&uuid_dir) else {
            debug!(uuid = %uuid, "mdev has no resolvable parent, skipping");
            continue;
        };
        let Some(iommu_group) = sysfs::read_link_name(&uuid_dir.join("iommu_group")) else {
            warn!(uuid = %uuid, "mdev has no IOMMU group, skipping");
            continue;
        };
        let numa_node = sysfs::read_numa_node(&pci_root.join(&parent_address));

        by_type.entry(type_name.clone()).or_default().push(MdevDevice {
            uuid,
            type_name,
            parent_address,
            iommu_group,
            numa_node,
        });
    }
    by_type
}

/// Build the device plugin for one mediated-device resource.
pub fn new_mdev_device_plugin(
    resource_name: &str,
    devices: &[MdevDevice],
    paths: &PluginPaths,
) -> PluginRuntime {
    let devs: Vec<api::Device> = devices
        .iter()
        .map(|dev| api::Device {
            id: dev.iommu_group.clone(),
            health: HEALTHY.to_string(),
            topology: topology(dev.numa_node),
        })
        .collect();

    let iommu_to_uuid: HashMap<String, String> =
        devices.iter().map(|d| (d.iommu_group.clone(), d.uuid.clone())).collect();
    let names: HashMap<String, String> = devices
        .iter()
        .map(|d| (d.iommu_group.clone(), format!("{} [{}]", d.uuid, d.type_name)))
        .collect();
    let groups: Vec<String> = devices.iter().map(|d| d.iommu_group.clone()).collect();

    let env_var = sysfs::resource_name_to_env_var(MDEV_RESOURCE_PREFIX, resource_name);
    let resource = resource_name.to_string();
    let device_root = paths.device_root.clone();
    let allocate_root = device_root.clone();

    let ops = DevicePluginOps {
        allocate: Box::new(move |request| {
            allocate_mdev_devices(request, &iommu_to_uuid, &env_var, &resource, &allocate_root)
        }),
        setup_monitored_devices: Box::new(move |monitored| {
            for group in &groups {
                let node = format!("{}/{}", super::VFIO_DEVICE_DIR, group);
                monitored.monitor(sysfs::host_path(&device_root, Path::new(&node)), group.clone());
            }
            monitored
                .watch_dir(sysfs::host_path(&device_root, Path::new(super::VFIO_DEVICE_DIR)));
            monitored.watch_dir(sysfs::host_path(&device_root, Path::new("/dev")));
            Ok(())
        }),
        setup: None,
        device_name_by_id: Some(Box::new(move |id| {
            names.get(id).cloned().unwrap_or_else(|| format!("device plugin ({})", id))
        })),
        configure_permissions: None,
        mutate_health: None,
    };

    PluginRuntime::new(resource_name, devs, ops, paths)
}

fn allocate_mdev_devices(
    request: &api::AllocateRequest,
    iommu_to_uuid: &HashMap<String, String>,
    env_var: &str,
    resource: &str,
    device_root: &PathBuf,
) -> Result<api::AllocateResponse> {
    let mut container_responses = Vec::new();
    for container in &request.container_requests {
        let mut devices = Vec::new();
        let mut uuids = Vec::new();
        for id in &container.devices_ids {
            match iommu_to_uuid.get(id) {
                Some(uuid) => {
                    // The types manager may have torn the mdev down since
                    // discovery; never grant a node that is already gone.
                    let node = format!("{}/{}", super::VFIO_DEVICE_DIR, id);
                    if !sysfs::host_path(device_root, Path::new(&node)).exists() {
                        return Err(DevletError::DeviceVanished { id: id.clone() });
                    }
                    uuids.push(uuid.clone());
                    devices.extend(super::vfio_device_specs(id));
                }
                None => {
                    warn!(id = %id, resource = %resource, "allocation requested an unknown device, skipping");
                }
            }
        }
        if uuids.is_empty() {
            return Err(DevletError::NoDevicesResolved { resource: resource.to_string() });
        }
        let envs = HashMap::from([(env_var.to_string(), uuids.join(","))]);
        container_responses.push(api::ContainerAllocateResponse {
            envs,
            mounts: vec![],
            devices,
            annotations: HashMap::new(),
        });
    }
    Ok(api::AllocateResponse { container_responses })
}
