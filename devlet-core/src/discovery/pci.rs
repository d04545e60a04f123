//! PCI passthrough device discovery and allocation.
//!
//! Scans the PCI device tree for devices matching a configured
//! `vendor:device` selector and bound to the passthrough driver. Devices are
//! advertised to the node agent by their IOMMU group, since the group is the
//! smallest unit that can be handed to a workload safely.

use crate::error::{DevletError, Result};
use crate::plugin::{topology, DevicePluginOps, PluginPaths, PluginRuntime};
use crate::sysfs;
use devlet_api::deviceplugin::v1beta1 as api;
use devlet_api::HEALTHY;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Environment variable prefix carrying allocated PCI addresses.
pub const PCI_RESOURCE_PREFIX: &str = "PCI_RESOURCE";

/// Driver a device must be bound to for passthrough.
pub const VFIO_PCI_DRIVER: &str = "vfio-pci";

/// One passthrough-ready PCI device.
#[derive(Debug, Clone)]
pub struct PciDevice {
    /// PCI address (e.g. "0000:65:00.0").
    pub pci_address: String,
    /// Lowercase hex `vendor:device` pair (e.g. "10de:1eb8").
    pub vendor_selector: String,
    pub driver: String,
    pub iommu_group: String,
    pub numa_node: i32,
}

/// Walk the PCI tree and index passthrough-ready devices by their
/// `vendor:device` selector. Devices not bound to the passthrough driver or
/// without an IOMMU group cannot be allocated and are skipped.
pub fn discover_pci_devices(pci_root: &Path) -> HashMap<String, Vec<PciDevice>> {
    let mut by_selector: HashMap<String, Vec<PciDevice>> = HashMap::new();
    let entries = match std::fs::read_dir(pci_root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = ?pci_root, error = %e, "failed to read the PCI device tree");
            return by_selector;
        }
    };

    for entry in entries.flatten() {
        let address = entry.file_name().to_string_lossy().to_string();
        if !sysfs::is_valid_pci_address(&address) {
            continue;
        }
        let device_path = entry.path();

        let (vendor, device) = match (
            sysfs::read_id_attribute(&device_path.join("vendor")),
            sysfs::read_id_attribute(&device_path.join("device")),
        ) {
            (Ok(vendor), Ok(device)) => (vendor, device),
            _ => {
                debug!(address = %address, "could not read vendor/device id, skipping");
                continue;
            }
        };
        let selector = format!("{}:{}", vendor, device);

        let Some(driver) = sysfs::read_link_name(&device_path.join("driver")) else {
            continue;
        };
        if driver != VFIO_PCI_DRIVER {
            debug!(
                address = %address,
                driver = %driver,
                "device not bound to the passthrough driver, skipping"
            );
            continue;
        }

        let Some(iommu_group) = sysfs::read_link_name(&device_path.join("iommu_group")) else {
            warn!(address = %address, "device has no IOMMU group, skipping");
            continue;
        };
        let numa_node = sysfs::read_numa_node(&device_path);

        by_selector.entry(selector.clone()).or_default().push(PciDevice {
            pci_address: address,
            vendor_selector: selector,
            driver,
            iommu_group,
            numa_node,
        });
    }
    by_selector
}

/// Build the device plugin for one PCI resource.
pub fn new_pci_device_plugin(
    resource_name: &str,
    devices: &[PciDevice],
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

    let iommu_to_address: HashMap<String, String> =
        devices.iter().map(|d| (d.iommu_group.clone(), d.pci_address.clone())).collect();
    let names: HashMap<String, String> = devices
        .iter()
        .map(|d| (d.iommu_group.clone(), format!("{} [{}]", d.pci_address, d.vendor_selector)))
        .collect();
    let groups: Vec<String> = devices.iter().map(|d| d.iommu_group.clone()).collect();

    let env_var = sysfs::resource_name_to_env_var(PCI_RESOURCE_PREFIX, resource_name);
    let resource = resource_name.to_string();
    let device_root = paths.device_root.clone();

    let ops = DevicePluginOps {
        allocate: Box::new(move |request| {
            allocate_vfio_devices(request, &iommu_to_address, &env_var, &resource)
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

/// Resolve requested IOMMU groups back to PCI addresses and emit the VFIO
/// device specs. Unknown IDs are skipped, but a container request that
/// resolves to nothing fails the whole call.
fn allocate_vfio_devices(
    request: &api::AllocateRequest,
    iommu_to_address: &HashMap<String, String>,
    env_var: &str,
    resource: &str,
) -> Result<api::AllocateResponse> {
    let mut container_responses = Vec::new();
    for container in &request.container_requests {
        let mut devices = Vec::new();
        let mut addresses = Vec::new();
        for id in &container.devices_ids {
            match iommu_to_address.get(id) {
                Some(address) => {
                    addresses.push(address.clone());
                    devices.extend(super::vfio_device_specs(id));
                }
                None => {
                    warn!(id = %id, resource = %resource, "allocation requested an unknown device, skipping");
                }
            }
        }
        if addresses.is_empty() {
            return Err(DevletError::NoDevicesResolved { resource: resource.to_string() });
        }
        let envs = HashMap::from([(env_var.to_string(), addresses.join(","))]);
        container_responses.push(api::ContainerAllocateResponse {
            envs,
            mounts: vec![],
            devices,
            annotations: HashMap::new(),
        });
    }
    Ok(api::AllocateResponse { container_responses })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Lay down a fake sysfs PCI device with the attribute files and
    /// symlinks discovery reads.
    fn fake_pci_device(
        root: &Path,
        address: &str,
        vendor: &str,
        device: &str,
        driver: &str,
        iommu_group: &str,
        numa_node: i32,
    ) {
        let dev = root.join(address);
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::write(dev.join("vendor"), format!("0x{}\n", vendor)).unwrap();
        std::fs::write(dev.join("device"), format!("0x{}\n", device)).unwrap();
        std::fs::write(dev.join("numa_node"), format!("{}\n", numa_node)).unwrap();
        symlink(format!("../../drivers/{}", driver), dev.join("driver")).unwrap();
        symlink(format!("../../iommu_groups/{}", iommu_group), dev.join("iommu_group")).unwrap();
    }

    #[test]
    fn test_discover_matches_selector_driver_and_topology() {
        let root = TempDir::new().unwrap();
        fake_pci_device(root.path(), "0000:65:00.0", "dead", "beef", "vfio-pci", "42", 1);
        // Wrong driver: present but not allocatable.
        fake_pci_device(root.path(), "0000:66:00.0", "dead", "beef", "nvidia", "43", 0);
        // Unrelated entry names are ignored entirely.
        std::fs::create_dir_all(root.path().join("not-a-device")).unwrap();

        let by_selector = discover_pci_devices(root.path());
        let devices = by_selector.get("dead:beef").unwrap();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.pci_address, "0000:65:00.0");
        assert_eq!(device.driver, "vfio-pci");
        assert_eq!(device.iommu_group, "42");
        assert_eq!(device.numa_node, 1);
    }

    #[test]
    fn test_allocate_resolves_iommu_group_to_address() {
        let device = PciDevice {
            pci_address: "0000:65:00.0".to_string(),
            vendor_selector: "dead:beef".to_string(),
            driver: "vfio-pci".to_string(),
            iommu_group: "42".to_string(),
            numa_node: 0,
        };
        let iommu_to_address =
            HashMap::from([(device.iommu_group.clone(), device.pci_address.clone())]);

        let request = api::AllocateRequest {
            container_requests: vec![api::ContainerAllocateRequest {
                devices_ids: vec!["42".to_string(), "unknown".to_string()],
            }],
        };
        let response = allocate_vfio_devices(
            &request,
            &iommu_to_address,
            "PCI_RESOURCE_VENDOR_COM_GPU",
            "vendor.com/gpu",
        )
        .unwrap();

        assert_eq!(response.container_responses.len(), 1);
        let container = &response.container_responses[0];
        assert_eq!(
            container.envs.get("PCI_RESOURCE_VENDOR_COM_GPU"),
            Some(&"0000:65:00.0".to_string())
        );
        let paths: Vec<_> = container.devices.iter().map(|d| d.host_path.as_str()).collect();
        assert_eq!(paths, vec!["/dev/vfio/vfio", "/dev/vfio/42"]);
    }

    #[test]
    fn test_allocate_fails_when_nothing_resolves() {
        let iommu_to_address: HashMap<String, String> = HashMap::new();
        let request = api::AllocateRequest {
            container_requests: vec![api::ContainerAllocateRequest {
                devices_ids: vec!["99".to_string()],
            }],
        };
        let err =
            allocate_vfio_devices(&request, &iommu_to_address, "PCI_RESOURCE_X", "vendor.com/x")
                .unwrap_err();
        assert!(matches!(err, DevletError::NoDevicesResolved { .. }));
    }

    #[test]
    fn test_plugin_reports_numa_topology() {
        let plugin_paths =
            PluginPaths { plugin_dir: PathBuf::from("/tmp"), device_root: PathBuf::from("/") };
        let device = PciDevice {
            pci_address: "0000:65:00.0".to_string(),
            vendor_selector: "dead:beef".to_string(),
            driver: "vfio-pci".to_string(),
            iommu_group: "42".to_string(),
            numa_node: 1,
        };
        let plugin = new_pci_device_plugin("vendor.com/gpu", &[device], &plugin_paths);
        assert_eq!(plugin.resource_name(), "vendor.com/gpu");
        assert_eq!(plugin.device_count(), 1);
    }
}
