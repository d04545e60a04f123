//! USB device discovery and allocation.
//!
//! USB resources are allocated as groups: a configured resource may require
//! several distinct vendor:product selectors per logical device (e.g. a
//! dongle plus its companion controller). Discovery greedily forms as many
//! complete groups as the plugged-in devices allow, and a device matched
//! into one group never appears in another.

use crate::config::{UsbHostDevice, UsbSelector};
use crate::error::{DevletError, Result};
use crate::host::DeviceHandler;
use crate::plugin::{resource_id, DevicePluginOps, PluginPaths, PluginRuntime};
use crate::sysfs;
use devlet_api::deviceplugin::v1beta1 as api;
use devlet_api::HEALTHY;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Environment variable prefix carrying allocated bus:device pairs.
pub const USB_RESOURCE_PREFIX: &str = "USB_RESOURCE";

/// Sysfs metadata of one plugged-in USB device.
#[derive(Debug, Clone, PartialEq)]
pub struct UsbDevice {
    pub vendor: u32,
    pub product: u32,
    pub bcd: u32,
    pub bus: u32,
    pub device_number: u32,
    /// Character device node, e.g. /dev/bus/usb/003/002.
    pub device_path: PathBuf,
}

impl UsbDevice {
    /// Uniqueness comes from bus and device number; the vendor:product pair
    /// makes the id readable.
    pub fn usb_id(&self) -> String {
        format!(
            "{:04x}:{:04x}-{:02}:{:02}",
            self.vendor, self.product, self.bus, self.device_number
        )
    }
}

/// A complete group of devices allocated and released as one unit.
#[derive(Debug, Clone)]
pub struct UsbDeviceGroup {
    pub id: String,
    pub devices: Vec<UsbDevice>,
}

/// All USB devices plugged into the node, indexed by vendor for selector
/// matching. `fetch` consumes matched devices so no physical device is
/// handed to two resources.
#[derive(Debug, Default)]
pub struct LocalDevices {
    by_vendor: HashMap<u32, Vec<UsbDevice>>,
}

impl LocalDevices {
    fn insert(&mut self, device: UsbDevice) {
        self.by_vendor.entry(device.vendor).or_default().push(device);
    }

    /// Take one device per selector, all or nothing: a selector that cannot
    /// be satisfied ends group formation without consuming anything.
    fn fetch(&mut self, selectors: &[(u32, u32)]) -> Option<Vec<UsbDevice>> {
        let mut picked: Vec<UsbDevice> = Vec::new();
        for (vendor, product) in selectors {
            let candidates = self.by_vendor.get(vendor)?;
            let device = candidates
                .iter()
                .find(|dev| {
                    dev.product == *product && !picked.iter().any(|p| p.usb_id() == dev.usb_id())
                })?
                .clone();
            picked.push(device);
        }
        self.remove(&picked);
        Some(picked)
    }

    fn remove(&mut self, devices: &[UsbDevice]) {
        for device in devices {
            if let Some(list) = self.by_vendor.get_mut(&device.vendor) {
                list.retain(|d| d.usb_id() != device.usb_id());
                if list.is_empty() {
                    self.by_vendor.remove(&device.vendor);
                }
            }
        }
    }
}

/// Parse the fields of interest out of a device's uevent file.
fn parse_uevent(device_dir: &Path) -> Option<UsbDevice> {
    let content = std::fs::read_to_string(device_dir.join("uevent")).ok()?;

    let mut bus = None;
    let mut device_number = None;
    let mut ids = None;
    let mut device_path = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "BUSNUM" => bus = value.parse::<u32>().ok(),
            "DEVNUM" => device_number = value.parse::<u32>().ok(),
            "PRODUCT" => {
                // vendor/product/bcd, all hex
                let parts: Vec<&str> = value.split('/').collect();
                if parts.len() != 3 {
                    return None;
                }
                let vendor = u32::from_str_radix(parts[0], 16).ok()?;
                let product = u32::from_str_radix(parts[1], 16).ok()?;
                let bcd = u32::from_str_radix(parts[2], 16).ok()?;
                ids = Some((vendor, product, bcd));
            }
            "DEVNAME" => device_path = Some(PathBuf::from("/dev").join(value)),
            _ => {}
        }
    }

    let (vendor, product, bcd) = ids?;
    Some(UsbDevice {
        vendor,
        product,
        bcd,
        bus: bus?,
        device_number: device_number?,
        device_path: device_path?,
    })
}

/// Walk the USB device tree, skipping controllers (`usb*`) and interface
/// entries that carry no `idVendor`.
pub fn discover_plugged_usb_devices(usb_root: &Path) -> LocalDevices {
    let mut local = LocalDevices::default();
    let entries = match std::fs::read_dir(usb_root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = ?usb_root, error = %e, "failed to walk the USB device tree");
            return local;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("usb") {
            continue;
        }
        if !entry.path().join("idVendor").exists() {
            continue;
        }
        if let Some(device) = parse_uevent(&entry.path()) {
            local.insert(device);
        }
    }
    local
}

fn parse_selector(selector: &UsbSelector) -> Result<(u32, u32)> {
    let vendor = u32::from_str_radix(selector.vendor.trim(), 16);
    let product = u32::from_str_radix(selector.product.trim(), 16);
    match (vendor, product) {
        (Ok(vendor), Ok(product)) => Ok((vendor, product)),
        _ => Err(DevletError::InvalidSelector {
            selector: format!("{}:{}", selector.vendor, selector.product),
        }),
    }
}

fn group_id(resource_name: &str, index: usize) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", resource_id(resource_name), &suffix[..4], index)
}

/// Form complete selector groups for every permitted USB resource. A
/// resource with one unmatchable selector yields zero groups.
pub fn discover_allowed_usb_devices(
    configs: &[UsbHostDevice],
    usb_root: &Path,
) -> HashMap<String, Vec<UsbDeviceGroup>> {
    let mut local = discover_plugged_usb_devices(usb_root);
    let mut groups_by_resource: HashMap<String, Vec<UsbDeviceGroup>> = HashMap::new();

    for config in configs {
        if config.external_resource_provider {
            debug!(
                resource = %config.resource_name,
                "skipping discovery, resource is handled by an external device plugin"
            );
            continue;
        }
        let selectors: Vec<(u32, u32)> =
            match config.selectors.iter().map(parse_selector).collect() {
                Ok(selectors) => selectors,
                Err(e) => {
                    warn!(resource = %config.resource_name, error = %e, "ignoring resource");
                    continue;
                }
            };
        if selectors.is_empty() {
            continue;
        }
        let mut index = 0;
        while let Some(devices) = local.fetch(&selectors) {
            groups_by_resource
                .entry(config.resource_name.clone())
                .or_default()
                .push(UsbDeviceGroup { id: group_id(&config.resource_name, index), devices });
            index += 1;
        }
    }
    groups_by_resource
}

/// Build the device plugin for one USB resource.
pub fn new_usb_device_plugin(
    resource_name: &str,
    groups: Vec<UsbDeviceGroup>,
    handler: Arc<dyn DeviceHandler>,
    paths: &PluginPaths,
) -> PluginRuntime {
    let devs: Vec<api::Device> = groups
        .iter()
        .map(|group| api::Device {
            id: group.id.clone(),
            health: HEALTHY.to_string(),
            topology: None,
        })
        .collect();

    let device_root = paths.device_root.clone();
    let members_by_group: HashMap<String, Vec<PathBuf>> = groups
        .iter()
        .map(|group| {
            (
                group.id.clone(),
                group
                    .devices
                    .iter()
                    .map(|dev| sysfs::host_path(&device_root, &dev.device_path))
                    .collect(),
            )
        })
        .collect();
    let names: HashMap<String, String> = groups
        .iter()
        .map(|group| {
            let members: Vec<String> = group.devices.iter().map(|d| d.usb_id()).collect();
            (group.id.clone(), format!("{} [{}]", resource_name, members.join(",")))
        })
        .collect();
    let groups_by_id: HashMap<String, Vec<UsbDevice>> =
        groups.into_iter().map(|group| (group.id, group.devices)).collect();

    let env_var = sysfs::resource_name_to_env_var(USB_RESOURCE_PREFIX, resource_name);
    let monitor_members = members_by_group.clone();
    let health_members = members_by_group;
    let allocate_root = device_root.clone();

    let ops = DevicePluginOps {
        allocate: Box::new(move |request| {
            allocate_usb_groups(request, &groups_by_id, &env_var, &handler, &allocate_root)
        }),
        setup_monitored_devices: Box::new(move |monitored| {
            for (group_id, members) in &monitor_members {
                for path in members {
                    // Parent dir is added by monitor(); the bus directory one
                    // level up is watched so a bus appearing late is seen.
                    if let Some(bus_dir) = path.parent().and_then(Path::parent) {
                        monitored.watch_dir(bus_dir);
                    }
                    monitored.monitor(path.clone(), group_id.clone());
                }
            }
            Ok(())
        }),
        setup: None,
        device_name_by_id: Some(Box::new(move |id| {
            names.get(id).cloned().unwrap_or_else(|| format!("device plugin ({})", id))
        })),
        configure_permissions: None,
        // A group is only usable when every member device is present.
        mutate_health: Some(Box::new(move |group_id, _path, healthy| {
            if !healthy {
                return Ok(false);
            }
            match health_members.get(group_id) {
                Some(members) => Ok(members.iter().all(|path| path.exists())),
                None => Ok(healthy),
            }
        })),
    };

    PluginRuntime::new(resource_name, devs, ops, paths)
}

fn allocate_usb_groups(
    request: &api::AllocateRequest,
    groups_by_id: &HashMap<String, Vec<UsbDevice>>,
    env_var: &str,
    handler: &Arc<dyn DeviceHandler>,
    device_root: &Path,
) -> Result<api::AllocateResponse> {
    let mut container_responses = Vec::new();
    for container in &request.container_requests {
        let mut devices = Vec::new();
        let mut env_values = Vec::new();
        for id in &container.devices_ids {
            let Some(members) = groups_by_id.get(id) else {
                debug!(id = %id, "usb device group disappeared, skipping");
                continue;
            };
            for member in members {
                let host = sysfs::host_path(device_root, &member.device_path);
                handler.chown_unprivileged(&host)?;
                env_values.push(format!("{}:{}", member.bus, member.device_number));
                let node = member.device_path.to_string_lossy().to_string();
                devices.push(api::DeviceSpec {
                    container_path: node.clone(),
                    host_path: node,
                    permissions: "mrw".to_string(),
                });
            }
        }
        let envs = if env_values.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([(env_var.to_string(), env_values.join(","))])
        };
        container_responses.push(api::ContainerAllocateResponse {
            envs,
            mounts: vec![],
            devices,
            annotations: HashMap::new(),
        });
    }
    Ok(api::AllocateResponse { container_responses })
}
