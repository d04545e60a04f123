//! Generic shared character devices (e.g. /dev/kvm) exposed at a fixed
//! count.
//!
//! There is no discovery beyond the device node itself: the plugin
//! advertises `max_devices` synthetic IDs all backed by the same node, and
//! every allocation resolves to that node with the configured cgroup
//! permissions.

use crate::plugin::{DevicePluginOps, PluginPaths, PluginRuntime, SetupFn};
use devlet_api::deviceplugin::v1beta1 as api;
use devlet_api::HEALTHY;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

/// Build the device plugin for one shared character device.
pub fn new_generic_device_plugin(
    resource_name: &str,
    device_path: &Path,
    max_devices: usize,
    permissions: &str,
    preopen: bool,
    paths: &PluginPaths,
) -> PluginRuntime {
    let device_name = device_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "device".to_string());

    let devs: Vec<api::Device> = (1..=max_devices)
        .map(|i| api::Device {
            id: format!("{}{}", device_name, i),
            health: HEALTHY.to_string(),
            topology: None,
        })
        .collect();
    let known_ids: HashSet<String> = devs.iter().map(|d| d.id.clone()).collect();

    let host_device = paths.host_path(device_path);
    let monitored_path = host_device.clone();

    let setup: Option<SetupFn> = preopen.then(|| -> SetupFn {
        let path = host_device.clone();
        Box::new(move || {
            // Opening the node once pulls in the kernel module when it is
            // not loaded yet; absence is not fatal, health tracking takes
            // over from here.
            if let Err(e) = std::fs::File::open(&path) {
                warn!(path = ?path, error = %e, "could not pre-open device");
            }
            Ok(())
        })
    });

    let spec_path = device_path.to_string_lossy().to_string();
    let perms = permissions.to_string();

    let ops = DevicePluginOps {
        allocate: Box::new(move |request| {
            let mut container_responses = Vec::new();
            for container in &request.container_requests {
                let mut devices = Vec::new();
                for id in &container.devices_ids {
                    if !known_ids.contains(id) {
                        debug!(id = %id, "unknown device id requested, skipping");
                        continue;
                    }
                    devices.push(api::DeviceSpec {
                        container_path: spec_path.clone(),
                        host_path: spec_path.clone(),
                        permissions: perms.clone(),
                    });
                }
                container_responses.push(api::ContainerAllocateResponse {
                    envs: HashMap::new(),
                    mounts: vec![],
                    devices,
                    annotations: HashMap::new(),
                });
            }
            Ok(api::AllocateResponse { container_responses })
        }),
        setup_monitored_devices: Box::new(move |monitored| {
            // One node stands for every synthetic device of the resource.
            monitored.monitor_all(monitored_path.clone());
            // Watch the grandparent too, so the device directory itself
            // coming and going is observed.
            if let Some(grandparent) = monitored_path.parent().and_then(Path::parent) {
                if !grandparent.as_os_str().is_empty() {
                    monitored.watch_dir(grandparent);
                }
            }
            Ok(())
        }),
        setup,
        device_name_by_id: None,
        configure_permissions: None,
        mutate_health: None,
    };

    PluginRuntime::new(resource_name, devs, ops, paths)
}
