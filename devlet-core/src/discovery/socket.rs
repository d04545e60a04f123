//! Unix-domain sockets exposed as allocatable devices.
//!
//! A socket resource grants a workload access to a daemon's socket via a
//! bind mount of the socket's directory. The socket (and the directory) is
//! chowned to the unprivileged workload user and relabeled before an
//! allocation succeeds, so the workload can actually connect.

use crate::error::{DevletError, Result};
use crate::host::DeviceHandler;
use crate::plugin::{DevicePluginOps, PluginPaths, PluginRuntime};
use devlet_api::deviceplugin::v1beta1 as api;
use devlet_api::HEALTHY;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Build the device plugin for one shared Unix socket.
pub fn new_socket_device_plugin(
    resource_name: &str,
    socket_dir: &Path,
    socket_name: &str,
    max_devices: usize,
    label: Option<String>,
    handler: Arc<dyn DeviceHandler>,
    paths: &PluginPaths,
) -> PluginRuntime {
    let socket_path = socket_dir.join(socket_name);
    let host_socket = paths.host_path(&socket_path);
    let host_dir = paths.host_path(socket_dir);

    let stem = Path::new(socket_name)
        .file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| socket_name.to_string());
    let devs: Vec<api::Device> = (1..=max_devices)
        .map(|i| api::Device {
            id: format!("{}{}", stem, i),
            health: HEALTHY.to_string(),
            topology: None,
        })
        .collect();
    let known_ids: HashSet<String> = devs.iter().map(|d| d.id.clone()).collect();

    let mount_dir = socket_dir.to_string_lossy().to_string();
    let monitored_path = host_socket.clone();
    let allocate_socket = host_socket.clone();
    let allocate_dir = host_dir.clone();

    let ops = DevicePluginOps {
        allocate: Box::new(move |request| {
            let mut container_responses = Vec::new();
            for container in &request.container_requests {
                let mut granted = false;
                for id in &container.devices_ids {
                    if !known_ids.contains(id) {
                        debug!(id = %id, "unknown device id requested, skipping");
                        continue;
                    }
                    if !allocate_socket.exists() {
                        return Err(DevletError::DeviceVanished { id: id.clone() });
                    }
                    // The workload runs unprivileged; it can only connect
                    // once the socket and its directory belong to it.
                    handler.chown_unprivileged(&allocate_dir)?;
                    handler.chown_unprivileged(&allocate_socket)?;
                    if let Some(label) = &label {
                        handler.relabel(label, &allocate_dir)?;
                        handler.relabel(label, &allocate_socket)?;
                    }
                    granted = true;
                }
                let mounts = if granted {
                    vec![api::Mount {
                        container_path: mount_dir.clone(),
                        host_path: mount_dir.clone(),
                        read_only: false,
                    }]
                } else {
                    vec![]
                };
                container_responses.push(api::ContainerAllocateResponse {
                    envs: HashMap::new(),
                    mounts,
                    devices: vec![],
                    annotations: HashMap::new(),
                });
            }
            Ok(api::AllocateResponse { container_responses })
        }),
        setup_monitored_devices: Box::new(move |monitored| {
            monitored.monitor_all(monitored_path.clone());
            if let Some(grandparent) = monitored_path.parent().and_then(Path::parent) {
                if !grandparent.as_os_str().is_empty() {
                    monitored.watch_dir(grandparent);
                }
            }
            Ok(())
        }),
        setup: None,
        device_name_by_id: None,
        configure_permissions: None,
        mutate_health: None,
    };

    PluginRuntime::new(resource_name, devs, ops, paths)
}
