//! Configuration management.
//!
//! The desired-device configuration arrives from an external cluster
//! configuration store; on this node it is materialized as a JSON file that
//! devlet loads at startup and hot-reloads whenever the file changes.

use crate::error::{DevletError, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{info, warn};

/// A `vendor:device` selector mapping matching PCI passthrough devices to a
/// resource name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PciHostDevice {
    /// Hex `vendor:device` pair, e.g. "10de:1eb8".
    pub pci_vendor_selector: String,
    pub resource_name: String,
    /// When set, discovery and allocation are handled by an external device
    /// plugin and devlet only accounts for the devices.
    pub external_resource_provider: bool,
}

impl Default for PciHostDevice {
    fn default() -> Self {
        Self {
            pci_vendor_selector: String::new(),
            resource_name: String::new(),
            external_resource_provider: false,
        }
    }
}

/// A mediated-device type-name selector mapping matching mdevs to a resource
/// name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediatedHostDevice {
    /// Type display name or type id, e.g. "GRID T4-1B" or "nvidia-222".
    pub mdev_name_selector: String,
    pub resource_name: String,
    pub external_resource_provider: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UsbSelector {
    /// Hex vendor id, e.g. "046d".
    pub vendor: String,
    /// Hex product id, e.g. "c077".
    pub product: String,
}

/// A USB resource. One logical device may require a group of several
/// distinct vendor:product selectors, all of which must be present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UsbHostDevice {
    pub resource_name: String,
    pub selectors: Vec<UsbSelector>,
    pub external_resource_provider: bool,
}

/// The set of host devices the cluster administrator permits on this node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PermittedDevices {
    pub pci_host_devices: Vec<PciHostDevice>,
    pub mediated_devices: Vec<MediatedHostDevice>,
    pub usb_host_devices: Vec<UsbHostDevice>,
}

/// Mediated-device types desired for a set of nodes selected by labels.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeMediatedDeviceTypes {
    /// Every label must match for the entry to apply.
    pub node_selector: HashMap<String, String>,
    pub mediated_device_types: Vec<String>,
}

/// Which mediated-device types should be instantiated on the node's cards.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediatedDevicesConfiguration {
    /// Node-independent default list.
    pub mediated_device_types: Vec<String>,
    /// Node-label-scoped overrides; any match replaces the default list.
    pub node_mediated_device_types: Vec<NodeMediatedDeviceTypes>,
}

impl MediatedDevicesConfiguration {
    /// Resolve the desired type list for a node.
    ///
    /// Every node entry whose selector fully matches the node's labels
    /// contributes its types; when at least one entry matches, the merged
    /// node-specific list takes precedence over the default list.
    pub fn desired_types(&self, node_labels: &HashMap<String, String>) -> Vec<String> {
        let mut matched: BTreeSet<String> = BTreeSet::new();
        let mut any_selector_matched = false;
        for node_types in &self.node_mediated_device_types {
            let matches = !node_types.node_selector.is_empty()
                && node_types
                    .node_selector
                    .iter()
                    .all(|(key, value)| node_labels.get(key) == Some(value));
            if matches {
                any_selector_matched = true;
                matched.extend(node_types.mediated_device_types.iter().cloned());
            }
        }
        if any_selector_matched {
            matched.into_iter().collect()
        } else {
            self.mediated_device_types.clone()
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DevletConfig {
    pub permitted_devices: PermittedDevices,
    pub mediated_devices_configuration: MediatedDevicesConfiguration,
    /// Labels of this node, synced in by the node-agent integration and used
    /// to resolve node-scoped mediated-device type lists.
    pub node_labels: HashMap<String, String>,
}

impl DevletConfig {
    /// Load configuration from disk. A missing file is an empty
    /// configuration, not an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| DevletError::InvalidConfig {
            reason: format!("failed to read config {:?}: {}", path, e),
        })?;
        serde_json::from_str(&content).map_err(|e| DevletError::InvalidConfig {
            reason: format!("failed to parse config {:?}: {}", path, e),
        })
    }
}

/// Keeps the config-file watcher alive for as long as hot reload is wanted.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

/// Load the configuration and watch its file for changes.
///
/// Returns a `watch::Receiver` holding the current configuration; every
/// change to the file is re-parsed and published to the receiver (parse
/// failures keep the previous configuration).
pub fn watch_config(path: PathBuf) -> Result<(watch::Receiver<DevletConfig>, ConfigWatcher)> {
    let initial = DevletConfig::load(&path)?;
    let (tx, rx) = watch::channel(initial);

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| DevletError::InvalidConfig {
            reason: format!("config path {:?} has no parent directory", path),
        })?;

    let reload_path = path.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "config watch error");
                return;
            }
        };
        if !event.paths.iter().any(|p| p == &reload_path) {
            return;
        }
        match DevletConfig::load(&reload_path) {
            Ok(config) => {
                let modified = tx.send_if_modified(|current| {
                    if *current != config {
                        *current = config;
                        true
                    } else {
                        false
                    }
                });
                if modified {
                    info!(path = ?reload_path, "configuration reloaded");
                }
            }
            Err(e) => warn!(error = %e, "ignoring unparsable configuration update"),
        }
    })?;

    // Watch the directory, not the file: editors and config syncers replace
    // the file, which would silently drop a watch on the file itself.
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    Ok((rx, ConfigWatcher { _watcher: watcher }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn node_scoped_config() -> MediatedDevicesConfiguration {
        MediatedDevicesConfiguration {
            mediated_device_types: vec![
                "nvidia-222".to_string(),
                "nvidia-228".to_string(),
                "i915-GVTg_V5_4".to_string(),
            ],
            node_mediated_device_types: vec![
                NodeMediatedDeviceTypes {
                    node_selector: labels(&[("gpu", "t4")]),
                    mediated_device_types: vec!["nvidia-223".to_string()],
                },
                NodeMediatedDeviceTypes {
                    node_selector: labels(&[("gpu", "t4"), ("profile", "large")]),
                    mediated_device_types: vec!["nvidia-229".to_string()],
                },
            ],
        }
    }

    #[test]
    fn test_default_types_when_no_selector_matches() {
        let config = node_scoped_config();
        let desired = config.desired_types(&labels(&[("unrelated", "true")]));
        assert_eq!(desired, vec!["nvidia-222", "nvidia-228", "i915-GVTg_V5_4"]);
    }

    #[test]
    fn test_matching_selector_replaces_default() {
        let config = node_scoped_config();
        let desired = config.desired_types(&labels(&[("gpu", "t4")]));
        assert_eq!(desired, vec!["nvidia-223"]);
    }

    #[test]
    fn test_all_labels_of_a_selector_must_match() {
        let config = node_scoped_config();
        // "profile" alone matches nothing; both entries require "gpu".
        let desired = config.desired_types(&labels(&[("profile", "large")]));
        assert_eq!(desired, vec!["nvidia-222", "nvidia-228", "i915-GVTg_V5_4"]);
    }

    #[test]
    fn test_multiple_matching_selectors_merge() {
        let config = node_scoped_config();
        let desired = config.desired_types(&labels(&[("gpu", "t4"), ("profile", "large")]));
        assert_eq!(desired, vec!["nvidia-223", "nvidia-229"]);
    }

    #[test]
    fn test_load_missing_file_is_empty_config() {
        let config = DevletConfig::load(Path::new("/nonexistent/devlet/config.json")).unwrap();
        assert_eq!(config, DevletConfig::default());
    }

    #[test]
    fn test_roundtrip() {
        let config = DevletConfig {
            permitted_devices: PermittedDevices {
                pci_host_devices: vec![PciHostDevice {
                    pci_vendor_selector: "10de:1eb8".to_string(),
                    resource_name: "vendor.com/gpu".to_string(),
                    external_resource_provider: false,
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: DevletConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
