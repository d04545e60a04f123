//! Small helpers for reading the sysfs attribute files and symlinks the
//! discoverers depend on.

use crate::error::{DevletError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

/// Regular expression to validate PCI address format: 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// Validate PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// Read a value from a sysfs attribute file, trimming the trailing newline.
pub fn read_value(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| DevletError::io(path, e))
}

/// Read an ID attribute such as `vendor` or `device`, normalizing the `0x`
/// prefix away and lowercasing.
pub fn read_id_attribute(path: &Path) -> Result<String> {
    Ok(read_value(path)?.trim_start_matches("0x").to_lowercase())
}

/// Read the basename of a sysfs symlink, e.g. the bound driver or the IOMMU
/// group of a device. Returns `None` when the link does not exist.
pub fn read_link_name(path: &Path) -> Option<String> {
    fs::read_link(path)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
}

/// Read the NUMA node for a device. Sysfs reports -1 when the platform has no
/// NUMA affinity for the device.
pub fn read_numa_node(device_path: &Path) -> i32 {
    fs::read_to_string(device_path.join("numa_node"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(-1)
}

/// Join an absolute host path onto a host root mount point.
pub fn host_path(root: &Path, absolute: &Path) -> PathBuf {
    match absolute.strip_prefix("/") {
        Ok(rel) => root.join(rel),
        Err(_) => root.join(absolute),
    }
}

/// Convert a namespaced resource name into an environment variable name,
/// e.g. `("PCI_RESOURCE", "vendor.com/gpu")` → `PCI_RESOURCE_VENDOR_COM_GPU`.
pub fn resource_name_to_env_var(prefix: &str, resource_name: &str) -> String {
    let mut name = resource_name.to_uppercase();
    for c in ['/', '.', '-'] {
        name = name.replace(c, "_");
    }
    format!("{}_{}", prefix, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pci_address_validation() {
        assert!(is_valid_pci_address("0000:01:00.0"));
        assert!(is_valid_pci_address("0000:ff:1f.7"));
        assert!(is_valid_pci_address("ABCD:12:34.5"));

        assert!(!is_valid_pci_address("01:00.0")); // Missing domain
        assert!(!is_valid_pci_address("0000:01:00")); // Missing function
        assert!(!is_valid_pci_address("0000:01:00.8")); // Invalid function (max 7)
        assert!(!is_valid_pci_address("invalid"));
    }

    #[test]
    fn test_resource_name_to_env_var() {
        assert_eq!(
            resource_name_to_env_var("PCI_RESOURCE", "devices.devlet.io/gpu"),
            "PCI_RESOURCE_DEVICES_DEVLET_IO_GPU"
        );
        assert_eq!(
            resource_name_to_env_var("USB_RESOURCE", "vendor.com/usb-camera"),
            "USB_RESOURCE_VENDOR_COM_USB_CAMERA"
        );
    }

    #[test]
    fn test_host_path() {
        assert_eq!(
            host_path(Path::new("/proc/1/root"), Path::new("/dev/vfio/12")),
            PathBuf::from("/proc/1/root/dev/vfio/12")
        );
        assert_eq!(host_path(Path::new("/"), Path::new("/dev/kvm")), PathBuf::from("/dev/kvm"));
    }
}
