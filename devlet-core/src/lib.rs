//! devlet core library
//!
//! The node-resident device-plugin framework: per-class discovery (PCI
//! passthrough, mediated, USB, generic character devices, Unix sockets), the
//! shared plugin runtime with its health-monitoring loop, the reconciling
//! device controller and the mediated-device-type provisioning engine.

pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod host;
pub mod mdev;
pub mod observability;
pub mod paths;
pub mod plugin;
pub mod sysfs;

// Re-export commonly used items
pub use config::{watch_config, ConfigWatcher, DevletConfig, PermittedDevices};
pub use controller::DeviceController;
pub use error::{DevletError, Result};
pub use host::{DeviceHandler, LocalDeviceHandler};
pub use mdev::MdevTypesManager;
pub use observability::init as init_observability;
pub use plugin::{DevicePluginOps, PluginPaths, PluginRuntime, DEVICE_NAMESPACE};
