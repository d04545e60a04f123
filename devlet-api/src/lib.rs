//! Device-plugin gRPC API
//!
//! This crate defines the device-plugin protocol spoken between devlet and
//! the orchestrator's node agent: the node agent's `Registration` service and
//! the per-plugin `DevicePlugin` service (`ListAndWatch` / `Allocate`). The
//! protobuf definitions are in `proto/deviceplugin.proto` and code-generated
//! via `tonic-build`.

// Include the generated code
pub mod deviceplugin {
    pub mod v1beta1 {
        tonic::include_proto!("deviceplugin.v1beta1");
    }
}

/// Protocol version sent in the registration handshake.
pub const API_VERSION: &str = "v1beta1";

/// Value of `Device::health` for a usable device.
pub const HEALTHY: &str = "Healthy";

/// Value of `Device::health` for a device whose backing node is gone.
pub const UNHEALTHY: &str = "Unhealthy";
