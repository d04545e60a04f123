//! Error types for devlet.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for devlet operations.
pub type Result<T> = std::result::Result<T, DevletError>;

/// Main error type for devlet.
#[derive(Error, Debug)]
pub enum DevletError {
    // Plugin lifecycle errors
    #[error("failed to bind plugin socket {path:?}: {source}")]
    SocketBind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin server for {resource} did not become connectable within {timeout:?}")]
    ServerNotReady { resource: String, timeout: Duration },

    #[error("failed to register {resource} with the node agent: {reason}")]
    RegistrationFailed { resource: String, reason: String },

    #[error("device list for {resource} is already being watched")]
    AlreadyWatched { resource: String },

    // Health monitoring errors
    #[error("health monitor setup failed: {reason}")]
    HealthMonitorSetup { reason: String },

    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    // Allocation errors
    #[error("no allocatable devices resolved for {resource}")]
    NoDevicesResolved { resource: String },

    #[error("device {id} disappeared before allocation completed")]
    DeviceVanished { id: String },

    #[error("failed to configure permissions on {path:?}: {reason}")]
    Permissions { path: PathBuf, reason: String },

    // Discovery / selector errors
    #[error("invalid device selector: {selector}")]
    InvalidSelector { selector: String },

    // Configuration errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Transport errors
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DevletError {
    /// Create an `Io` error carrying the offending path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
