use crate::devices::software::bus::BusError;
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};

/// Errors reported by a device backend. These stay close to what the
/// underlying driver tells us and are folded into a [`DriverError`] by
/// the camera controller.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// The driver could not list devices on the network.
    #[error("Device enumeration failed: {0}")]
    Enumeration(String),
    /// The physical connection to the device could not be opened.
    #[error("Failed to open device {id}: {reason}")]
    Open { id: String, reason: String },
    /// Writing a feature or command to the device failed.
    #[error("Device feature {feature} rejected: {reason}")]
    Feature { feature: String, reason: String },
    /// The grab buffer could not be turned into an image.
    #[error("Failed to convert grab buffer: {0}")]
    Conversion(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top level error type for the capture driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// An address was configured but no enumerated device carries it.
    #[error("No device found with address {address}")]
    DeviceNotFound { address: Ipv4Addr },

    /// Nothing was enumerated at all when asked for the first device.
    #[error("No devices available")]
    NoDevices,

    /// The device exists but opening the connection failed.
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(#[source] CameraError),

    /// The device refused a configuration or grab state change.
    #[error("Device error: {0}")]
    Device(#[source] CameraError),

    /// Session folder, settings snapshot or frame could not be written.
    #[error("Storage error at {path}: {message}")]
    Storage { path: PathBuf, message: String },

    #[error("No frame retrieved within {timeout_ms} ms")]
    RetrievalTimeout { timeout_ms: u64 },

    #[error("Frame retrieval failed: {0}")]
    RetrievalFailed(String),

    #[error("Failed to publish on channel {channel}: {message}")]
    Publish { channel: String, message: String },

    /// The bus consumer could not be reached at startup.
    #[error("Failed to connect to bus consumer at {address}: {source}")]
    BusConnect {
        address: SocketAddr,
        #[source]
        source: BusError,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Acquisition already started")]
    AlreadyStarted,

    /// Stop was requested before the acquisition was started.
    #[error("Acquisition was stopped before it started")]
    Stopped,

    #[error("Failed to spawn acquisition thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Result type alias using `DriverError`.
pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    pub fn storage(path: impl Into<PathBuf>, err: impl ToString) -> Self {
        Self::Storage {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn publish(channel: impl Into<String>, err: impl ToString) -> Self {
        Self::Publish {
            channel: channel.into(),
            message: err.to_string(),
        }
    }
}
