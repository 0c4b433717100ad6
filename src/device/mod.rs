pub mod hotplug;
pub mod manager;
pub mod models;
pub mod platform;

pub use hotplug::{DeviceChangeEvent, HotplugMonitor};
pub use manager::{DeviceManager, DeviceSelector, DiscoveryFilter};
pub use models::{DeviceInfo, DeviceKey, DeviceSnapshot, SnapshotDiff};
pub use platform::create_device_manager;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Platform not supported: {0}")]
    UnsupportedPlatform(String),

    #[error("Device enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("HID error: {0}")]
    HidError(#[from] hidapi::HidError),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
