use super::manager::{DeviceManager, DiscoveryFilter};
use super::Result;

// Platform-specific topology walkers
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxDeviceManager;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::WindowsDeviceManager;

/// Create the topology walker for the current platform.
pub fn create_device_manager(filter: DiscoveryFilter) -> Result<Box<dyn DeviceManager>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(LinuxDeviceManager::new(filter)))
    }

    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(WindowsDeviceManager::new(filter)))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        let _ = filter;
        Err(super::DeviceError::UnsupportedPlatform(
            std::env::consts::OS.to_string(),
        ))
    }
}
