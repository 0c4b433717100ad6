use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::models::{DeviceInfo, DeviceSnapshot};
use super::Result;

/// VID/PID fragments the topology walker filters on. Stored as hex
/// strings because platform device identifiers embed them as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryFilter {
    pub serial_vid: String,
    pub serial_pid: String,
    pub hid_vid: String,
    pub hid_pid: String,
}

impl Default for DiscoveryFilter {
    /// CH340 usb-serial bridge plus the composite HID capture device.
    fn default() -> Self {
        Self {
            serial_vid: "1A86".to_string(),
            serial_pid: "7523".to_string(),
            hid_vid: "534D".to_string(),
            hid_pid: "2109".to_string(),
        }
    }
}

impl DiscoveryFilter {
    pub fn new(
        serial_vid: impl Into<String>,
        serial_pid: impl Into<String>,
        hid_vid: impl Into<String>,
        hid_pid: impl Into<String>,
    ) -> Self {
        Self {
            serial_vid: serial_vid.into(),
            serial_pid: serial_pid.into(),
            hid_vid: hid_vid.into(),
            hid_pid: hid_pid.into(),
        }
    }

    /// Case-insensitive substring match of both serial VID and PID.
    pub fn matches_serial(&self, haystack: &str) -> bool {
        let upper = haystack.to_uppercase();
        upper.contains(&self.serial_vid.to_uppercase())
            && upper.contains(&self.serial_pid.to_uppercase())
    }

    /// Case-insensitive substring match of both HID VID and PID.
    pub fn matches_hid(&self, haystack: &str) -> bool {
        let upper = haystack.to_uppercase();
        upper.contains(&self.hid_vid.to_uppercase())
            && upper.contains(&self.hid_pid.to_uppercase())
    }
}

/// Platform topology walker and correlator. `Sync` so a hotplug monitor
/// can keep polling a manager across stop/start cycles.
pub trait DeviceManager: Send + Sync {
    /// Enumerate matching composite devices and correlate their serial,
    /// HID, camera and audio interfaces by physical location.
    fn discover_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Resolve the canonical port chain of one platform device
    /// identifier, if the device is currently present.
    fn get_port_chain(&self, device_id: &str) -> Result<Option<String>>;
}

/// Convenience selection layer over any `DeviceManager`.
pub struct DeviceSelector {
    manager: Box<dyn DeviceManager>,
}

impl DeviceSelector {
    pub fn new(manager: Box<dyn DeviceManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &dyn DeviceManager {
        self.manager.as_ref()
    }

    /// Capture the current device population as an immutable snapshot.
    pub fn snapshot(&self) -> Result<DeviceSnapshot> {
        Ok(DeviceSnapshot::new(self.manager.discover_devices()?))
    }

    /// Port chains of every matching device, in discovery order.
    pub fn list_port_chains(&self) -> Result<Vec<String>> {
        Ok(self
            .manager
            .discover_devices()?
            .into_iter()
            .map(|d| d.port_chain)
            .collect())
    }

    /// All devices found under one port chain.
    pub fn devices_by_port_chain(&self, port_chain: &str) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .manager
            .discover_devices()?
            .into_iter()
            .filter(|d| d.port_chain == port_chain)
            .collect())
    }

    /// Devices grouped by port chain.
    pub fn group_by_port_chain(&self) -> Result<HashMap<String, Vec<DeviceInfo>>> {
        let mut groups: HashMap<String, Vec<DeviceInfo>> = HashMap::new();
        for device in self.manager.discover_devices()? {
            groups.entry(device.port_chain.clone()).or_default().push(device);
        }
        Ok(groups)
    }

    /// First device under the given port chain, if any.
    pub fn select_by_port_chain(&self, port_chain: &str) -> Result<Option<DeviceInfo>> {
        Ok(self
            .manager
            .discover_devices()?
            .into_iter()
            .find(|d| d.port_chain == port_chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedManager {
        devices: Vec<DeviceInfo>,
    }

    impl DeviceManager for FixedManager {
        fn discover_devices(&self) -> Result<Vec<DeviceInfo>> {
            Ok(self.devices.clone())
        }

        fn get_port_chain(&self, device_id: &str) -> Result<Option<String>> {
            Ok(self
                .devices
                .iter()
                .find(|d| d.usb_device_id.as_deref() == Some(device_id))
                .map(|d| d.port_chain.clone()))
        }
    }

    fn selector() -> DeviceSelector {
        let mut first = DeviceInfo::new("1-5.1");
        first.usb_device_id = Some("usb-root-a".to_string());
        first.serial_port_path = Some("/dev/ttyUSB0".to_string());
        let mut second = DeviceInfo::new("1-5.2");
        second.usb_device_id = Some("usb-root-b".to_string());
        let third = DeviceInfo::new("1-5.1");
        DeviceSelector::new(Box::new(FixedManager {
            devices: vec![first, second, third],
        }))
    }

    #[test]
    fn test_default_filter_targets_adapter_hardware() {
        let filter = DiscoveryFilter::default();
        assert!(filter.matches_serial("USB\\VID_1A86&PID_7523\\5&2C0CCC3D"));
        assert!(filter.matches_serial("usb vid_1a86 pid_7523"));
        assert!(!filter.matches_serial("USB\\VID_1A86&PID_55D4"));
        assert!(filter.matches_hid("USB\\VID_534D&PID_2109&MI_04"));
        assert!(!filter.matches_hid("USB\\VID_046D&PID_C52B"));
    }

    #[test]
    fn test_list_port_chains() {
        let chains = selector().list_port_chains().unwrap();
        assert_eq!(chains, vec!["1-5.1", "1-5.2", "1-5.1"]);
    }

    #[test]
    fn test_group_by_port_chain() {
        let groups = selector().group_by_port_chain().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["1-5.1"].len(), 2);
        assert_eq!(groups["1-5.2"].len(), 1);
    }

    #[test]
    fn test_select_by_port_chain() {
        let selector = selector();
        let found = selector.select_by_port_chain("1-5.2").unwrap();
        assert_eq!(found.unwrap().usb_device_id.as_deref(), Some("usb-root-b"));
        assert!(selector.select_by_port_chain("2-1").unwrap().is_none());
    }

    #[test]
    fn test_devices_by_port_chain_filters() {
        let devices = selector().devices_by_port_chain("1-5.1").unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.port_chain == "1-5.1"));
    }

    #[test]
    fn test_snapshot_captures_population() {
        let snapshot = selector().snapshot().unwrap();
        assert_eq!(snapshot.len(), 3);
    }
}
