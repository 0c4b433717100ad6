use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One physical adapter: the usb root node plus every correlated
/// interface path found under the same port chain.
///
/// Device and path fields are platform-specific opaque strings (device
/// instance ids on Windows, sysfs/dev paths on Linux); callers treat
/// them as handles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Canonical physical-location token, stable across replug into the
    /// same socket.
    pub port_chain: String,
    /// Platform identifier of the composite usb root node.
    pub usb_device_id: Option<String>,

    pub serial_port_id: Option<String>,
    /// OS handle to open the serial port ("COM5", "/dev/ttyUSB0").
    pub serial_port_path: Option<String>,

    pub hid_device_id: Option<String>,
    pub hid_device_path: Option<String>,

    pub camera_device_id: Option<String>,
    pub camera_device_path: Option<String>,

    pub audio_device_id: Option<String>,
    pub audio_device_path: Option<String>,
}

/// Identity of a device across snapshots: same socket, same serial
/// interface, same HID interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub port_chain: String,
    pub serial_port_id: Option<String>,
    pub hid_device_id: Option<String>,
}

impl DeviceInfo {
    pub fn new(port_chain: impl Into<String>) -> Self {
        Self {
            port_chain: port_chain.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            port_chain: self.port_chain.clone(),
            serial_port_id: self.serial_port_id.clone(),
            hid_device_id: self.hid_device_id.clone(),
        }
    }

    pub fn has_serial(&self) -> bool {
        self.serial_port_path.is_some()
    }

    pub fn has_hid(&self) -> bool {
        self.hid_device_path.is_some()
    }

    pub fn has_camera(&self) -> bool {
        self.camera_device_path.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_device_path.is_some()
    }

    /// Short human-readable interface inventory for logs.
    pub fn interface_summary(&self) -> String {
        let mut parts = Vec::new();
        if self.has_serial() {
            parts.push("serial");
        }
        if self.has_hid() {
            parts.push("hid");
        }
        if self.has_camera() {
            parts.push("camera");
        }
        if self.has_audio() {
            parts.push("audio");
        }
        if parts.is_empty() {
            format!("{}: no interfaces", self.port_chain)
        } else {
            format!("{}: {}", self.port_chain, parts.join("+"))
        }
    }
}

/// Immutable capture of every matching device at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub devices: Vec<DeviceInfo>,
}

impl DeviceSnapshot {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            timestamp: Utc::now(),
            devices,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains_key(&self, key: &DeviceKey) -> bool {
        self.devices.iter().any(|d| &d.key() == key)
    }

    fn get(&self, key: &DeviceKey) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| &d.key() == key)
    }

    /// Render the snapshot for external consumers (status sockets, logs).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Changes from `self` (older) to `newer`.
    pub fn diff(&self, newer: &DeviceSnapshot) -> SnapshotDiff {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut modified = Vec::new();

        for device in &newer.devices {
            match self.get(&device.key()) {
                None => added.push(device.clone()),
                Some(previous) if previous != device => modified.push(device.clone()),
                Some(_) => {}
            }
        }
        for device in &self.devices {
            if !newer.contains_key(&device.key()) {
                removed.push(device.clone());
            }
        }

        SnapshotDiff {
            added,
            removed,
            modified,
        }
    }
}

/// Delta between two snapshots. `modified` carries the newer state of
/// devices whose identity survived but whose interface paths changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub added: Vec<DeviceInfo>,
    pub removed: Vec<DeviceInfo>,
    pub modified: Vec<DeviceInfo>,
}

impl SnapshotDiff {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.modified.is_empty()
    }
}
