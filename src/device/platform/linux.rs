use serialport::SerialPortType;

use crate::device::manager::{DeviceManager, DiscoveryFilter};
use crate::device::models::DeviceInfo;
use crate::device::{DeviceError, Result};

/// Topology walker backed by udev.
///
/// The composite adapter is located by its usb VID/PID attributes; the
/// serial, hidraw, video4linux and sound interfaces are then correlated
/// by walking each node up to its owning usb device and comparing port
/// chains.
pub struct LinuxDeviceManager {
    filter: DiscoveryFilter,
}

impl LinuxDeviceManager {
    pub fn new(filter: DiscoveryFilter) -> Self {
        Self { filter }
    }

    fn context() -> Result<libudev::Context> {
        libudev::Context::new().map_err(|e| DeviceError::EnumerationFailed(e.to_string()))
    }

    /// Serial port whose usb ancestor sits on the target chain. Exact
    /// chain match wins; a shared main hub segment is accepted as
    /// fallback because the serial adapter is a sibling interface.
    fn serial_for_chain(
        &self,
        context: &libudev::Context,
        target_chain: &str,
    ) -> Result<Option<(String, String)>> {
        let (vid, pid) = match parse_ids(&self.filter.serial_vid, &self.filter.serial_pid) {
            Some(ids) => ids,
            None => return Ok(None),
        };

        let mut candidates = Vec::new();
        for port in serialport::available_ports()? {
            if let SerialPortType::UsbPort(usb) = &port.port_type {
                if usb.vid == vid && usb.pid == pid {
                    candidates.push(port.port_name.clone());
                }
            }
        }
        if candidates.is_empty() {
            return Ok(None);
        }

        let target_main = main_segment(target_chain);
        let mut fallback = None;

        let mut enumerator = libudev::Enumerator::new(context)
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;
        enumerator
            .match_subsystem("tty")
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;
        let devices = enumerator
            .scan_devices()
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;

        for device in devices {
            let node = match device.devnode().and_then(|p| p.to_str()) {
                Some(node) => node.to_string(),
                None => continue,
            };
            if !candidates.iter().any(|c| c == &node) {
                continue;
            }
            let chain = match usb_ancestor_chain(&device) {
                Some(chain) => chain,
                None => continue,
            };
            if chain == target_chain {
                log::debug!("Serial port {} exactly on chain {}", node, chain);
                return Ok(Some((node.clone(), node)));
            }
            if main_segment(&chain) == target_main && fallback.is_none() {
                log::debug!(
                    "Serial port {} matched via main segment {} (chain {})",
                    node,
                    target_main,
                    chain
                );
                fallback = Some((node.clone(), node));
            }
        }
        Ok(fallback)
    }

    /// HID interface on the target chain: hidapi enumeration filtered by
    /// VID/PID, then located either by the port fragment embedded in the
    /// hidapi path or through the hidraw node's usb ancestor.
    fn hid_for_chain(
        &self,
        context: &libudev::Context,
        target_chain: &str,
    ) -> Result<Option<(String, String)>> {
        let (vid, pid) = match parse_ids(&self.filter.hid_vid, &self.filter.hid_pid) {
            Some(ids) => ids,
            None => return Ok(None),
        };

        let api = hidapi::HidApi::new()?;
        let fragment = port_fragment(target_chain);
        let mut candidates = Vec::new();

        for device in api.device_list() {
            if device.vendor_id() != vid || device.product_id() != pid {
                continue;
            }
            let path = device.path().to_string_lossy().to_string();
            let id = device
                .product_string()
                .map(str::to_string)
                .unwrap_or_else(|| path.clone());
            if path.contains(fragment) {
                return Ok(Some((id, path)));
            }
            candidates.push((id, path));
        }
        if candidates.is_empty() {
            return Ok(None);
        }

        // hidraw node paths carry no port info, so resolve ambiguity
        // through the usb ancestor of each hidraw node.
        let target_main = main_segment(target_chain);
        let mut enumerator = libudev::Enumerator::new(context)
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;
        enumerator
            .match_subsystem("hidraw")
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;
        let devices = enumerator
            .scan_devices()
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;

        for device in devices {
            let node = match device.devnode().and_then(|p| p.to_str()) {
                Some(node) => node.to_string(),
                None => continue,
            };
            let matched = candidates.iter().find(|(_, path)| path == &node);
            let (id, path) = match matched {
                Some(pair) => pair.clone(),
                None => continue,
            };
            if let Some(chain) = usb_ancestor_chain(&device) {
                if chain == target_chain || main_segment(&chain) == target_main {
                    return Ok(Some((id, path)));
                }
            }
        }
        Ok(None)
    }

    /// First device node of `subsystem` whose usb ancestor sits exactly
    /// on the target chain.
    fn node_for_chain(
        context: &libudev::Context,
        subsystem: &str,
        target_chain: &str,
    ) -> Result<Option<String>> {
        let mut enumerator = libudev::Enumerator::new(context)
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;
        enumerator
            .match_subsystem(subsystem)
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;
        let devices = enumerator
            .scan_devices()
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;

        for device in devices {
            let node = match device.devnode().and_then(|p| p.to_str()) {
                Some(node) => node.to_string(),
                None => continue,
            };
            if let Some(chain) = usb_ancestor_chain(&device) {
                if chain == target_chain {
                    return Ok(Some(node));
                }
            }
        }
        Ok(None)
    }
}

impl DeviceManager for LinuxDeviceManager {
    fn discover_devices(&self) -> Result<Vec<DeviceInfo>> {
        let context = Self::context()?;
        let mut enumerator = libudev::Enumerator::new(&context)
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;
        enumerator
            .match_subsystem("usb")
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;
        let devices = enumerator
            .scan_devices()
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;

        let mut found = Vec::new();
        for device in devices {
            if device.devtype().and_then(|t| t.to_str()) != Some("usb_device") {
                continue;
            }
            let vid = attribute(&device, "idVendor");
            let pid = attribute(&device, "idProduct");
            let identity = format!("{} {}", vid, pid);
            if !self.filter.matches_hid(&identity) {
                continue;
            }

            let syspath = device.syspath().to_string_lossy().to_string();
            let port_chain = build_port_chain(&syspath);
            log::info!("Composite device {} on chain {}", syspath, port_chain);

            let mut info = DeviceInfo::new(port_chain.clone());
            info.usb_device_id = Some(syspath);

            if let Some((id, path)) = self.serial_for_chain(&context, &port_chain)? {
                log::info!("Found serial port {} on chain {}", path, port_chain);
                info.serial_port_id = Some(id);
                info.serial_port_path = Some(path);
            }
            if let Some((id, path)) = self.hid_for_chain(&context, &port_chain)? {
                log::info!("Found HID device {} on chain {}", path, port_chain);
                info.hid_device_id = Some(id);
                info.hid_device_path = Some(path);
            }
            if let Some(node) = Self::node_for_chain(&context, "video4linux", &port_chain)? {
                log::info!("Found video device {} on chain {}", node, port_chain);
                info.camera_device_id = Some(node.clone());
                info.camera_device_path = Some(node);
            }
            if let Some(node) = Self::node_for_chain(&context, "sound", &port_chain)? {
                log::info!("Found audio device {} on chain {}", node, port_chain);
                info.audio_device_id = Some(node.clone());
                info.audio_device_path = Some(node);
            }

            found.push(info);
        }
        Ok(found)
    }

    fn get_port_chain(&self, device_id: &str) -> Result<Option<String>> {
        let context = Self::context()?;
        let mut enumerator = libudev::Enumerator::new(&context)
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;
        enumerator
            .match_subsystem("usb")
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;
        let devices = enumerator
            .scan_devices()
            .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;

        for device in devices {
            let syspath = device.syspath().to_string_lossy();
            if syspath == device_id {
                return Ok(Some(build_port_chain(&syspath)));
            }
        }
        Ok(None)
    }
}

fn attribute(device: &libudev::Device, name: &str) -> String {
    device
        .attribute_value(name)
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Walk up to the usb device that owns an interface node and return its
/// port chain.
fn usb_ancestor_chain(device: &libudev::Device) -> Option<String> {
    ancestor_chain_bounded(device, 8)
}

fn ancestor_chain_bounded(device: &libudev::Device, depth: usize) -> Option<String> {
    if depth == 0 {
        return None;
    }
    let parent = device.parent()?;
    if parent.devtype().and_then(|t| t.to_str()) == Some("usb_device") {
        Some(build_port_chain(&parent.syspath().to_string_lossy()))
    } else {
        ancestor_chain_bounded(&parent, depth - 1)
    }
}

/// Canonical chain from a sysfs device path: the usb bus segment plus
/// every hub port segment (those carrying a branch dot), joined by "-".
/// Example: .../usb1/1-5/1-5.1 becomes "usb1-1-5.1".
pub fn build_port_chain(devpath: &str) -> String {
    let mut parts = Vec::new();
    for segment in devpath.split('/') {
        if let Some(bus) = segment.strip_prefix("usb") {
            if !bus.is_empty() && bus.chars().all(|c| c.is_ascii_digit()) {
                parts.push(segment.to_string());
            }
        } else if segment.contains('-') && segment.contains('.') {
            parts.push(segment.to_string());
        }
    }
    if parts.is_empty() {
        devpath.to_string()
    } else {
        parts.join("-")
    }
}

/// Main hub segment of a chain: "usb1-1-5.1" yields "1-5". Used for the
/// sibling-interface fallback match, which trades precision for recall
/// on hubs exposing the serial adapter one port over.
pub fn main_segment(port_chain: &str) -> String {
    let parts: Vec<&str> = port_chain.split('-').collect();
    if parts.len() >= 3 {
        let main = parts[2].split('.').next().unwrap_or(parts[2]);
        format!("{}-{}", parts[1], main)
    } else {
        port_chain.to_string()
    }
}

/// Chain with the bus prefix removed: "usb1-1-5.1" yields "1-5.1".
fn port_fragment(port_chain: &str) -> &str {
    match port_chain.split_once('-') {
        Some((_, rest)) => rest,
        None => port_chain,
    }
}

fn parse_ids(vid: &str, pid: &str) -> Option<(u16, u16)> {
    let vid = u16::from_str_radix(vid, 16).ok()?;
    let pid = u16::from_str_radix(pid, 16).ok()?;
    Some((vid, pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_port_chain_from_sysfs_path() {
        let devpath = "/sys/devices/pci0000:00/0000:00:14.0/usb1/1-5/1-5.1";
        assert_eq!(build_port_chain(devpath), "usb1-1-5.1");
    }

    #[test]
    fn test_build_port_chain_deep_branch() {
        let devpath = "/devices/platform/usb2/2-1/2-1.4/2-1.4.2";
        assert_eq!(build_port_chain(devpath), "usb2-2-1.4-2-1.4.2");
    }

    #[test]
    fn test_build_port_chain_fallback_to_raw_path() {
        // No usb segments at all: return the raw path rather than nothing
        let devpath = "/devices/virtual/tty/tty0";
        assert_eq!(build_port_chain(devpath), devpath);
    }

    #[test]
    fn test_main_segment_extraction() {
        assert_eq!(main_segment("usb1-1-5.1"), "1-5");
        assert_eq!(main_segment("usb3-3-2.4"), "3-2");
        // Too short to truncate: passthrough
        assert_eq!(main_segment("usb1"), "usb1");
    }

    #[test]
    fn test_port_fragment_strips_bus() {
        assert_eq!(port_fragment("usb1-1-5.1"), "1-5.1");
        assert_eq!(port_fragment("plainchain"), "plainchain");
    }

    #[test]
    fn test_parse_ids() {
        assert_eq!(parse_ids("1A86", "7523"), Some((0x1A86, 0x7523)));
        assert_eq!(parse_ids("534d", "2109"), Some((0x534D, 0x2109)));
        assert_eq!(parse_ids("zz", "7523"), None);
    }
}
