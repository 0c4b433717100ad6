use std::collections::VecDeque;
use std::process::Command;

use serialport::SerialPortType;
use windows::core::PCWSTR;
use windows::Win32::Devices::DeviceAndDriverInstallation::{
    CM_Get_Child, CM_Get_Device_IDW, CM_Get_Parent, CM_Get_Sibling, SetupDiDestroyDeviceInfoList,
    SetupDiEnumDeviceInfo, SetupDiGetClassDevsW, CR_SUCCESS, DIGCF_ALLCLASSES, DIGCF_PRESENT,
    HDEVINFO, SP_DEVINFO_DATA,
};

use crate::device::manager::{DeviceManager, DiscoveryFilter};
use crate::device::models::DeviceInfo;
use crate::device::{DeviceError, Result};

/// Ancestor hops recorded when composing a port chain.
const PORT_CHAIN_DEPTH: usize = 3;

/// Interface suffixes of the composite device that carry no usable
/// endpoint and are skipped during classification.
const EXCLUDED_ID_FRAGMENTS: &[&str] = &["&0002", "&0004"];

const MAX_DEVICE_ID_LEN: usize = 200;
/// Bound on the child walk; composite usb trees are shallow and a cycle
/// in the instance graph must not hang discovery.
const MAX_CHILD_VISITS: usize = 256;

/// Topology walker backed by SetupAPI and CfgMgr32.
///
/// The composite adapter is located by the VID/PID fragments of its
/// device instance id; its children are classified by id substrings and
/// the serial adapter is picked out of the sibling set under the same
/// hub.
pub struct WindowsDeviceManager {
    filter: DiscoveryFilter,
}

impl WindowsDeviceManager {
    pub fn new(filter: DiscoveryFilter) -> Self {
        Self { filter }
    }

    fn serial_port_path(&self, serial_device_id: &str) -> Option<String> {
        let ports = serialport::available_ports().ok()?;
        let mut fallback = None;
        for port in ports {
            if let SerialPortType::UsbPort(usb) = &port.port_type {
                let identity = format!("VID_{:04X}&PID_{:04X}", usb.vid, usb.pid);
                if !self.filter.matches_serial(&identity) {
                    continue;
                }
                if let Some(serial) = &usb.serial_number {
                    if !serial.is_empty()
                        && serial_device_id.to_uppercase().contains(&serial.to_uppercase())
                    {
                        return Some(port.port_name);
                    }
                }
                if fallback.is_none() {
                    fallback = Some(port.port_name.clone());
                }
            }
        }
        fallback
    }

    fn hid_path(&self, hid_device_id: &str) -> Option<String> {
        let instance = instance_suffix(hid_device_id).to_lowercase();
        if instance.is_empty() {
            return None;
        }
        let api = hidapi::HidApi::new().ok()?;
        for device in api.device_list() {
            let path = device.path().to_string_lossy().to_string();
            if path.to_lowercase().contains(&instance) {
                return Some(path);
            }
        }
        None
    }

    /// Resolve camera and audio endpoint names from the DirectShow
    /// device list, matching by instance-id fragments.
    fn camera_audio_paths(
        &self,
        camera_id: Option<&str>,
        audio_id: Option<&str>,
    ) -> (Option<String>, Option<String>) {
        let alternatives = list_dshow_alternative_names();
        let camera_fragment = camera_id.map(|id| instance_suffix(id).to_lowercase());
        let audio_fragment = audio_id.and_then(|id| id.rsplit('.').next().map(str::to_string));

        let mut camera_path = None;
        let mut audio_path = None;
        for name in &alternatives {
            if let Some(fragment) = &camera_fragment {
                if !fragment.is_empty() && name.to_lowercase().contains(fragment) {
                    camera_path.get_or_insert_with(|| name.clone());
                }
            }
            if let Some(fragment) = &audio_fragment {
                if !fragment.is_empty() && name.contains(fragment) {
                    audio_path.get_or_insert_with(|| name.clone());
                }
            }
        }
        (camera_path, audio_path)
    }
}

impl DeviceManager for WindowsDeviceManager {
    fn discover_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut found = Vec::new();

        for root in enumerate_usb_devinsts()? {
            let device_id = match device_id_of(root) {
                Some(id) => id,
                None => continue,
            };
            if !self.filter.matches_hid(&device_id) {
                continue;
            }
            if EXCLUDED_ID_FRAGMENTS.iter().any(|f| device_id.contains(f)) {
                continue;
            }

            let ancestry = ancestor_ids(root);
            let port_chain = compose_port_chain(&ancestry);
            log::info!("Composite device {} on chain {}", device_id, port_chain);

            let mut info = DeviceInfo::new(port_chain.clone());
            info.usb_device_id = Some(device_id.clone());

            // Serial adapter: a sibling under the same hub
            if let Some(parent) = parent_of(root) {
                for sibling in children_of(parent) {
                    if sibling == root {
                        continue;
                    }
                    if let Some(sibling_id) = device_id_of(sibling) {
                        if self.filter.matches_serial(&sibling_id) {
                            log::info!("Found serial sibling {}", sibling_id);
                            info.serial_port_path = self.serial_port_path(&sibling_id);
                            info.serial_port_id = Some(sibling_id);
                            break;
                        }
                    }
                }
            }

            // Interface children of the composite node
            for child in descendants_of(root) {
                let child_id = match device_id_of(child) {
                    Some(id) => id,
                    None => continue,
                };
                if EXCLUDED_ID_FRAGMENTS.iter().any(|f| child_id.contains(f)) {
                    continue;
                }
                if child_id.contains("HID") && info.hid_device_id.is_none() {
                    info.hid_device_path = self.hid_path(&child_id);
                    info.hid_device_id = Some(child_id);
                } else if child_id.contains("MI_00") && info.camera_device_id.is_none() {
                    info.camera_device_id = Some(child_id);
                } else if child_id.contains("Audio") && info.audio_device_id.is_none() {
                    info.audio_device_id = Some(child_id);
                }
            }

            let (camera_path, audio_path) = self.camera_audio_paths(
                info.camera_device_id.as_deref(),
                info.audio_device_id.as_deref(),
            );
            info.camera_device_path = camera_path;
            info.audio_device_path = audio_path;

            found.push(info);
        }
        Ok(found)
    }

    fn get_port_chain(&self, device_id: &str) -> Result<Option<String>> {
        for devinst in enumerate_usb_devinsts()? {
            if device_id_of(devinst).as_deref() == Some(device_id) {
                return Ok(Some(compose_port_chain(&ancestor_ids(devinst))));
            }
        }
        Ok(None)
    }
}

/// Compose the canonical chain token from device instance ids ordered
/// root to leaf: the trailing digit of each hop joined by "-", with the
/// root hop's digit incremented by one and a fixed ".2" suffix on the
/// leaf. This mirrors how the vendor's tooling labels sockets; treat the
/// token as opaque and only compare for equality.
pub fn compose_port_chain(ids: &[String]) -> String {
    if ids.is_empty() {
        return String::new();
    }

    let mut chain = String::new();
    let mut head = String::new();
    let count = ids.len();
    for (j, id) in ids.iter().enumerate() {
        let j = j + 1;
        let last = id.chars().last().unwrap_or('0');
        if j == 1 {
            let bumped = last.to_digit(10).map(|d| d + 1).unwrap_or(0);
            head = format!("{}-", bumped);
        }
        if j == 2 {
            chain = format!("{}{}", head, last);
        }
        if j > 2 && j < count {
            chain.push('-');
            chain.push(last);
        }
        if j == count {
            if j == 1 {
                chain = head.trim_end_matches('-').to_string();
            }
            chain.push_str(".2");
        }
    }
    chain
}

/// Instance ids of a node and its ancestors, root first, bounded depth.
fn ancestor_ids(mut devinst: u32) -> Vec<String> {
    let mut ids = Vec::new();
    for _ in 0..PORT_CHAIN_DEPTH {
        match device_id_of(devinst) {
            Some(id) => ids.push(id),
            None => break,
        }
        match parent_of(devinst) {
            Some(parent) => devinst = parent,
            None => break,
        }
    }
    ids.reverse();
    ids
}

/// All present usb device instances.
fn enumerate_usb_devinsts() -> Result<Vec<u32>> {
    let enumerator: Vec<u16> = "USB\0".encode_utf16().collect();
    let hdev: HDEVINFO = unsafe {
        SetupDiGetClassDevsW(
            None,
            PCWSTR(enumerator.as_ptr()),
            None,
            DIGCF_PRESENT | DIGCF_ALLCLASSES,
        )
    }
    .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;

    let mut devinsts = Vec::new();
    let mut index = 0u32;
    loop {
        let mut data = SP_DEVINFO_DATA {
            cbSize: std::mem::size_of::<SP_DEVINFO_DATA>() as u32,
            ..Default::default()
        };
        if unsafe { SetupDiEnumDeviceInfo(hdev, index, &mut data) }.is_err() {
            break;
        }
        devinsts.push(data.DevInst);
        index += 1;
    }
    unsafe {
        let _ = SetupDiDestroyDeviceInfoList(hdev);
    }
    Ok(devinsts)
}

fn device_id_of(devinst: u32) -> Option<String> {
    let mut buf = [0u16; MAX_DEVICE_ID_LEN];
    let ret = unsafe { CM_Get_Device_IDW(devinst, &mut buf, 0) };
    if ret != CR_SUCCESS {
        return None;
    }
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    Some(String::from_utf16_lossy(&buf[..len]))
}

fn parent_of(devinst: u32) -> Option<u32> {
    let mut parent = 0u32;
    let ret = unsafe { CM_Get_Parent(&mut parent, devinst, 0) };
    (ret == CR_SUCCESS).then_some(parent)
}

fn first_child_of(devinst: u32) -> Option<u32> {
    let mut child = 0u32;
    let ret = unsafe { CM_Get_Child(&mut child, devinst, 0) };
    (ret == CR_SUCCESS).then_some(child)
}

fn next_sibling_of(devinst: u32) -> Option<u32> {
    let mut sibling = 0u32;
    let ret = unsafe { CM_Get_Sibling(&mut sibling, devinst, 0) };
    (ret == CR_SUCCESS).then_some(sibling)
}

/// Direct children of a node.
fn children_of(devinst: u32) -> Vec<u32> {
    let mut children = Vec::new();
    let mut current = first_child_of(devinst);
    while let Some(child) = current {
        children.push(child);
        current = next_sibling_of(child);
    }
    children
}

/// Every descendant of a node, breadth-first with a visit bound.
fn descendants_of(devinst: u32) -> Vec<u32> {
    let mut result = Vec::new();
    let mut queue: VecDeque<u32> = children_of(devinst).into();
    while let Some(node) = queue.pop_front() {
        if result.len() >= MAX_CHILD_VISITS {
            log::warn!("Child walk truncated at {} nodes", MAX_CHILD_VISITS);
            break;
        }
        result.push(node);
        queue.extend(children_of(node));
    }
    result
}

/// Last path component of a device instance id.
fn instance_suffix(device_id: &str) -> &str {
    device_id.rsplit('\\').next().unwrap_or(device_id)
}

/// DirectShow endpoint names, parsed from ffmpeg's device listing.
fn list_dshow_alternative_names() -> Vec<String> {
    let output = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-f",
            "dshow",
            "-list_devices",
            "true",
            "-i",
            "dummy",
        ])
        .output();
    let output = match output {
        Ok(output) => output,
        Err(err) => {
            log::debug!("ffmpeg device listing unavailable: {}", err);
            return Vec::new();
        }
    };

    // ffmpeg prints the listing on stderr
    let text = String::from_utf8_lossy(&output.stderr);
    let mut names = Vec::new();
    for line in text.lines() {
        if !line.contains("Alternative name") {
            continue;
        }
        if let Some(start) = line.find('"') {
            if let Some(end) = line[start + 1..].find('"') {
                names.push(line[start + 1..start + 1 + end].to_string());
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_compose_port_chain_three_hops() {
        // Root hub digit 3 becomes 4; the leaf hop gains the fixed suffix
        let chain = compose_port_chain(&ids(&[
            "PCI\\VEN_8086&DEV_A36D\\3",
            "USB\\ROOT_HUB30\\5",
            "USB\\VID_534D&PID_2109\\7",
        ]));
        assert_eq!(chain, "4-5.2");
    }

    #[test]
    fn test_compose_port_chain_four_hops_keeps_middles() {
        let chain = compose_port_chain(&ids(&["A\\1", "B\\5", "C\\7", "D\\9"]));
        assert_eq!(chain, "2-5-7.2");
    }

    #[test]
    fn test_compose_port_chain_two_hops() {
        let chain = compose_port_chain(&ids(&["HUB\\1", "USB\\VID_534D&PID_2109\\6"]));
        assert_eq!(chain, "2-6.2");
    }

    #[test]
    fn test_compose_port_chain_empty() {
        assert_eq!(compose_port_chain(&[]), "");
    }

    #[test]
    fn test_compose_port_chain_non_digit_root() {
        // A root id not ending in a digit maps to hop 0 instead of panicking
        let chain = compose_port_chain(&ids(&["ACPI\\PNP0A08\\X", "USB\\HUB\\2"]));
        assert_eq!(chain, "0-2.2");
    }

    #[test]
    fn test_instance_suffix() {
        assert_eq!(
            instance_suffix("USB\\VID_534D&PID_2109&MI_04\\6&158F14B8&0&0004"),
            "6&158F14B8&0&0004"
        );
        assert_eq!(instance_suffix("no-backslash"), "no-backslash");
    }

    #[test]
    fn test_excluded_fragments() {
        let id = "USB\\VID_534D&PID_2109&MI_04\\6&158F14B8&0&0002";
        assert!(EXCLUDED_ID_FRAGMENTS.iter().any(|f| id.contains(f)));
    }
}
