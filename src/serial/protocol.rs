use serde::{Deserialize, Serialize};

use super::{Result, SerialError};

/// CH9329 frame header, fixed two-byte prefix of every command and reply.
pub const FRAME_HEADER: [u8; 2] = [0x57, 0xAB];

/// Default chip address byte used in all frames.
pub const DEFAULT_ADDR: u8 = 0x00;

/// Smallest well-formed frame: header + addr + cmd + len + checksum.
pub const MIN_FRAME_LEN: usize = 6;

// Command codes
pub const CMD_GET_INFO: u8 = 0x01;
pub const CMD_SEND_KB_GENERAL_DATA: u8 = 0x02;
pub const CMD_SEND_MS_ABS_DATA: u8 = 0x04;
pub const CMD_SEND_MS_REL_DATA: u8 = 0x05;
pub const CMD_GET_PARA_CFG: u8 = 0x08;
pub const CMD_SET_PARA_CFG: u8 = 0x09;
pub const CMD_SET_USB_STRING: u8 = 0x0B;
pub const CMD_SET_DEFAULT_CFG: u8 = 0x0C;
pub const CMD_RESET: u8 = 0x0F;

// Modifier bitmask layout for keyboard reports
pub const MOD_LEFT_CTRL: u8 = 0x01;
pub const MOD_LEFT_SHIFT: u8 = 0x02;
pub const MOD_LEFT_ALT: u8 = 0x04;
pub const MOD_LEFT_GUI: u8 = 0x08;
pub const MOD_RIGHT_CTRL: u8 = 0x10;
pub const MOD_RIGHT_SHIFT: u8 = 0x20;
pub const MOD_RIGHT_ALT: u8 = 0x40;
pub const MOD_RIGHT_GUI: u8 = 0x80;

/// Operating baud rate the bridge chip is driven at once configured.
pub const TARGET_BAUD: u32 = 115_200;
/// Manufacturing default baud rate, used on the recovery path.
pub const FACTORY_BAUD: u32 = 9_600;

/// Transmission mode where protocol framing was enabled via software config.
pub const MODE_PROTOCOL_SOFTWARE: u8 = 0x82;
/// Transmission mode where protocol framing is selected by chip straps.
pub const MODE_PROTOCOL_HARDWARE: u8 = 0x02;

/// Length of the parameter configuration block carried by GET/SET_PARA_CFG.
pub const PARA_CFG_LEN: usize = 50;

/// Status byte taxonomy for short-form command replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    Timeout,
    HeaderError,
    CommandError,
    ChecksumError,
    ParameterError,
    OperationError,
    Unknown(u8),
}

impl StatusCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => StatusCode::Success,
            0xE1 => StatusCode::Timeout,
            0xE2 => StatusCode::HeaderError,
            0xE3 => StatusCode::CommandError,
            0xE4 => StatusCode::ChecksumError,
            0xE5 => StatusCode::ParameterError,
            0xE6 => StatusCode::OperationError,
            other => StatusCode::Unknown(other),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Success)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            StatusCode::Success => "success",
            StatusCode::Timeout => "serial response timeout",
            StatusCode::HeaderError => "packet header error",
            StatusCode::CommandError => "command error",
            StatusCode::ChecksumError => "checksum error",
            StatusCode::ParameterError => "argument error",
            StatusCode::OperationError => "execution error",
            StatusCode::Unknown(_) => "unknown error",
        }
    }
}

/// Log a device-reported status along with the frame it arrived in.
pub fn log_status(status: StatusCode, frame: &[u8]) {
    if !status.is_success() {
        log::warn!(
            "Device reported {}, frame: {}",
            status.describe(),
            hex::encode(frame)
        );
    }
}

/// Byte-wise sum of all preceding bytes, truncated to 8 bits.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Build a complete framed command: header, addr, cmd, len, data, checksum.
pub fn build_frame(addr: u8, cmd: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MIN_FRAME_LEN + data.len());
    frame.extend_from_slice(&FRAME_HEADER);
    frame.push(addr);
    frame.push(cmd);
    frame.push(data.len() as u8);
    frame.extend_from_slice(data);
    frame.push(checksum(&frame));
    frame
}

/// Validate header, declared length and checksum of a received frame.
pub fn verify_frame(frame: &[u8]) -> bool {
    if frame.len() < MIN_FRAME_LEN || frame[0..2] != FRAME_HEADER {
        return false;
    }
    let data_len = frame[4] as usize;
    if frame.len() != MIN_FRAME_LEN + data_len {
        return false;
    }
    checksum(&frame[..frame.len() - 1]) == frame[frame.len() - 1]
}

/// Split a verified frame into its command byte and data payload.
/// Returns `None` for anything that fails `verify_frame`.
pub fn parse_reply(frame: &[u8]) -> Option<(u8, &[u8])> {
    if !verify_frame(frame) {
        return None;
    }
    let data_len = frame[4] as usize;
    Some((frame[3], &frame[5..5 + data_len]))
}

/// Replies echo the request command with the high bit set; accept both forms.
pub fn reply_matches(frame_cmd: u8, cmd: u8) -> bool {
    frame_cmd & 0x7F == cmd
}

/// Extract the status byte from a short-form (single data byte) reply.
pub fn parse_status_reply(frame: &[u8], cmd: u8) -> Option<StatusCode> {
    let (reply_cmd, data) = parse_reply(frame)?;
    if !reply_matches(reply_cmd, cmd) || data.len() != 1 {
        return None;
    }
    Some(StatusCode::from_byte(data[0]))
}

/// Chip identity block returned by GET_INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipInfo {
    pub version: u8,
    pub target_connected: bool,
    /// Keyboard indicator LEDs as reported by the target host.
    pub indicators: u8,
}

impl ChipInfo {
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let (cmd, data) = parse_reply(frame)?;
        if !reply_matches(cmd, CMD_GET_INFO) || data.len() < 3 {
            return None;
        }
        Some(Self {
            version: data[0],
            target_connected: data[1] != 0,
            indicators: data[2],
        })
    }

    pub fn num_lock(&self) -> bool {
        self.indicators & 0x01 != 0
    }

    pub fn caps_lock(&self) -> bool {
        self.indicators & 0x02 != 0
    }

    pub fn scroll_lock(&self) -> bool {
        self.indicators & 0x04 != 0
    }
}

/// Factory parameter block: protocol mode, 115200 baud, CH340 usb identity.
pub const DEFAULT_PARA_CFG: [u8; PARA_CFG_LEN] = [
    0x82, 0x80, 0x00, // mode, comm config, chip address
    0x00, 0x01, 0xC2, 0x00, // baud 115200, big-endian
    0x08, 0x00, // reserved
    0x00, 0x03, // packet interval
    0x86, 0x1A, // vid, little-endian
    0x29, 0xE1, // pid, little-endian
    0x00, 0x00, // keyboard upload interval
    0x00, 0x01, // keyboard release timeout
    0x00, // auto enter flag
    0x0D, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // enter keys
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // filter
    0x00, // custom usb descriptor flag
    0x00, // speed mode
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// The 50-byte parameter configuration block of the bridge chip.
///
/// Kept as the raw wire bytes with typed accessors so a reconfiguration
/// can rewrite the baud rate and mode while preserving every other field
/// byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamConfig {
    raw: [u8; PARA_CFG_LEN],
}

impl ParamConfig {
    pub fn from_raw(raw: [u8; PARA_CFG_LEN]) -> Self {
        Self { raw }
    }

    /// Parse the config block out of a GET_PARA_CFG reply frame.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let (cmd, data) = parse_reply(frame)
            .ok_or_else(|| SerialError::ProtocolError("malformed config reply".to_string()))?;
        if !reply_matches(cmd, CMD_GET_PARA_CFG) {
            return Err(SerialError::ProtocolError(format!(
                "unexpected reply command 0x{:02X}",
                cmd
            )));
        }
        if data.len() < PARA_CFG_LEN {
            return Err(SerialError::ProtocolError(format!(
                "config reply too short: {} bytes",
                data.len()
            )));
        }
        let mut raw = [0u8; PARA_CFG_LEN];
        raw.copy_from_slice(&data[..PARA_CFG_LEN]);
        Ok(Self { raw })
    }

    pub fn as_bytes(&self) -> &[u8; PARA_CFG_LEN] {
        &self.raw
    }

    pub fn mode(&self) -> u8 {
        self.raw[0]
    }

    pub fn comm_cfg(&self) -> u8 {
        self.raw[1]
    }

    pub fn chip_addr(&self) -> u8 {
        self.raw[2]
    }

    /// Baud rate, big-endian on the wire.
    pub fn baudrate(&self) -> u32 {
        u32::from_be_bytes([self.raw[3], self.raw[4], self.raw[5], self.raw[6]])
    }

    pub fn vid(&self) -> u16 {
        u16::from_le_bytes([self.raw[11], self.raw[12]])
    }

    pub fn pid(&self) -> u16 {
        u16::from_le_bytes([self.raw[13], self.raw[14]])
    }

    pub fn set_mode(&mut self, mode: u8) {
        self.raw[0] = mode;
    }

    pub fn set_baudrate(&mut self, baud: u32) {
        self.raw[3..7].copy_from_slice(&baud.to_be_bytes());
    }

    /// Whether the block describes a chip the protocol engine can talk to
    /// at the target baud rate without reconfiguration.
    pub fn is_target_config(&self) -> bool {
        self.baudrate() == TARGET_BAUD && is_protocol_mode(self.mode())
    }
}

impl Default for ParamConfig {
    fn default() -> Self {
        Self {
            raw: DEFAULT_PARA_CFG,
        }
    }
}

pub fn is_protocol_mode(mode: u8) -> bool {
    mode == MODE_PROTOCOL_SOFTWARE || mode == MODE_PROTOCOL_HARDWARE
}

/// Build the 8-byte keyboard report: modifier bitmask, reserved zero,
/// up to six concurrently held key codes, zero-padded.
pub fn keyboard_report(modifiers: u8, keys: &[u8]) -> [u8; 8] {
    let mut report = [0u8; 8];
    report[0] = modifiers;
    for (slot, key) in report[2..].iter_mut().zip(keys.iter().take(6)) {
        *slot = *key;
    }
    report
}

fn clamp_i8(value: i32) -> u8 {
    value.clamp(-127, 127) as i8 as u8
}

/// Relative mouse payload: buttons, dx, dy, wheel. Deltas are clamped to
/// [-127, 127] and encoded as two's-complement bytes.
pub fn encode_mouse_relative(buttons: u8, dx: i32, dy: i32, wheel: i32) -> [u8; 4] {
    [buttons, clamp_i8(dx), clamp_i8(dy), clamp_i8(wheel)]
}

/// Absolute mouse payload: buttons, x, y as 16-bit little-endian values
/// clamped to [0, 32767], then wheel.
pub fn encode_mouse_absolute(buttons: u8, x: i32, y: i32, wheel: i32) -> [u8; 6] {
    let x = x.clamp(0, 32767) as u16;
    let y = y.clamp(0, 32767) as u16;
    let xb = x.to_le_bytes();
    let yb = y.to_le_bytes();
    [buttons, xb[0], xb[1], yb[0], yb[1], clamp_i8(wheel)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_matches_known_frame() {
        // GET_INFO command frame
        let data = [0x57u8, 0xAB, 0x00, 0x01, 0x00];
        assert_eq!(checksum(&data), 0x03);
    }

    #[test]
    fn test_frame_roundtrip_verifies() {
        let frame = build_frame(DEFAULT_ADDR, CMD_GET_PARA_CFG, &[]);
        assert_eq!(frame, vec![0x57, 0xAB, 0x00, 0x08, 0x00, 0x0A]);
        assert!(verify_frame(&frame));
    }

    #[test]
    fn test_single_bit_flip_breaks_verification() {
        let frame = build_frame(
            DEFAULT_ADDR,
            CMD_SEND_KB_GENERAL_DATA,
            &keyboard_report(0, &[0x04]),
        );
        assert!(verify_frame(&frame));
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    !verify_frame(&corrupted),
                    "bit {} of byte {} went undetected",
                    bit,
                    byte
                );
            }
        }
    }

    #[test]
    fn test_parse_reply_extracts_payload() {
        let frame = build_frame(DEFAULT_ADDR, 0x81, &[0x01, 0x02]);
        let (cmd, data) = parse_reply(&frame).unwrap();
        assert_eq!(cmd, 0x81);
        assert_eq!(data, &[0x01, 0x02]);
        assert!(reply_matches(cmd, CMD_GET_INFO));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(StatusCode::from_byte(0x00), StatusCode::Success);
        assert_eq!(StatusCode::from_byte(0xE1), StatusCode::Timeout);
        assert_eq!(StatusCode::from_byte(0xE4), StatusCode::ChecksumError);
        assert_eq!(StatusCode::from_byte(0x42), StatusCode::Unknown(0x42));
        assert!(!StatusCode::Unknown(0x42).is_success());
    }

    #[test]
    fn test_status_reply_parsing() {
        let ok = build_frame(DEFAULT_ADDR, CMD_RESET | 0x80, &[0x00]);
        assert_eq!(
            parse_status_reply(&ok, CMD_RESET),
            Some(StatusCode::Success)
        );
        let err = build_frame(DEFAULT_ADDR, CMD_SET_PARA_CFG | 0x80, &[0xE5]);
        assert_eq!(
            parse_status_reply(&err, CMD_SET_PARA_CFG),
            Some(StatusCode::ParameterError)
        );
    }

    #[test]
    fn test_chip_info_parse() {
        let frame = build_frame(
            DEFAULT_ADDR,
            CMD_GET_INFO | 0x80,
            &[0x01, 0x01, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00],
        );
        let info = ChipInfo::parse(&frame).unwrap();
        assert_eq!(info.version, 1);
        assert!(info.target_connected);
        assert!(info.num_lock());
        assert!(info.caps_lock());
        assert!(!info.scroll_lock());
    }

    #[test]
    fn test_default_para_cfg_fields() {
        let cfg = ParamConfig::default();
        assert_eq!(cfg.mode(), MODE_PROTOCOL_SOFTWARE);
        assert_eq!(cfg.baudrate(), TARGET_BAUD);
        assert_eq!(cfg.vid(), 0x1A86);
        assert_eq!(cfg.pid(), 0xE129);
        assert!(cfg.is_target_config());
    }

    #[test]
    fn test_param_config_rewrite_preserves_other_fields() {
        let mut raw = DEFAULT_PARA_CFG;
        raw[0] = 0x00; // ASCII mode
        raw[3..7].copy_from_slice(&9600u32.to_be_bytes());
        let mut cfg = ParamConfig::from_raw(raw);
        assert!(!cfg.is_target_config());

        cfg.set_mode(MODE_PROTOCOL_SOFTWARE);
        cfg.set_baudrate(TARGET_BAUD);
        assert!(cfg.is_target_config());
        // Everything outside mode and baud must be untouched
        assert_eq!(cfg.as_bytes()[1..3], DEFAULT_PARA_CFG[1..3]);
        assert_eq!(cfg.as_bytes()[7..], DEFAULT_PARA_CFG[7..]);
    }

    #[test]
    fn test_param_config_parse_from_reply() {
        let frame = build_frame(DEFAULT_ADDR, CMD_GET_PARA_CFG | 0x80, &DEFAULT_PARA_CFG);
        let cfg = ParamConfig::parse(&frame).unwrap();
        assert_eq!(cfg.as_bytes(), &DEFAULT_PARA_CFG);
    }

    #[test]
    fn test_keyboard_report_layout() {
        let report = keyboard_report(MOD_LEFT_SHIFT, &[0x04, 0x05]);
        assert_eq!(report, [0x02, 0x00, 0x04, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_keyboard_report_truncates_to_six_keys() {
        let report = keyboard_report(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(report[2..], [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_mouse_relative_clamps() {
        let payload = encode_mouse_relative(0x01, 200, -200, 0);
        assert_eq!(payload, [0x01, 127, 0x81, 0]);
        assert_eq!(payload[2] as i8, -127);
    }

    #[test]
    fn test_mouse_relative_negative_encoding() {
        let payload = encode_mouse_relative(0, -1, -10, -3);
        assert_eq!(payload[1] as i8, -1);
        assert_eq!(payload[2] as i8, -10);
        assert_eq!(payload[3] as i8, -3);
    }

    #[test]
    fn test_mouse_absolute_clamps_and_little_endian() {
        let payload = encode_mouse_absolute(0, 40000, -5, 0);
        assert_eq!(payload, [0, 0xFF, 0x7F, 0x00, 0x00, 0]);

        let payload = encode_mouse_absolute(0x02, 960, 540, 1);
        assert_eq!(u16::from_le_bytes([payload[1], payload[2]]), 960);
        assert_eq!(u16::from_le_bytes([payload[3], payload[4]]), 540);
    }
}
