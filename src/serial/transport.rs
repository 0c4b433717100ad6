use std::io::Read;
use std::io::Write;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity, SerialPort, SerialPortType, StopBits};
use tokio::time::sleep;

use super::{Result, SerialError, SerialPortInfo};
use crate::serial::protocol::{self, ChipInfo, ParamConfig};

/// Substrings that identify CH340-family usb-serial adapters, the usual
/// front end of a CH9329 bridge.
const CH340_MARKERS: &[&str] = &["ch340", "ch341", "ch9329", "1a86"];

/// Connection lifecycle of the bridge transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Closed,
    Opening,
    ConfigVerifying,
    Reconfiguring,
    Ready,
}

/// Notifications fired on connection lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(String),
    Disconnected(String),
    RecoveryAttempt(String),
}

/// Tunables for open retries and exchange timing.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub open_retries: u32,
    pub retry_backoff: Duration,
    /// Per-read timeout on the underlying port.
    pub read_timeout: Duration,
    /// Total window for accumulating one reply frame.
    pub exchange_timeout: Duration,
    /// Pause between write and first read attempt.
    pub settle_delay: Duration,
    /// Pause after a chip RESET before reopening the port.
    pub reset_settle: Duration,
    /// Optional pause after every queued command.
    pub command_delay: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            open_retries: 3,
            retry_backoff: Duration::from_millis(500),
            read_timeout: Duration::from_millis(100),
            exchange_timeout: Duration::from_millis(500),
            settle_delay: Duration::from_millis(20),
            reset_settle: Duration::from_millis(500),
            command_delay: None,
        }
    }
}

type EventCallback = Box<dyn Fn(ConnectionEvent) + Send>;

/// Opens a port by name at a given baud rate with a per-read timeout.
/// The transport goes through this for every open and reopen, so a
/// non-OS backend (simulator, loopback rig) can be swapped in.
pub type PortOpener =
    Box<dyn FnMut(&str, u32, Duration) -> serialport::Result<Box<dyn SerialPort>> + Send>;

fn os_port_opener() -> PortOpener {
    Box::new(|name, baud, timeout| {
        serialport::new(name, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(timeout)
            .open()
    })
}

/// Serial transport to a CH9329 bridge chip.
///
/// Owns the port handle and drives the connection state machine:
/// open at the operating baud rate, verify the chip's parameter block,
/// reconfigure or recover at the factory baud rate when verification
/// fails, and only then report `Ready`.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    port_name: String,
    state: ConnectionState,
    config: TransportConfig,
    chip_info: Option<ChipInfo>,
    event_callback: Option<EventCallback>,
    opener: PortOpener,
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self::with_config(port_name, TransportConfig::default())
    }

    pub fn with_config(port_name: impl Into<String>, config: TransportConfig) -> Self {
        Self::with_port_opener(port_name, config, os_port_opener())
    }

    /// Transport over a caller-supplied port backend instead of the OS
    /// serial stack.
    pub fn with_port_opener(
        port_name: impl Into<String>,
        config: TransportConfig,
        opener: PortOpener,
    ) -> Self {
        Self {
            port: None,
            port_name: port_name.into(),
            state: ConnectionState::Closed,
            config,
            chip_info: None,
            event_callback: None,
            opener,
        }
    }

    /// Register a hook fired on connection lifecycle transitions.
    pub fn set_event_callback<F>(&mut self, callback: F)
    where
        F: Fn(ConnectionEvent) + Send + 'static,
    {
        self.event_callback = Some(Box::new(callback));
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Chip identity cached by the last successful GET_INFO.
    pub fn chip_info(&self) -> Option<ChipInfo> {
        self.chip_info
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(callback) = &self.event_callback {
            callback(event);
        }
    }

    /// List serial ports whose usb identity looks like a CH340-family
    /// adapter. Best effort; ports without usb metadata are skipped.
    pub fn likely_bridge_ports() -> Result<Vec<SerialPortInfo>> {
        let ports = serialport::available_ports()?;
        let mut candidates = Vec::new();

        for port in ports {
            if let SerialPortType::UsbPort(usb) = port.port_type {
                let mut haystack = format!("{:04x}:{:04x}", usb.vid, usb.pid);
                if let Some(product) = &usb.product {
                    haystack.push(' ');
                    haystack.push_str(&product.to_lowercase());
                }
                if let Some(manufacturer) = &usb.manufacturer {
                    haystack.push(' ');
                    haystack.push_str(&manufacturer.to_lowercase());
                }
                if CH340_MARKERS.iter().any(|m| haystack.contains(m)) {
                    candidates.push(SerialPortInfo {
                        port_name: port.port_name,
                        vid: usb.vid,
                        pid: usb.pid,
                        serial_number: usb.serial_number,
                        manufacturer: usb.manufacturer,
                        product: usb.product,
                    });
                }
            }
        }

        log::debug!("Found {} likely bridge port(s)", candidates.len());
        Ok(candidates)
    }

    /// Drive the state machine until `Ready` or a hard failure. On
    /// failure the port is released and the state returns to `Closed`.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        self.open_with_retries(protocol::TARGET_BAUD)?;
        self.state = ConnectionState::ConfigVerifying;

        match self.verify_or_recover() {
            Ok(()) => self.finish_connect(),
            Err(err) => {
                log::warn!("Giving up on {}: {}", self.port_name, err);
                self.close();
                Err(err)
            }
        }
    }

    fn verify_or_recover(&mut self) -> Result<()> {
        match self.read_param_config() {
            Ok(cfg) if cfg.is_target_config() => Ok(()),
            Ok(cfg) => {
                // The chip answered but is misconfigured. Rewrite mode and
                // baud in place, keeping the other fields untouched.
                log::info!(
                    "Chip on {} at baud {} mode 0x{:02X}, reconfiguring",
                    self.port_name,
                    cfg.baudrate(),
                    cfg.mode()
                );
                self.reconfigure(cfg)
            }
            Err(err) => {
                // No intelligible reply at the operating baud rate. Assume
                // factory settings and recover at 9600.
                log::warn!(
                    "No valid config reply from {} ({}), attempting factory recovery",
                    self.port_name,
                    err
                );
                self.recover()
            }
        }
    }

    fn finish_connect(&mut self) -> Result<()> {
        self.state = ConnectionState::Ready;
        // Prime the cached chip state; not fatal if the chip stays quiet.
        match self.query_info() {
            Ok(info) => {
                log::info!(
                    "Connected to {} (chip version {}, target {})",
                    self.port_name,
                    info.version,
                    if info.target_connected {
                        "connected"
                    } else {
                        "absent"
                    }
                );
            }
            Err(err) => {
                log::warn!("Connected to {} but GET_INFO failed: {}", self.port_name, err);
            }
        }
        self.emit(ConnectionEvent::Connected(self.port_name.clone()));
        Ok(())
    }

    /// Close the port and drop cached chip state. Fires `Disconnected`
    /// only when the transport had actually reached `Ready`.
    pub fn close(&mut self) {
        let was_ready = self.is_ready();
        if self.port.take().is_some() {
            log::info!("Closed {}", self.port_name);
            if was_ready {
                self.emit(ConnectionEvent::Disconnected(self.port_name.clone()));
            }
        }
        self.state = ConnectionState::Closed;
        self.chip_info = None;
    }

    fn open_with_retries(&mut self, baud: u32) -> Result<()> {
        self.state = ConnectionState::Opening;
        let mut last_err: Option<serialport::Error> = None;

        for attempt in 1..=self.config.open_retries {
            match self.open_port(baud) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::warn!(
                        "Open attempt {}/{} on {} failed: {}",
                        attempt,
                        self.config.open_retries,
                        self.port_name,
                        err
                    );
                    last_err = Some(err);
                    if attempt < self.config.open_retries {
                        std::thread::sleep(self.config.retry_backoff);
                    }
                }
            }
        }

        self.state = ConnectionState::Closed;
        Err(match last_err {
            Some(err) => SerialError::SerialportError(err),
            None => SerialError::ConnectionFailed(self.port_name.clone()),
        })
    }

    fn open_port(&mut self, baud: u32) -> std::result::Result<(), serialport::Error> {
        let mut port = (self.opener)(&self.port_name, baud, self.config.read_timeout)?;

        // The adapter wires RTS to the chip reset line; hold it low so the
        // chip stays out of reset.
        port.write_request_to_send(false)?;

        self.port = Some(port);
        log::debug!("Opened {} at {} baud", self.port_name, baud);
        Ok(())
    }

    fn reopen(&mut self, baud: u32) -> Result<()> {
        self.port = None;
        std::thread::sleep(self.config.reset_settle);
        self.open_with_retries(baud)
    }

    /// Rewrite mode and baud rate in the chip's parameter block, reset the
    /// chip, and verify once at the operating baud rate.
    fn reconfigure(&mut self, mut cfg: ParamConfig) -> Result<()> {
        self.state = ConnectionState::Reconfiguring;
        cfg.set_mode(protocol::MODE_PROTOCOL_SOFTWARE);
        cfg.set_baudrate(protocol::TARGET_BAUD);

        self.write_param_config(&cfg)?;
        self.send_reset()?;
        self.reopen(protocol::TARGET_BAUD)?;
        self.state = ConnectionState::ConfigVerifying;

        let verified = self.read_param_config()?;
        if !verified.is_target_config() {
            return Err(SerialError::ConfigurationError(format!(
                "chip still at baud {} mode 0x{:02X} after reconfiguration",
                verified.baudrate(),
                verified.mode()
            )));
        }
        Ok(())
    }

    /// Recovery at the factory baud rate: restore defaults first, then push
    /// a full parameter block with the operating mode and baud.
    fn recover(&mut self) -> Result<()> {
        self.state = ConnectionState::Reconfiguring;
        self.emit(ConnectionEvent::RecoveryAttempt(self.port_name.clone()));
        self.reopen(protocol::FACTORY_BAUD)?;
        self.state = ConnectionState::Reconfiguring;

        if let Err(err) = self.send_set_default_cfg() {
            log::warn!("SET_DEFAULT_CFG during recovery failed: {}", err);
        }

        // Prefer the chip's own block so usb identity and timing survive;
        // fall back to the factory block when it cannot be read.
        let mut cfg = self.read_param_config().unwrap_or_default();
        cfg.set_mode(protocol::MODE_PROTOCOL_SOFTWARE);
        cfg.set_baudrate(protocol::TARGET_BAUD);
        self.write_param_config(&cfg)?;
        self.send_reset()?;

        self.reopen(protocol::TARGET_BAUD)?;
        self.state = ConnectionState::ConfigVerifying;

        let verified = self.read_param_config()?;
        if !verified.is_target_config() {
            return Err(SerialError::ConfigurationError(
                "recovery left chip misconfigured".to_string(),
            ));
        }
        Ok(())
    }

    /// One synchronous command exchange. Returns the raw reply frame, or an
    /// empty buffer when no well-formed frame arrived inside the window.
    pub fn exchange(&mut self, cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
        let frame = protocol::build_frame(protocol::DEFAULT_ADDR, cmd, data);
        let port = self.port.as_mut().ok_or(SerialError::NotConnected)?;

        port.write_all(&frame)?;
        port.flush()?;
        std::thread::sleep(self.config.settle_delay);

        let mut buf: Vec<u8> = Vec::new();
        let deadline = Instant::now() + self.config.exchange_timeout;
        let mut chunk = [0u8; 64];

        while Instant::now() < deadline {
            match port.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => return Err(SerialError::IoError(err)),
            }
            if let Some(frame) = extract_frame(&buf) {
                return Ok(frame.to_vec());
            }
        }

        if !buf.is_empty() {
            log::warn!(
                "Discarding unframed reply to 0x{:02X}: {}",
                cmd,
                hex::encode(&buf)
            );
        }
        Ok(Vec::new())
    }

    /// Fire-and-check exchange for commands that answer with a status byte.
    fn exchange_status(&mut self, cmd: u8, data: &[u8], what: &'static str) -> Result<()> {
        let reply = self.exchange(cmd, data)?;
        if reply.is_empty() {
            return Err(SerialError::Timeout);
        }
        match protocol::parse_status_reply(&reply, cmd) {
            Some(status) if status.is_success() => Ok(()),
            Some(status) => {
                protocol::log_status(status, &reply);
                Err(SerialError::CommandRejected(what))
            }
            None => Err(SerialError::ProtocolError(format!(
                "unexpected reply to 0x{:02X}: {}",
                cmd,
                hex::encode(&reply)
            ))),
        }
    }

    /// Queue an input report, optionally pacing consecutive commands.
    pub async fn send_async(&mut self, cmd: u8, data: &[u8]) -> Result<()> {
        if !self.is_ready() {
            return Err(SerialError::NotConnected);
        }
        let frame = protocol::build_frame(protocol::DEFAULT_ADDR, cmd, data);
        let port = self.port.as_mut().ok_or(SerialError::NotConnected)?;
        port.write_all(&frame)?;
        port.flush()?;
        if let Some(delay) = self.config.command_delay {
            sleep(delay).await;
        }
        Ok(())
    }

    fn read_param_config(&mut self) -> Result<ParamConfig> {
        let reply = self.exchange(protocol::CMD_GET_PARA_CFG, &[])?;
        if reply.is_empty() {
            return Err(SerialError::Timeout);
        }
        ParamConfig::parse(&reply)
    }

    fn write_param_config(&mut self, cfg: &ParamConfig) -> Result<()> {
        self.exchange_status(protocol::CMD_SET_PARA_CFG, cfg.as_bytes(), "SET_PARA_CFG")
    }

    fn send_set_default_cfg(&mut self) -> Result<()> {
        self.exchange_status(protocol::CMD_SET_DEFAULT_CFG, &[], "SET_DEFAULT_CFG")
    }

    fn send_reset(&mut self) -> Result<()> {
        self.exchange_status(protocol::CMD_RESET, &[], "RESET")
    }

    fn query_info(&mut self) -> Result<ChipInfo> {
        let reply = self.exchange(protocol::CMD_GET_INFO, &[])?;
        if reply.is_empty() {
            return Err(SerialError::Timeout);
        }
        let info = ChipInfo::parse(&reply)
            .ok_or_else(|| SerialError::ProtocolError("malformed GET_INFO reply".to_string()))?;
        self.chip_info = Some(info);
        Ok(info)
    }

    /// Query chip state and refresh the cached `ChipInfo`.
    pub fn get_info(&mut self) -> Result<ChipInfo> {
        if !self.is_ready() {
            return Err(SerialError::NotConnected);
        }
        self.query_info()
    }

    /// Read the chip's parameter configuration block.
    pub fn get_param_config(&mut self) -> Result<ParamConfig> {
        if !self.is_ready() {
            return Err(SerialError::NotConnected);
        }
        self.read_param_config()
    }

    /// Send an 8-byte keyboard report.
    pub async fn send_keyboard_report(&mut self, report: [u8; 8]) -> Result<()> {
        self.send_async(protocol::CMD_SEND_KB_GENERAL_DATA, &report)
            .await
    }

    /// Send a relative mouse payload built by `encode_mouse_relative`.
    pub async fn send_mouse_relative(&mut self, payload: [u8; 4]) -> Result<()> {
        let mut data = [0u8; 5];
        data[0] = 0x01;
        data[1..].copy_from_slice(&payload);
        self.send_async(protocol::CMD_SEND_MS_REL_DATA, &data).await
    }

    /// Send an absolute mouse payload built by `encode_mouse_absolute`.
    pub async fn send_mouse_absolute(&mut self, payload: [u8; 6]) -> Result<()> {
        let mut data = [0u8; 7];
        data[0] = 0x02;
        data[1..].copy_from_slice(&payload);
        self.send_async(protocol::CMD_SEND_MS_ABS_DATA, &data).await
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Locate the first complete, checksum-valid frame in an accumulation
/// buffer, skipping any leading line noise.
fn extract_frame(buf: &[u8]) -> Option<&[u8]> {
    let mut start = 0;
    while start + protocol::MIN_FRAME_LEN <= buf.len() {
        if buf[start..start + 2] == protocol::FRAME_HEADER {
            let data_len = buf[start + 4] as usize;
            let end = start + protocol::MIN_FRAME_LEN + data_len;
            if end > buf.len() {
                // Frame still arriving
                return None;
            }
            let candidate = &buf[start..end];
            if protocol::verify_frame(candidate) {
                return Some(candidate);
            }
        }
        start += 1;
    }
    None
}
