//! Device discovery, correlation and input bridging for KVM-over-USB
//! adapters.
//!
//! The adapter is a composite usb device: a CH9329 keyboard/mouse bridge
//! behind a CH340 usb-serial converter, plus HID, video capture and audio
//! capture interfaces, all hanging off one physical socket. The `device`
//! module walks the platform usb topology to find every interface of one
//! adapter and groups them by physical location, so a host with several
//! adapters can tell them apart. The `serial` module speaks the CH9329
//! framed protocol and injects keyboard and mouse input into the target
//! machine.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//! use usbkvm_bridge::device::{create_device_manager, DiscoveryFilter};
//! use usbkvm_bridge::serial::{Keyboard, SerialTransport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = create_device_manager(DiscoveryFilter::default())?;
//! let devices = manager.discover_devices()?;
//! let port = devices[0]
//!     .serial_port_path
//!     .clone()
//!     .ok_or("adapter has no serial interface")?;
//!
//! let mut transport = SerialTransport::new(port);
//! transport.connect()?;
//! let transport = Arc::new(Mutex::new(transport));
//!
//! let keyboard = Keyboard::new(transport);
//! keyboard.send_text("hello\n").await?;
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod serial;

pub use device::{
    create_device_manager, DeviceInfo, DeviceKey, DeviceSelector, DeviceSnapshot, DiscoveryFilter,
    DeviceChangeEvent, HotplugMonitor, SnapshotDiff,
};
pub use serial::{
    ChipInfo, ConnectionEvent, ConnectionState, Keyboard, Mouse, MouseButton, ParamConfig,
    SerialTransport, StatusCode,
};
