pub mod keyboard;
pub mod mouse;
pub mod protocol;
pub mod transport;

pub use keyboard::Keyboard;
pub use mouse::{Mouse, MouseButton};
pub use protocol::{ChipInfo, ParamConfig, StatusCode};
pub use transport::{
    ConnectionEvent, ConnectionState, PortOpener, SerialTransport, TransportConfig,
};

use serde::{Deserialize, Serialize};

/// Identity of a serial port as reported by the OS enumerator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Communication timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Device rejected command: {0}")]
    CommandRejected(&'static str),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
