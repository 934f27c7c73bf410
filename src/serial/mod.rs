pub mod backend;
pub mod protocol;
pub mod reader;
pub mod scanner;
pub mod sim;

pub use backend::{NativeBackend, SerialBackend, SerialTransport};
pub use protocol::{BatteryReport, DeviceProtocolClient, DisplayMode, ProtocolTimeouts};
pub use reader::{LineReader, ResponseMatcher};
pub use scanner::PortScanner;

use serde::{Deserialize, Serialize};

// PadAwan Force hardware identifiers (Unexpected Maker FeatherS3, ESP32-S3 native USB)
pub const PADAWAN_VID: u16 = 0x303A;
pub const PADAWAN_PID: u16 = 0x80D7;
pub const BAUD_RATE: u32 = 115200;

/// One enumerated serial interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl SerialDeviceInfo {
    /// A port with no USB identity metadata.
    pub fn bare(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }

    /// A USB port with the given vendor/product identity.
    pub fn usb(port_name: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            vid: Some(vid),
            pid: Some(pid),
            ..Self::bare(port_name)
        }
    }
}

/// USB identity used to narrow port discovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VendorProductFilter {
    pub vid: u16,
    pub pid: u16,
}

impl VendorProductFilter {
    pub fn matches(&self, info: &SerialDeviceInfo) -> bool {
        info.vid == Some(self.vid) && info.pid == Some(self.pid)
    }
}

impl Default for VendorProductFilter {
    fn default() -> Self {
        Self {
            vid: PADAWAN_VID,
            pid: PADAWAN_PID,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Communication timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Port unavailable: {0}")]
    PortUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    Serialport(#[from] serialport::Error),
}

impl SerialError {
    /// Timeouts are expected on a flaky link and never tear the connection down.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SerialError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
