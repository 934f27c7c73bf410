use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};

use super::{Result, SerialDeviceInfo, SerialError};

// Per-call OS budgets. Waiting for responses is done with deadline polling on top of these.
const READ_TIMEOUT: Duration = Duration::from_millis(3000);
const WRITE_TIMEOUT: Duration = Duration::from_millis(2000);

/// An open byte channel to one serial port.
///
/// Implementations must not block in `bytes_to_read`; the protocol layer polls it
/// between short sleeps and only calls `read` once data is known to be waiting.
pub trait SerialTransport: Send {
    fn port_name(&self) -> &str;
    fn write_all(&mut self, data: &[u8]) -> Result<()>;
    fn bytes_to_read(&mut self) -> Result<u32>;
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;
    fn clear_input(&mut self) -> Result<()>;
    fn set_dtr(&mut self, level: bool) -> Result<()>;
    fn set_rts(&mut self, level: bool) -> Result<()>;
}

/// Source of port enumeration and port handles.
pub trait SerialBackend: Send + Sync {
    fn available_ports(&self) -> Result<Vec<SerialDeviceInfo>>;
    fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialTransport>>;
}

/// Backend over the operating system's serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl NativeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl SerialBackend for NativeBackend {
    fn available_ports(&self) -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let mut devices = Vec::with_capacity(ports.len());

        for port in ports {
            let info = match port.port_type {
                SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: Some(usb_info.vid),
                    pid: Some(usb_info.pid),
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                },
                _ => SerialDeviceInfo::bare(port.port_name),
            };
            devices.push(info);
        }

        Ok(devices)
    }

    fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialTransport>> {
        let mut port = serialport::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| SerialError::PortUnavailable(format!("{}: {}", port_name, e)))?;

        // ESP32-S3 native USB only starts talking once DTR/RTS are asserted
        port.write_data_terminal_ready(true)?;
        port.write_request_to_send(true)?;

        log::debug!("Opened {} at {} baud", port_name, baud_rate);
        Ok(Box::new(NativePort {
            name: port_name.to_string(),
            port,
        }))
    }
}

struct NativePort {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialTransport for NativePort {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let deadline = std::time::Instant::now() + WRITE_TIMEOUT;
        let mut written = 0;
        while written < data.len() {
            match self.port.write(&data[written..]) {
                Ok(n) => written += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if std::time::Instant::now() >= deadline {
                        return Err(SerialError::Timeout);
                    }
                }
                Err(e) => return Err(SerialError::Io(e)),
            }
        }
        self.port.flush()?;
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(self.port.bytes_to_read()?)
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(SerialError::Io(e)),
        }
    }

    fn clear_input(&mut self) -> Result<()> {
        Ok(self.port.clear(ClearBuffer::Input)?)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        Ok(self.port.write_data_terminal_ready(level)?)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        Ok(self.port.write_request_to_send(level)?)
    }
}
