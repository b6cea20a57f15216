//! Serial transport seam: port enumeration and exclusive opening.
//!
//! [`SystemSerial`] is backed by the `serialport` crate; tests substitute
//! [`crate::mock::MockSerialBackend`].

use crate::error::{BridgeError, Result};
use log::{debug, warn};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::io::{self, Read, Write};
use std::time::Duration;

/// USB metadata attached to an enumerated port, when the OS reports any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbMetadata {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub description: Option<String>,
    pub serial_number: Option<String>,
    pub location: Option<String>,
}

/// One port as reported by OS enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortListing {
    pub path: String,
    pub usb: Option<UsbMetadata>,
}

/// An open serial handle.
///
/// Clones refer to the same underlying device so that reads and writes can
/// proceed from different threads without sharing a lock. The device is
/// released once the last clone is dropped.
pub trait SerialLink: Read + Write + Send {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>>;
}

pub trait SerialBackend: Send + Sync + 'static {
    /// Lists visible ports. Never fails as a whole.
    fn list_ports(&self) -> Vec<PortListing>;

    /// Opens `path` so that no other process can hold it at the same time.
    fn open_exclusive(
        &self,
        path: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialLink>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerial;

impl SystemSerial {
    pub fn new() -> Self {
        SystemSerial
    }
}

impl SerialBackend for SystemSerial {
    fn list_ports(&self) -> Vec<PortListing> {
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(listing_from).collect(),
            Err(e) => {
                warn!("Failed to enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }

    fn open_exclusive(
        &self,
        path: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialLink>> {
        let builder = serialport::new(path, baud_rate).timeout(read_timeout);

        #[cfg(unix)]
        let port: Box<dyn SerialPort> = {
            let mut port = builder.open_native().map_err(|e| open_error(path, e))?;
            port.set_exclusive(true).map_err(|e| open_error(path, e))?;
            Box::new(port)
        };

        // Windows COM ports are exclusive by construction.
        #[cfg(not(unix))]
        let port: Box<dyn SerialPort> = builder.open().map_err(|e| open_error(path, e))?;

        debug!("Opened {} exclusively at {} baud", path, baud_rate);
        Ok(Box::new(SystemLink(port)))
    }
}

fn open_error(path: &str, e: serialport::Error) -> BridgeError {
    match e.kind() {
        serialport::ErrorKind::InvalidInput => BridgeError::Serial {
            path: path.to_string(),
            reason: e.to_string(),
        },
        _ => BridgeError::DeviceUnavailable {
            path: path.to_string(),
            reason: e.to_string(),
        },
    }
}

fn listing_from(info: SerialPortInfo) -> PortListing {
    let usb = match info.port_type {
        SerialPortType::UsbPort(usb) => Some(UsbMetadata {
            vendor_id: usb.vid,
            product_id: usb.pid,
            manufacturer: usb.manufacturer,
            description: usb.product,
            serial_number: usb.serial_number,
            location: usb_location(&info.port_name),
        }),
        _ => None,
    };
    PortListing {
        path: info.port_name,
        usb,
    }
}

/// Topological USB location (`1-1.2:1.0`) read from sysfs.
#[cfg(target_os = "linux")]
fn usb_location(path: &str) -> Option<String> {
    let name = std::path::Path::new(path).file_name()?.to_str()?;
    let device = std::fs::canonicalize(format!("/sys/class/tty/{}/device", name)).ok()?;
    device.ancestors().find_map(|dir| {
        let component = dir.file_name()?.to_str()?;
        if component.contains('-') && component.contains(':') {
            Some(component.to_string())
        } else {
            None
        }
    })
}

#[cfg(not(target_os = "linux"))]
fn usb_location(_path: &str) -> Option<String> {
    None
}

struct SystemLink(Box<dyn SerialPort>);

impl Read for SystemLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for SystemLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl SerialLink for SystemLink {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        let clone = self.0.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(SystemLink(clone)))
    }
}
