//! Serial device discovery
//!
//! This module provides:
//! - [`DeviceDescriptor`], the per-pass snapshot of one serial port
//! - [`DeviceDirectory`], which enumerates ports and probes them concurrently
//! - the [`SerialBackend`] / [`SerialLink`] seam over the `serialport` crate
//!

mod descriptor;
mod directory;
pub mod serial;

pub use descriptor::{DeviceDescriptor, Field, FieldValue};
pub(crate) use directory::is_quiet;
pub use directory::{probe_identity, DeviceDirectory, Discovery};
pub use serial::{PortListing, SerialBackend, SerialLink, SystemSerial, UsbMetadata};
