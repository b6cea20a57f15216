use super::descriptor::DeviceDescriptor;
use super::serial::{PortListing, SerialBackend, SerialLink};
use crate::config::ProbeSettings;
use crate::error::{BridgeError, Result};
use crate::identity::{self, ByteSource, MidiIdentity};
use crossbeam::channel::{bounded, Receiver};
use log::{debug, error, info, warn};
use std::io::ErrorKind;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Enumerates serial ports and probes each one for exclusivity and identity.
pub struct DeviceDirectory<B: SerialBackend> {
    backend: Arc<B>,
    settings: ProbeSettings,
}

impl<B: SerialBackend> DeviceDirectory<B> {
    pub fn new(backend: Arc<B>, settings: ProbeSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Runs one enumeration pass.
    ///
    /// All ports are probed concurrently as soon as this is called; the
    /// returned iterator yields descriptors in enumeration order as their
    /// probes complete and ends after the last port.
    pub fn discover(&self) -> Discovery {
        let listings = self.backend.list_ports();
        debug!("Enumerated {} serial port(s)", listings.len());

        let pending: Vec<PendingProbe> = listings
            .into_iter()
            .map(|listing| self.spawn_probe(listing))
            .collect();

        Discovery {
            pending: pending.into_iter(),
        }
    }

    fn spawn_probe(&self, listing: PortListing) -> PendingProbe {
        let (tx, rx) = bounded(1);
        let backend = Arc::clone(&self.backend);
        let settings = self.settings.clone();
        let probe_listing = listing.clone();

        let spawned = thread::Builder::new()
            .name(format!("probe {}", listing.path))
            .spawn(move || {
                let descriptor = probe_port(backend.as_ref(), probe_listing, &settings);
                let _ = tx.send(descriptor);
            });
        if let Err(e) = spawned {
            error!("Could not start probe thread for {}: {}", listing.path, e);
        }

        PendingProbe { listing, rx }
    }
}

struct PendingProbe {
    listing: PortListing,
    rx: Receiver<DeviceDescriptor>,
}

/// Descriptors of one discovery pass, in enumeration order.
pub struct Discovery {
    pending: std::vec::IntoIter<PendingProbe>,
}

impl Iterator for Discovery {
    type Item = DeviceDescriptor;

    fn next(&mut self) -> Option<DeviceDescriptor> {
        let probe = self.pending.next()?;
        match probe.rx.recv() {
            Ok(descriptor) => Some(descriptor),
            Err(_) => {
                // The probe thread died before reporting.
                error!(
                    "Probe of {} ended without a result, treating it as unavailable",
                    probe.listing.path
                );
                Some(descriptor_from(&probe.listing))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.pending.size_hint()
    }
}

fn descriptor_from(listing: &PortListing) -> DeviceDescriptor {
    let mut descriptor = DeviceDescriptor::bare(listing.path.clone());
    if let Some(usb) = &listing.usb {
        descriptor.usb_vendor_id = Some(usb.vendor_id);
        descriptor.usb_product_id = Some(usb.product_id);
        descriptor.usb_location = usb.location.clone();
        descriptor.usb_manufacturer = usb.manufacturer.clone();
        descriptor.usb_description = usb.description.clone();
        descriptor.usb_serial_number = usb.serial_number.clone();
    }
    descriptor
}

fn probe_port<B: SerialBackend + ?Sized>(
    backend: &B,
    listing: PortListing,
    settings: &ProbeSettings,
) -> DeviceDescriptor {
    let mut descriptor = descriptor_from(&listing);
    let path = listing.path.as_str();

    descriptor.is_exclusive_available = probe_exclusive(backend, path, settings);

    if settings.identify {
        descriptor.identity = match probe_identity(backend, path, settings) {
            Ok(Some(identity)) => {
                info!("{} identified as {}", path, identity);
                Some(identity)
            }
            Ok(None) => {
                debug!("{} did not answer the identity request", path);
                None
            }
            Err(e) if e.is_unavailable() => {
                debug!("Identity probe skipped for {}: {}", path, e);
                None
            }
            Err(e) => {
                warn!("Identity probe of {} failed: {}", path, e);
                None
            }
        };
    }

    descriptor
}

fn probe_exclusive<B: SerialBackend + ?Sized>(
    backend: &B,
    path: &str,
    settings: &ProbeSettings,
) -> bool {
    match backend.open_exclusive(path, settings.probe_baud_rate, settings.open_timeout) {
        Ok(link) => {
            drop(link);
            true
        }
        Err(e) => {
            debug!("{} is not exclusively available: {}", path, e);
            false
        }
    }
}

/// Opens `path`, listens for an unprompted announcement, then sends the
/// Device Inquiry and waits for the reply. The port is closed on return.
pub fn probe_identity<B: SerialBackend + ?Sized>(
    backend: &B,
    path: &str,
    settings: &ProbeSettings,
) -> Result<Option<MidiIdentity>> {
    let mut link = backend.open_exclusive(path, settings.probe_baud_rate, settings.open_timeout)?;
    let started = Instant::now();
    let mut source = LinkByteSource {
        link: link.as_mut(),
        path,
    };

    // Some firmware announces itself once it has booted. An announcement
    // already under way when the listen window closes may finish later.
    let listen = settings.listen_window.min(settings.reply_timeout);
    if let Some(identity) =
        identity::decode_reply_within(&mut source, listen, settings.reply_timeout)?
    {
        return Ok(Some(identity));
    }

    source
        .link
        .write_all(&identity::encode_request())
        .and_then(|_| source.link.flush())
        .map_err(|e| BridgeError::io(path, "identity request", e))?;
    debug!("Sent identity request to {}", path);

    let remaining = settings.reply_timeout.saturating_sub(started.elapsed());
    identity::decode_reply(&mut source, remaining)
}

struct LinkByteSource<'a> {
    link: &'a mut dyn SerialLink,
    path: &'a str,
}

impl ByteSource for LinkByteSource<'_> {
    fn next_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.link.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if is_quiet(e.kind()) => Ok(None),
            Err(e) => Err(BridgeError::io(self.path, "identity read", e)),
        }
    }
}

/// Read outcomes that only mean "nothing arrived yet".
pub(crate) fn is_quiet(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSerialBackend;
    use std::time::Duration;

    const REPLY: [u8; 15] = [
        0xF0, 0x7E, 0x00, 0x06, 0x02, 0x41, 0x00, 0x01, 0x00, 0x02, 0x01, 0x00, 0x00, 0x01, 0xF7,
    ];

    fn fast_settings() -> ProbeSettings {
        ProbeSettings {
            identify: true,
            open_timeout: Duration::from_millis(5),
            listen_window: Duration::from_millis(30),
            reply_timeout: Duration::from_millis(120),
            ..ProbeSettings::default()
        }
    }

    #[test]
    fn test_discover_yields_in_enumeration_order() {
        let backend = Arc::new(MockSerialBackend::new());
        backend.add_port("/dev/ttyACM0");
        backend.add_port("/dev/ttyACM1");
        backend.add_port("/dev/ttyACM2");
        let settings = ProbeSettings {
            identify: false,
            ..fast_settings()
        };

        let directory = DeviceDirectory::new(Arc::clone(&backend), settings);
        let paths: Vec<String> = directory.discover().map(|d| d.device_path).collect();
        assert_eq!(paths, vec!["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyACM2"]);
    }

    #[test]
    fn test_busy_port_is_not_exclusive_and_scan_continues() {
        let backend = Arc::new(MockSerialBackend::new());
        let busy = backend.add_port("/dev/ttyUSB0");
        busy.set_busy(true);
        backend.add_port("/dev/ttyUSB1");

        let directory = DeviceDirectory::new(Arc::clone(&backend), fast_settings());
        let found: Vec<DeviceDescriptor> = directory.discover().collect();
        assert_eq!(found.len(), 2);
        assert!(!found[0].is_exclusive_available);
        assert!(found[0].identity.is_none());
        assert!(found[1].is_exclusive_available);
    }

    #[test]
    fn test_identity_probe_sends_request_and_decodes_reply() {
        let backend = Arc::new(MockSerialBackend::new());
        let port = backend.add_port("/dev/ttyACM0");
        port.reply_to_inquiry(&REPLY);

        let identity = probe_identity(backend.as_ref(), "/dev/ttyACM0", &fast_settings())
            .unwrap()
            .expect("identity");
        assert_eq!(identity.manufacturer_id, 0x41);
        assert_eq!(port.written(), identity::encode_request().to_vec());
        assert_eq!(port.open_handles(), 0);
    }

    #[test]
    fn test_unprompted_announcement_skips_request() {
        let backend = Arc::new(MockSerialBackend::new());
        let port = backend.add_port("/dev/ttyACM0");
        port.push_read(&REPLY);

        let identity = probe_identity(backend.as_ref(), "/dev/ttyACM0", &fast_settings()).unwrap();
        assert!(identity.is_some());
        assert!(port.written().is_empty());
    }

    #[test]
    fn test_announcement_straddling_listen_window_is_kept() {
        let backend = Arc::new(MockSerialBackend::new());
        let port = backend.add_port("/dev/ttyACM0");
        let settings = ProbeSettings {
            listen_window: Duration::from_millis(100),
            reply_timeout: Duration::from_millis(1000),
            ..fast_settings()
        };

        let feeder = {
            let port = port.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(80));
                port.push_read(&REPLY[..7]);
                std::thread::sleep(Duration::from_millis(40));
                port.push_read(&REPLY[7..]);
            })
        };

        let identity = probe_identity(backend.as_ref(), "/dev/ttyACM0", &settings)
            .unwrap()
            .expect("identity");
        feeder.join().unwrap();
        assert_eq!(identity.model_number, [0, 2]);
        assert!(port.written().is_empty());
    }

    #[test]
    fn test_malformed_reply_yields_no_identity() {
        let backend = Arc::new(MockSerialBackend::new());
        let port = backend.add_port("/dev/ttyACM0");
        let mut reply = REPLY;
        reply[3] = 0x07;
        port.reply_to_inquiry(&reply);

        let result = probe_identity(backend.as_ref(), "/dev/ttyACM0", &fast_settings());
        assert!(matches!(result, Err(BridgeError::ProtocolViolation(_))));

        let directory = DeviceDirectory::new(Arc::clone(&backend), fast_settings());
        let found: Vec<DeviceDescriptor> = directory.discover().collect();
        assert!(found[0].identity.is_none());
        assert_eq!(port.open_handles(), 0);
    }

    #[test]
    fn test_usb_metadata_is_copied() {
        let backend = Arc::new(MockSerialBackend::new());
        backend.add_usb_port("/dev/ttyACM0", 0x2341, 0x8036, Some("Arduino LLC"));
        let settings = ProbeSettings {
            identify: false,
            ..fast_settings()
        };

        let directory = DeviceDirectory::new(backend, settings);
        let d = directory.discover().next().expect("descriptor");
        assert_eq!(d.usb_vendor_id, Some(0x2341));
        assert_eq!(d.usb_product_id, Some(0x8036));
        assert_eq!(d.usb_manufacturer.as_deref(), Some("Arduino LLC"));
    }
}
