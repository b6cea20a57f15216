//! In-memory stand-ins for the serial backend and the virtual MIDI ports.
//!
//! Used by the test suites to drive discovery and the bridge engine without
//! hardware or a host MIDI subsystem.

use crate::bridge::VirtualMidiPorts;
use crate::discovery::{PortListing, SerialBackend, SerialLink, UsbMetadata};
use crate::error::{BridgeError, Result};
use crate::identity;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// How long an idle mock read blocks before reporting a timeout.
const IDLE_READ: Duration = Duration::from_millis(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
enum MockRead {
    Bytes(Vec<u8>),
    Error(io::ErrorKind),
}

#[derive(Debug, Default)]
struct PortState {
    absent: AtomicBool,
    busy: AtomicBool,
    fail_writes: AtomicBool,
    open_handles: AtomicUsize,
    total_opens: AtomicUsize,
    reads: Mutex<VecDeque<MockRead>>,
    written: Mutex<Vec<u8>>,
    inquiry_reply: Mutex<Option<Vec<u8>>>,
}

/// Test handle on one mock port.
#[derive(Debug, Clone)]
pub struct MockPort {
    listing: PortListing,
    state: Arc<PortState>,
}

impl MockPort {
    pub fn path(&self) -> &str {
        &self.listing.path
    }

    /// Unplugs (or replugs) the device. Open handles start failing.
    pub fn set_present(&self, present: bool) {
        self.state.absent.store(!present, Ordering::SeqCst);
    }

    /// Simulates another process holding the port.
    pub fn set_busy(&self, busy: bool) {
        self.state.busy.store(busy, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Queues bytes to be returned by the next reads.
    pub fn push_read(&self, bytes: &[u8]) {
        lock(&self.state.reads).push_back(MockRead::Bytes(bytes.to_vec()));
    }

    /// Queues a read failure.
    pub fn push_read_error(&self, kind: io::ErrorKind) {
        lock(&self.state.reads).push_back(MockRead::Error(kind));
    }

    /// Answers every Device Inquiry written to the port with `reply`.
    pub fn reply_to_inquiry(&self, reply: &[u8]) {
        *lock(&self.state.inquiry_reply) = Some(reply.to_vec());
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.state.written).clone()
    }

    /// Handles currently open (clones of one open count once).
    pub fn open_handles(&self) -> usize {
        self.state.open_handles.load(Ordering::SeqCst)
    }

    pub fn total_opens(&self) -> usize {
        self.state.total_opens.load(Ordering::SeqCst)
    }
}

/// Serial backend over a fixed, test-controlled set of ports.
#[derive(Debug, Default)]
pub struct MockSerialBackend {
    ports: Mutex<Vec<MockPort>>,
    list_calls: AtomicUsize,
}

impl MockSerialBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&self, path: &str) -> MockPort {
        self.insert(PortListing {
            path: path.to_string(),
            usb: None,
        })
    }

    pub fn add_usb_port(
        &self,
        path: &str,
        vendor_id: u16,
        product_id: u16,
        manufacturer: Option<&str>,
    ) -> MockPort {
        self.insert(PortListing {
            path: path.to_string(),
            usb: Some(UsbMetadata {
                vendor_id,
                product_id,
                manufacturer: manufacturer.map(str::to_string),
                ..UsbMetadata::default()
            }),
        })
    }

    fn insert(&self, listing: PortListing) -> MockPort {
        let port = MockPort {
            listing,
            state: Arc::new(PortState::default()),
        };
        lock(&self.ports).push(port.clone());
        port
    }

    pub fn port(&self, path: &str) -> Option<MockPort> {
        lock(&self.ports).iter().find(|p| p.path() == path).cloned()
    }

    /// Number of enumeration passes so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl SerialBackend for MockSerialBackend {
    fn list_ports(&self) -> Vec<PortListing> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.ports)
            .iter()
            .filter(|p| !p.state.absent.load(Ordering::SeqCst))
            .map(|p| p.listing.clone())
            .collect()
    }

    fn open_exclusive(
        &self,
        path: &str,
        _baud_rate: u32,
        _read_timeout: Duration,
    ) -> Result<Box<dyn SerialLink>> {
        let unavailable = |reason: &str| BridgeError::DeviceUnavailable {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        let port = self
            .port(path)
            .filter(|p| !p.state.absent.load(Ordering::SeqCst))
            .ok_or_else(|| unavailable("no such device"))?;
        if port.state.busy.load(Ordering::SeqCst) {
            return Err(unavailable("device busy"));
        }
        if port
            .state
            .open_handles
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(unavailable("already open"));
        }
        port.state.total_opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockLink {
            state: Arc::clone(&port.state),
            _handle: Arc::new(OpenHandle(Arc::clone(&port.state))),
        }))
    }
}

/// Released when the last clone of a link is dropped.
struct OpenHandle(Arc<PortState>);

impl Drop for OpenHandle {
    fn drop(&mut self) {
        self.0.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockLink {
    state: Arc<PortState>,
    _handle: Arc<OpenHandle>,
}

impl MockLink {
    fn unplugged(&self) -> bool {
        self.state.absent.load(Ordering::SeqCst)
    }
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.unplugged() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        let next = lock(&self.state.reads).pop_front();
        match next {
            Some(MockRead::Bytes(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    let rest = bytes.split_off(n);
                    lock(&self.state.reads).push_front(MockRead::Bytes(rest));
                }
                Ok(n)
            }
            Some(MockRead::Error(kind)) => Err(io::Error::new(kind, "scripted read failure")),
            None => {
                thread::sleep(IDLE_READ);
                Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
            }
        }
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.unplugged() || self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }
        lock(&self.state.written).extend_from_slice(buf);
        if buf == identity::encode_request().as_slice() {
            if let Some(reply) = lock(&self.state.inquiry_reply).clone() {
                lock(&self.state.reads).push_back(MockRead::Bytes(reply));
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for MockLink {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        Ok(Box::new(MockLink {
            state: Arc::clone(&self.state),
            _handle: Arc::clone(&self._handle),
        }))
    }
}

#[derive(Debug)]
struct PortsState {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    sent: Mutex<Vec<Vec<u8>>>,
    close_calls: AtomicUsize,
    closed: AtomicBool,
}

/// Virtual MIDI ports that record what is sent and let tests inject input.
#[derive(Debug, Clone)]
pub struct MockVirtualPorts {
    inner: Arc<PortsState>,
}

impl Default for MockVirtualPorts {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVirtualPorts {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            inner: Arc::new(PortsState {
                tx,
                rx,
                sent: Mutex::new(Vec::new()),
                close_calls: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Delivers a message as if another application sent it to the input port.
    pub fn inject(&self, message: &[u8]) {
        let _ = self.inner.tx.send(message.to_vec());
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.inner.sent).clone()
    }

    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl VirtualMidiPorts for MockVirtualPorts {
    fn send(&self, message: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::Midi("virtual output is closed".to_string()));
        }
        lock(&self.inner.sent).push(message.to_vec());
        Ok(())
    }

    fn incoming(&self) -> Receiver<Vec<u8>> {
        self.inner.rx.clone()
    }

    fn close(&self) -> bool {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        !self.inner.closed.swap(true, Ordering::SeqCst)
    }
}
