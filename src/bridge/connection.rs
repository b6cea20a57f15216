use super::forward::{read_chunk, Forwarder};
use super::interrupt::Interrupt;
use super::stats::BridgeStats;
use super::virtual_port::VirtualMidiPorts;
use crate::discovery::SerialLink;
use crate::error::{BridgeError, Result};
use crossbeam::channel::{select, Receiver};
use log::{debug, error, trace};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// State of one live serial connection: the handle, the two forwarding
/// threads and the interrupt that ends them.
///
/// Teardown signals the interrupt, joins both threads and only then releases
/// the handle. It runs on [`Connection::close`] or on drop.
pub struct Connection {
    path: String,
    link: Option<Box<dyn SerialLink>>,
    interrupt: Interrupt,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn start<P: VirtualMidiPorts>(
        path: &str,
        link: Box<dyn SerialLink>,
        forwarder: Forwarder<P>,
        incoming: Receiver<Vec<u8>>,
        stats: Arc<BridgeStats>,
    ) -> Result<Self> {
        let reader_link = link
            .try_clone_link()
            .map_err(|e| BridgeError::io(path, "clone handle", e))?;
        let writer_link = link
            .try_clone_link()
            .map_err(|e| BridgeError::io(path, "clone handle", e))?;

        let mut connection = Connection {
            path: path.to_string(),
            link: Some(link),
            interrupt: Interrupt::new(),
            reader: None,
            writer: None,
        };

        let reader = {
            let owned_path = path.to_string();
            let forwarder = forwarder.clone();
            let interrupt = connection.interrupt.clone();
            thread::Builder::new()
                .name(format!("serial reader {}", path))
                .spawn(move || reader_loop(owned_path, reader_link, forwarder, interrupt, stats))
                .map_err(|e| BridgeError::io(path, "spawn reader", e))?
        };
        connection.reader = Some(reader);

        let writer = {
            let owned_path = path.to_string();
            let interrupt = connection.interrupt.clone();
            thread::Builder::new()
                .name(format!("serial writer {}", path))
                .spawn(move || writer_loop(owned_path, writer_link, forwarder, incoming, interrupt))
                .map_err(|e| BridgeError::io(path, "spawn writer", e))?
        };
        connection.writer = Some(writer);

        Ok(connection)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fires when either direction fails; the owner may trigger it too.
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.interrupt.trigger();
        let handles = [
            ("reader", self.reader.take()),
            ("writer", self.writer.take()),
        ];
        for (direction, handle) in handles {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!("Serial {} thread for {} panicked", direction, self.path);
                }
            }
        }
        if self.link.take().is_some() {
            debug!("Released {}", self.path);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct LiveReader<'a>(&'a BridgeStats);

impl<'a> LiveReader<'a> {
    fn enter(stats: &'a BridgeStats) -> Self {
        stats.reader_started();
        LiveReader(stats)
    }
}

impl Drop for LiveReader<'_> {
    fn drop(&mut self) {
        self.0.reader_finished();
    }
}

fn reader_loop<P: VirtualMidiPorts>(
    path: String,
    mut link: Box<dyn SerialLink>,
    forwarder: Forwarder<P>,
    interrupt: Interrupt,
    stats: Arc<BridgeStats>,
) {
    let _live = LiveReader::enter(&stats);
    debug!("Serial reader for {} started", path);

    while !interrupt.is_triggered() {
        match read_chunk(link.as_mut()) {
            Ok(chunk) => {
                if let Err(e) = forwarder.serial_to_midi(&path, chunk) {
                    error!("Failed to forward message from {}: {}", path, e);
                }
            }
            Err(e) => {
                error!("{}", BridgeError::io(&path, "read", e));
                interrupt.trigger();
                break;
            }
        }
    }

    trace!("Stopped serial reader for {}", path);
}

fn writer_loop<P: VirtualMidiPorts>(
    path: String,
    mut link: Box<dyn SerialLink>,
    forwarder: Forwarder<P>,
    incoming: Receiver<Vec<u8>>,
    interrupt: Interrupt,
) {
    loop {
        select! {
            recv(incoming) -> message => match message {
                Ok(message) => {
                    if let Err(e) = forwarder.midi_to_serial(&path, &message, link.as_mut()) {
                        error!("{}", e);
                        interrupt.trigger();
                        break;
                    }
                }
                Err(_) => {
                    debug!("Virtual MIDI input closed, no more messages for {}", path);
                    break;
                }
            },
            recv(interrupt.signal()) -> _ => break,
        }
    }

    trace!("Stopped serial writer for {}", path);
}
