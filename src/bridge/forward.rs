//! Byte-exact forwarding of 3-byte MIDI messages between serial and MIDI.

use super::stats::BridgeStats;
use super::virtual_port::VirtualMidiPorts;
use crate::discovery::is_quiet;
use crate::error::{BridgeError, Result};
use log::{debug, trace, warn};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Instant;

/// Every message on the serial wire is exactly this long.
pub const MESSAGE_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRead {
    Message([u8; MESSAGE_LEN]),
    /// Some bytes arrived, but fewer than a full message before the read timed out.
    Short(usize),
    Idle,
}

/// Reads one chunk of up to three bytes, returning early when the link's
/// read timeout expires.
pub fn read_chunk<R: Read + ?Sized>(reader: &mut R) -> io::Result<ChunkRead> {
    let mut buf = [0u8; MESSAGE_LEN];
    let mut filled = 0;
    while filled < MESSAGE_LEN {
        match reader.read(&mut buf[filled..]) {
            // A readable handle with nothing to read has been hung up.
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "device reported end of stream",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if is_quiet(e.kind()) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(match filled {
        0 => ChunkRead::Idle,
        MESSAGE_LEN => ChunkRead::Message(buf),
        n => ChunkRead::Short(n),
    })
}

/// Formats a message for the verbose log.
pub fn hex(message: &[u8]) -> String {
    message
        .iter()
        .map(|b| format!("0x{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Forwarding logic shared by both directions of one bridge.
pub struct Forwarder<P: VirtualMidiPorts> {
    ports: Arc<P>,
    stats: Arc<BridgeStats>,
    started: Instant,
}

impl<P: VirtualMidiPorts> Clone for Forwarder<P> {
    fn clone(&self) -> Self {
        Self {
            ports: Arc::clone(&self.ports),
            stats: Arc::clone(&self.stats),
            started: self.started,
        }
    }
}

impl<P: VirtualMidiPorts> Forwarder<P> {
    pub fn new(ports: Arc<P>, stats: Arc<BridgeStats>, started: Instant) -> Self {
        Self {
            ports,
            stats,
            started,
        }
    }

    fn since_start(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Serial to MIDI. Complete messages go out of the virtual output
    /// unchanged; a short read is dropped with a single warning.
    pub fn serial_to_midi(&self, path: &str, chunk: ChunkRead) -> Result<()> {
        match chunk {
            ChunkRead::Message(message) => {
                trace!("{:.3} [MIDI <-] {}", self.since_start(), hex(&message));
                self.ports.send(&message)?;
                self.stats.forwarded_to_midi();
                Ok(())
            }
            ChunkRead::Short(len) => {
                warn!(
                    "Buffer incomplete on {}: {}",
                    path,
                    BridgeError::ShortRead { len }
                );
                self.stats.short_read();
                Ok(())
            }
            ChunkRead::Idle => Ok(()),
        }
    }

    /// MIDI to serial. Only 3-byte messages fit the serial framing; anything
    /// else is dropped.
    pub fn midi_to_serial<W: Write + ?Sized>(
        &self,
        path: &str,
        message: &[u8],
        writer: &mut W,
    ) -> Result<()> {
        if message.len() != MESSAGE_LEN {
            debug!(
                "Dropping {}-byte MIDI message for {}: {}",
                message.len(),
                path,
                hex(message)
            );
            self.stats.dropped_midi();
            return Ok(());
        }
        trace!("{:.3} [MIDI ->] {}", self.since_start(), hex(message));
        writer
            .write_all(message)
            .and_then(|_| writer.flush())
            .map_err(|e| BridgeError::io(path, "write", e))?;
        self.stats.forwarded_to_serial();
        Ok(())
    }
}
