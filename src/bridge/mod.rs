//! The serial to virtual MIDI bridge
//!
//! This module provides:
//! - [`BridgeEngine`], the reconnecting state machine and its [`StopHandle`]
//! - [`VirtualMidiPorts`], the seam over the host MIDI subsystem
//! - [`Forwarder`], byte-exact forwarding in both directions
//! - [`Interrupt`], the cancellation token shared by a connection's threads
//!
mod connection;
mod engine;
mod forward;
mod interrupt;
mod stats;
mod virtual_port;

pub use engine::{BridgeEngine, BridgeState, StopHandle};
pub use forward::{hex, read_chunk, ChunkRead, Forwarder, MESSAGE_LEN};
pub use interrupt::Interrupt;
pub use stats::{BridgeStats, StatsSnapshot};
pub use virtual_port::VirtualMidiPorts;

#[cfg(unix)]
pub use virtual_port::MidirVirtualPorts;
