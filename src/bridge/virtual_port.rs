//! Virtual MIDI endpoints exposed to the host MIDI subsystem.

use crate::error::Result;
use crossbeam::channel::Receiver;

/// One virtual input port and one virtual output port under a single name.
///
/// Messages arriving on the input port are delivered on the channel
/// returned by [`VirtualMidiPorts::incoming`], whatever thread the host
/// delivers them on.
pub trait VirtualMidiPorts: Send + Sync + 'static {
    /// Sends one message out of the virtual output port.
    fn send(&self, message: &[u8]) -> Result<()>;

    fn incoming(&self) -> Receiver<Vec<u8>>;

    /// Closes both ports. Later calls do nothing and return `false`.
    fn close(&self) -> bool;
}

#[cfg(unix)]
pub use self::midir_ports::MidirVirtualPorts;

#[cfg(unix)]
mod midir_ports {
    use super::*;
    use crate::error::BridgeError;
    use crossbeam::channel::unbounded;
    use log::{debug, info};
    use midir::os::unix::{VirtualInput, VirtualOutput};
    use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
    use std::sync::Mutex;

    /// Virtual ports created through `midir` (ALSA on Linux, CoreMIDI on macOS).
    pub struct MidirVirtualPorts {
        name: String,
        input: Mutex<Option<MidiInputConnection<()>>>,
        output: Mutex<Option<MidiOutputConnection>>,
        incoming: Receiver<Vec<u8>>,
    }

    impl MidirVirtualPorts {
        pub fn open(name: &str) -> Result<Self> {
            let (tx, rx) = unbounded();

            let mut midi_in = MidiInput::new(name)?;
            midi_in.ignore(Ignore::None);
            let input = midi_in
                .create_virtual(
                    name,
                    move |_stamp, message, _| {
                        let _ = tx.send(message.to_vec());
                    },
                    (),
                )
                .map_err(|e| BridgeError::Midi(format!("virtual input '{}': {}", name, e)))?;

            let midi_out = MidiOutput::new(name)?;
            let output = midi_out
                .create_virtual(name)
                .map_err(|e| BridgeError::Midi(format!("virtual output '{}': {}", name, e)))?;

            info!("Opened virtual MIDI ports \"{}\"", name);
            Ok(Self {
                name: name.to_string(),
                input: Mutex::new(Some(input)),
                output: Mutex::new(Some(output)),
                incoming: rx,
            })
        }
    }

    impl VirtualMidiPorts for MidirVirtualPorts {
        fn send(&self, message: &[u8]) -> Result<()> {
            let mut guard = self
                .output
                .lock()
                .map_err(|_| BridgeError::Midi("output port lock poisoned".to_string()))?;
            match guard.as_mut() {
                Some(output) => Ok(output.send(message)?),
                None => Err(BridgeError::Midi(format!(
                    "virtual output '{}' is closed",
                    self.name
                ))),
            }
        }

        fn incoming(&self) -> Receiver<Vec<u8>> {
            self.incoming.clone()
        }

        fn close(&self) -> bool {
            let input = self.input.lock().ok().and_then(|mut guard| guard.take());
            let output = self.output.lock().ok().and_then(|mut guard| guard.take());
            let closed = input.is_some() || output.is_some();
            if let Some(input) = input {
                input.close();
            }
            if let Some(output) = output {
                output.close();
            }
            if closed {
                debug!("Closed virtual MIDI ports \"{}\"", self.name);
            }
            closed
        }
    }
}
