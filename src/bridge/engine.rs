// engine.rs

use super::connection::Connection;
use super::forward::Forwarder;
use super::interrupt::Interrupt;
use super::stats::BridgeStats;
use super::virtual_port::VirtualMidiPorts;
use crate::config::{BridgeConfig, SERIAL_READ_TIMEOUT};
use crate::discovery::{DeviceDirectory, SerialBackend, SerialLink};
use crate::error::Result;
use crate::matcher::MatchEvaluator;
use crossbeam::channel::{select, unbounded, Receiver, Sender};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Floor on the retry pause so a zero interval cannot spin on enumeration.
pub const MIN_RETRY_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No connection, polling the device directory.
    Searching,
    /// Candidate found, opening it exclusively.
    Connecting,
    Connected,
    /// Interrupted, tearing the connection down.
    Disconnecting,
    Stopped,
}

/// Requests a stop of a running [`BridgeEngine`]. Safe to call from any
/// thread, any number of times.
#[derive(Clone)]
pub struct StopHandle {
    shutdown: Interrupt,
}

impl StopHandle {
    pub fn stop(&self) {
        if self.shutdown.trigger() {
            info!("Stopping...");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_triggered()
    }
}

/// Resilient duplex bridge between one serial device and a pair of virtual
/// MIDI ports.
///
/// The virtual ports live as long as the engine; only the serial handle is
/// reopened on every connection cycle.
pub struct BridgeEngine<S: SerialBackend, P: VirtualMidiPorts> {
    port_name: String,
    baud_rate: u32,
    retry_interval: Duration,
    backend: Arc<S>,
    directory: DeviceDirectory<S>,
    matcher: MatchEvaluator,
    ports: Arc<P>,
    shutdown: Interrupt,
    stats: Arc<BridgeStats>,
    observers: Vec<Sender<BridgeState>>,
    state: Option<BridgeState>,
    started: Instant,
    reported_missing: bool,
    device_available: bool,
}

impl<S: SerialBackend, P: VirtualMidiPorts> BridgeEngine<S, P> {
    pub fn new(config: &BridgeConfig, backend: Arc<S>, ports: P) -> Self {
        let matcher = MatchEvaluator::new(config.match_expression.as_deref());

        Self {
            port_name: config.virtual_port_name.clone(),
            baud_rate: config.baud_rate,
            retry_interval: config.retry_interval,
            directory: DeviceDirectory::new(Arc::clone(&backend), config.probe.clone()),
            backend,
            matcher,
            ports: Arc::new(ports),
            shutdown: Interrupt::new(),
            stats: Arc::new(BridgeStats::new()),
            observers: Vec::new(),
            state: None,
            started: Instant::now(),
            reported_missing: false,
            device_available: true,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    /// Receives every state the engine enters, in order, from now on.
    pub fn state_changes(&mut self) -> Receiver<BridgeState> {
        let (tx, rx) = unbounded();
        self.observers.push(tx);
        rx
    }

    fn enter(&mut self, state: BridgeState) {
        if self.state == Some(state) {
            return;
        }
        debug!("Bridge state: {:?}", state);
        self.state = Some(state);
        self.observers.retain(|tx| tx.send(state).is_ok());
    }

    /// Runs the state machine until a stop is requested, then closes the
    /// virtual ports.
    pub fn run(mut self) -> Result<()> {
        info!(
            "Bridging to virtual MIDI port \"{}\" at {} baud",
            self.port_name, self.baud_rate
        );
        if let Some(expression) = self.matcher.expression() {
            info!("Only devices matching {:?} will be used", expression);
        }

        while !self.shutdown.is_triggered() {
            self.enter(BridgeState::Searching);
            let path = match self.search() {
                Some(path) => path,
                None => {
                    self.pause();
                    continue;
                }
            };
            if self.shutdown.is_triggered() {
                break;
            }

            self.enter(BridgeState::Connecting);
            let link = match self.connect(&path) {
                Some(link) => link,
                None => {
                    self.pause();
                    continue;
                }
            };

            self.serve(&path, link);
            self.pause();
        }

        self.enter(BridgeState::Stopped);
        if self.ports.close() {
            info!("Closed virtual MIDI port \"{}\"", self.port_name);
        }
        trace!("Bridge main loop finished");
        Ok(())
    }

    fn pause(&self) {
        self.shutdown.wait_timeout(self.retry_interval.max(MIN_RETRY_PAUSE));
    }

    /// One discovery pass. Returns the first matching device path.
    fn search(&mut self) -> Option<String> {
        let mut candidates: Vec<String> = self
            .directory
            .discover()
            .filter(|descriptor| self.matcher.matches(descriptor))
            .map(|descriptor| descriptor.device_path)
            .collect();

        if candidates.is_empty() {
            if !self.reported_missing {
                info!("Could not find device. Is it connected?");
                self.stats.not_found();
                self.reported_missing = true;
            }
            return None;
        }

        self.reported_missing = false;
        if candidates.len() > 1 {
            info!(
                "Found {} matching devices ({}), using the first one",
                candidates.len(),
                candidates.join(", ")
            );
            self.stats.ambiguous_match();
        }
        Some(candidates.swap_remove(0))
    }

    fn connect(&mut self, path: &str) -> Option<Box<dyn SerialLink>> {
        debug!("Device path: {}", path);
        match self
            .backend
            .open_exclusive(path, self.baud_rate, SERIAL_READ_TIMEOUT)
        {
            Ok(link) => {
                info!(
                    "Opened device {} as \"{}\" with baud rate of {}",
                    path, self.port_name, self.baud_rate
                );
                self.device_available = true;
                self.stats.connected();
                Some(link)
            }
            Err(e) if e.is_unavailable() => {
                if self.device_available {
                    warn!("Could not connect to device: {}", e);
                    self.device_available = false;
                }
                None
            }
            Err(e) => {
                error!("Unexpected error while opening {}: {:?}", path, e);
                None
            }
        }
    }

    /// CONNECTED until either direction fails or a stop arrives, then
    /// DISCONNECTING until both threads have exited and the handle is closed.
    fn serve(&mut self, path: &str, link: Box<dyn SerialLink>) {
        let incoming = self.ports.incoming();
        let stale = incoming.try_iter().count();
        if stale > 0 {
            debug!("Discarded {} stale MIDI messages", stale);
        }

        let forwarder = Forwarder::new(
            Arc::clone(&self.ports),
            Arc::clone(&self.stats),
            self.started,
        );
        let stats = Arc::clone(&self.stats);
        let connection = match Connection::start(path, link, forwarder, incoming, stats) {
            Ok(connection) => connection,
            Err(e) => {
                error!("Could not start forwarding for {}: {}", path, e);
                return;
            }
        };
        self.enter(BridgeState::Connected);

        select! {
            recv(connection.interrupt().signal()) -> _ => {
                debug!("Connection to {} interrupted", connection.path())
            }
            recv(self.shutdown.signal()) -> _ => trace!("Shutdown while connected to {}", path),
        }

        self.enter(BridgeState::Disconnecting);
        connection.close();
        info!("Disconnected from {}", path);
    }
}
