use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One-shot cancellation token.
///
/// Triggering drops the only sender of an internal channel, so every clone
/// blocked in [`Interrupt::wait`] or selecting on [`Interrupt::signal`]
/// wakes at once.
#[derive(Clone)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

struct Inner {
    fired: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                trigger: Mutex::new(Some(tx)),
                signal: rx,
            }),
        }
    }

    /// Fires the interrupt. Returns `false` if it had already fired.
    pub fn trigger(&self) -> bool {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        match self.inner.trigger.lock() {
            Ok(mut guard) => drop(guard.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Blocks until the interrupt fires. There is no timeout.
    pub fn wait(&self) {
        let _ = self.inner.signal.recv();
    }

    /// Sleeps for up to `timeout`, returning early with `true` if the
    /// interrupt fires.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.signal.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_triggered(),
            _ => true,
        }
    }

    /// Receiver that becomes ready (disconnected) once the interrupt fires,
    /// for use in `select!`.
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}
