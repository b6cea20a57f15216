use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters updated by the engine and its forwarding threads.
#[derive(Debug, Default)]
pub struct BridgeStats {
    to_midi: AtomicU64,
    to_serial: AtomicU64,
    short_reads: AtomicU64,
    dropped_midi: AtomicU64,
    connections: AtomicU64,
    not_found_notices: AtomicU64,
    ambiguous_matches: AtomicU64,
    live_readers: AtomicUsize,
    peak_readers: AtomicUsize,
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub to_midi: u64,
    pub to_serial: u64,
    pub short_reads: u64,
    pub dropped_midi: u64,
    pub connections: u64,
    pub not_found_notices: u64,
    /// Searches that found several candidates and took the first.
    pub ambiguous_matches: u64,
    pub live_readers: usize,
    pub peak_readers: usize,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn forwarded_to_midi(&self) {
        self.to_midi.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn forwarded_to_serial(&self) {
        self.to_serial.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn short_read(&self) {
        self.short_reads.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dropped_midi(&self) {
        self.dropped_midi.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn connected(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn not_found(&self) {
        self.not_found_notices.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn ambiguous_match(&self) {
        self.ambiguous_matches.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn reader_started(&self) {
        let live = self.live_readers.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_readers.fetch_max(live, Ordering::SeqCst);
    }

    pub(crate) fn reader_finished(&self) {
        self.live_readers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            to_midi: self.to_midi.load(Ordering::SeqCst),
            to_serial: self.to_serial.load(Ordering::SeqCst),
            short_reads: self.short_reads.load(Ordering::SeqCst),
            dropped_midi: self.dropped_midi.load(Ordering::SeqCst),
            connections: self.connections.load(Ordering::SeqCst),
            not_found_notices: self.not_found_notices.load(Ordering::SeqCst),
            ambiguous_matches: self.ambiguous_matches.load(Ordering::SeqCst),
            live_readers: self.live_readers.load(Ordering::SeqCst),
            peak_readers: self.peak_readers.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_readers_tracks_overlap() {
        let stats = BridgeStats::new();
        stats.reader_started();
        stats.reader_finished();
        stats.reader_started();
        assert_eq!(stats.snapshot().peak_readers, 1);

        stats.reader_started();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.live_readers, 2);
        assert_eq!(snapshot.peak_readers, 2);
    }
}
