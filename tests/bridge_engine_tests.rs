#[cfg(test)]
mod tests {
    use crossbeam::channel::Receiver;
    use serial2midi::bridge::{BridgeEngine, BridgeState, BridgeStats, StopHandle};
    use serial2midi::config::BridgeConfig;
    use serial2midi::mock::{MockSerialBackend, MockVirtualPorts};
    use serial2midi::Result;
    use std::io::ErrorKind;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    const DEADLINE: Duration = Duration::from_secs(5);

    struct Running {
        states: Receiver<BridgeState>,
        stats: Arc<BridgeStats>,
        stop: StopHandle,
        handle: JoinHandle<Result<()>>,
    }

    impl Running {
        /// Collects states until `wanted` is entered.
        fn wait_for(&self, wanted: BridgeState) -> Vec<BridgeState> {
            let mut seen = Vec::new();
            let started = Instant::now();
            loop {
                let left = DEADLINE.saturating_sub(started.elapsed());
                match self.states.recv_timeout(left) {
                    Ok(state) => {
                        seen.push(state);
                        if state == wanted {
                            return seen;
                        }
                    }
                    Err(_) => panic!("never reached {:?}, saw {:?}", wanted, seen),
                }
            }
        }

        fn finish(self) -> Vec<BridgeState> {
            self.stop.stop();
            self.handle.join().unwrap().unwrap();
            self.states.try_iter().collect()
        }
    }

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig {
            retry_interval: Duration::from_millis(5),
            ..BridgeConfig::default()
        };
        config.probe.identify = false;
        config
    }

    fn start(
        config: &BridgeConfig,
        backend: &Arc<MockSerialBackend>,
        ports: &MockVirtualPorts,
    ) -> Running {
        let mut engine = BridgeEngine::new(config, Arc::clone(backend), ports.clone());
        let states = engine.state_changes();
        let stats = engine.stats();
        let stop = engine.stop_handle();
        let handle = thread::spawn(move || engine.run());
        Running {
            states,
            stats,
            stop,
            handle,
        }
    }

    fn eventually(condition: impl Fn() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < DEADLINE {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_no_devices_keeps_searching_and_reports_once() {
        let backend = Arc::new(MockSerialBackend::new());
        let ports = MockVirtualPorts::new();
        let running = start(&config(), &backend, &ports);

        assert!(eventually(|| running.stats.snapshot().not_found_notices == 1));
        thread::sleep(Duration::from_millis(60));
        let stats = Arc::clone(&running.stats);
        let states = running.finish();

        assert_eq!(stats.snapshot().not_found_notices, 1);
        assert_eq!(stats.snapshot().connections, 0);
        assert_eq!(states, vec![BridgeState::Searching, BridgeState::Stopped]);
    }

    #[test]
    fn test_zero_retry_interval_does_not_spin() {
        let backend = Arc::new(MockSerialBackend::new());
        let ports = MockVirtualPorts::new();
        let config = BridgeConfig {
            retry_interval: Duration::ZERO,
            ..config()
        };
        let running = start(&config, &backend, &ports);

        thread::sleep(Duration::from_millis(200));
        running.finish();
        let passes = backend.list_calls();
        assert!(passes >= 1);
        assert!(passes <= 40, "{} enumeration passes in 200 ms", passes);
    }

    #[test]
    fn test_first_of_two_matching_devices_is_used() {
        let backend = Arc::new(MockSerialBackend::new());
        let first = backend.add_usb_port("/dev/ttyACM0", 0x2341, 0x8036, Some("Arduino"));
        let second = backend.add_usb_port("/dev/ttyACM1", 0x2341, 0x8036, Some("Arduino"));
        let ports = MockVirtualPorts::new();
        let config = BridgeConfig {
            match_expression: Some("usb_vid == 0x2341".to_string()),
            ..config()
        };
        let running = start(&config, &backend, &ports);

        running.wait_for(BridgeState::Connected);
        assert_eq!(first.open_handles(), 1);
        assert_eq!(second.open_handles(), 0);
        assert_eq!(running.stats.snapshot().ambiguous_matches, 1);
        running.finish();
    }

    #[test]
    fn test_match_expression_filters_candidates() {
        let backend = Arc::new(MockSerialBackend::new());
        let other = backend.add_usb_port("/dev/ttyUSB0", 0x0403, 0x6001, Some("FTDI"));
        let wanted = backend.add_usb_port("/dev/ttyACM0", 0x2341, 0x8036, Some("Arduino"));
        let ports = MockVirtualPorts::new();
        let config = BridgeConfig {
            match_expression: Some("usb_manufacturer ~= 'Ardu'".to_string()),
            ..config()
        };
        let running = start(&config, &backend, &ports);

        running.wait_for(BridgeState::Connected);
        assert_eq!(wanted.open_handles(), 1);
        assert_eq!(other.open_handles(), 0);
        assert_eq!(running.stats.snapshot().ambiguous_matches, 0);
        running.finish();
    }

    #[test]
    fn test_forwards_both_directions_unchanged() {
        let backend = Arc::new(MockSerialBackend::new());
        let port = backend.add_port("/dev/ttyACM0");
        let ports = MockVirtualPorts::new();
        let running = start(&config(), &backend, &ports);
        running.wait_for(BridgeState::Connected);

        port.push_read(&[0x90, 0x3c, 0x7f, 0x80, 0x3c, 0x00]);
        assert!(eventually(|| ports.sent().len() == 2));
        let expected = vec![vec![0x90, 0x3c, 0x7f], vec![0x80, 0x3c, 0x00]];
        assert_eq!(ports.sent(), expected);

        ports.inject(&[0xb0, 0x07, 0x64]);
        assert!(eventually(|| port.written() == vec![0xb0, 0x07, 0x64]));

        let stats = Arc::clone(&running.stats);
        running.finish();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.to_midi, 2);
        assert_eq!(snapshot.to_serial, 1);
    }

    #[test]
    fn test_short_read_is_dropped_and_connection_stays_up() {
        let backend = Arc::new(MockSerialBackend::new());
        let port = backend.add_port("/dev/ttyACM0");
        let ports = MockVirtualPorts::new();
        let running = start(&config(), &backend, &ports);
        running.wait_for(BridgeState::Connected);

        port.push_read(&[0x90, 0x3c]);
        assert!(eventually(|| running.stats.snapshot().short_reads == 1));
        assert!(ports.sent().is_empty());

        port.push_read(&[0x90, 0x3c, 0x7f]);
        assert!(eventually(|| ports.sent().len() == 1));

        let states = running.finish();
        let expected = vec![BridgeState::Disconnecting, BridgeState::Stopped];
        assert_eq!(states, expected);
    }

    #[test]
    fn test_midi_queued_while_disconnected_is_discarded() {
        let backend = Arc::new(MockSerialBackend::new());
        let port = backend.add_port("/dev/ttyACM0");
        let ports = MockVirtualPorts::new();
        ports.inject(&[0x90, 0x01, 0x01]);

        let running = start(&config(), &backend, &ports);
        running.wait_for(BridgeState::Connected);
        ports.inject(&[0x90, 0x02, 0x02]);
        assert!(eventually(|| !port.written().is_empty()));
        assert_eq!(port.written(), vec![0x90, 0x02, 0x02]);
        running.finish();
    }

    #[test]
    fn test_read_error_reconnects_without_overlapping_readers() {
        let backend = Arc::new(MockSerialBackend::new());
        let port = backend.add_port("/dev/ttyACM0");
        let ports = MockVirtualPorts::new();
        let running = start(&config(), &backend, &ports);
        running.wait_for(BridgeState::Connected);

        port.push_read_error(ErrorKind::BrokenPipe);
        let seen = running.wait_for(BridgeState::Connected);
        assert_eq!(
            seen,
            vec![
                BridgeState::Disconnecting,
                BridgeState::Searching,
                BridgeState::Connecting,
                BridgeState::Connected,
            ]
        );

        port.push_read(&[0xf8, 0x00, 0x00]);
        assert!(eventually(|| ports.sent().len() == 1));

        let stats = Arc::clone(&running.stats);
        running.finish();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections, 2);
        assert_eq!(snapshot.peak_readers, 1);
        assert_eq!(snapshot.live_readers, 0);
        assert_eq!(port.open_handles(), 0);
    }

    #[test]
    fn test_write_error_reconnects() {
        let backend = Arc::new(MockSerialBackend::new());
        let port = backend.add_port("/dev/ttyACM0");
        let ports = MockVirtualPorts::new();
        let running = start(&config(), &backend, &ports);
        running.wait_for(BridgeState::Connected);

        port.set_fail_writes(true);
        ports.inject(&[0x90, 0x3c, 0x7f]);
        running.wait_for(BridgeState::Disconnecting);
        port.set_fail_writes(false);
        running.wait_for(BridgeState::Connected);

        assert_eq!(running.stats.snapshot().connections, 2);
        running.finish();
    }

    #[test]
    fn test_unplugged_device_is_found_again() {
        let backend = Arc::new(MockSerialBackend::new());
        let port = backend.add_port("/dev/ttyACM0");
        let ports = MockVirtualPorts::new();
        let running = start(&config(), &backend, &ports);
        running.wait_for(BridgeState::Connected);

        port.set_present(false);
        running.wait_for(BridgeState::Searching);
        assert!(eventually(|| running.stats.snapshot().not_found_notices == 1));

        port.set_present(true);
        running.wait_for(BridgeState::Connected);
        running.finish();
    }

    #[test]
    fn test_busy_device_is_retried() {
        let backend = Arc::new(MockSerialBackend::new());
        let port = backend.add_port("/dev/ttyACM0");
        port.set_busy(true);
        let ports = MockVirtualPorts::new();
        let running = start(&config(), &backend, &ports);

        running.wait_for(BridgeState::Connecting);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(running.stats.snapshot().connections, 0);

        port.set_busy(false);
        running.wait_for(BridgeState::Connected);
        running.finish();
    }

    #[test]
    fn test_stop_twice_closes_ports_once() {
        let backend = Arc::new(MockSerialBackend::new());
        let port = backend.add_port("/dev/ttyACM0");
        let ports = MockVirtualPorts::new();
        let running = start(&config(), &backend, &ports);
        running.wait_for(BridgeState::Connected);

        running.stop.stop();
        running.stop.stop();
        let states = running.finish();

        let expected = vec![BridgeState::Disconnecting, BridgeState::Stopped];
        assert_eq!(states, expected);
        assert_eq!(ports.close_calls(), 1);
        assert!(ports.is_closed());
        assert_eq!(port.open_handles(), 0);
    }
}
