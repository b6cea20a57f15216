#[cfg(test)]
mod tests {
    use serial2midi::config::ProbeSettings;
    use serial2midi::discovery::{probe_identity, DeviceDescriptor, DeviceDirectory};
    use serial2midi::identity::{self, MidiIdentity};
    use serial2midi::matcher::MatchEvaluator;
    use serial2midi::mock::MockSerialBackend;
    use serial2midi::ui::write_devices;
    use std::sync::Arc;
    use std::time::Duration;

    const REPLY: [u8; 15] = [
        0xF0, 0x7E, 0x00, 0x06, 0x02, 0x41, 0x00, 0x01, 0x00, 0x02, 0x01, 0x00, 0x00, 0x01, 0xF7,
    ];

    fn fast_probe() -> ProbeSettings {
        ProbeSettings {
            open_timeout: Duration::from_millis(5),
            listen_window: Duration::from_millis(20),
            reply_timeout: Duration::from_millis(300),
            ..ProbeSettings::default()
        }
    }

    fn expected_identity() -> MidiIdentity {
        MidiIdentity {
            manufacturer_id: 0x41,
            family_code: [0x00, 0x01],
            model_number: [0x00, 0x02],
            version: [0x01, 0x00, 0x00, 0x01],
        }
    }

    #[test]
    fn test_identified_device_can_be_matched_by_identity() {
        let backend = Arc::new(MockSerialBackend::new());
        backend.add_port("/dev/ttyACM0");
        let synth = backend.add_usb_port("/dev/ttyACM1", 0x2341, 0x8036, Some("Arduino"));
        synth.reply_to_inquiry(&REPLY);

        let directory = DeviceDirectory::new(Arc::clone(&backend), fast_probe());
        let matcher = MatchEvaluator::new(Some(
            "identity.manufacturer_id == 0x41 && identity.version == '1.0.0.1'",
        ));
        let matching: Vec<DeviceDescriptor> = directory
            .discover()
            .filter(|d| matcher.matches(d))
            .collect();

        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].device_path, "/dev/ttyACM1");
        assert_eq!(matching[0].identity, Some(expected_identity()));
        assert!(matching[0].is_exclusive_available);
        assert_eq!(synth.written(), identity::encode_request().to_vec());
        assert_eq!(synth.open_handles(), 0);
    }

    #[test]
    fn test_probe_of_busy_port_is_unavailable() {
        let backend = MockSerialBackend::new();
        let port = backend.add_port("/dev/ttyACM0");
        port.set_busy(true);
        let err = probe_identity(&backend, "/dev/ttyACM0", &fast_probe()).unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_silent_device_has_no_identity() {
        let backend = MockSerialBackend::new();
        let port = backend.add_port("/dev/ttyACM0");
        let found = probe_identity(&backend, "/dev/ttyACM0", &fast_probe()).unwrap();
        assert_eq!(found, None);
        assert_eq!(port.written(), identity::encode_request().to_vec());
    }

    #[test]
    fn test_listing_shows_flattened_identity() {
        let backend = Arc::new(MockSerialBackend::new());
        let synth = backend.add_usb_port("/dev/ttyACM0", 0x2341, 0x8036, Some("Arduino"));
        synth.reply_to_inquiry(&REPLY);
        let directory = DeviceDirectory::new(backend, fast_probe());
        let devices: Vec<DeviceDescriptor> = directory.discover().collect();

        let mut out = Vec::new();
        let count = write_devices(&mut out, &devices, &MatchEvaluator::accept_all()).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(count, 1);
        assert!(text.contains("device_path: /dev/ttyACM0\n"));
        assert!(text.contains("usb_vendor_id: 0x2341\n"));
        assert!(text.contains("usb_manufacturer: Arduino\n"));
        assert!(text.contains("is_exclusive_available: true\n"));
        assert!(text.contains("identity.manufacturer_id: 0x41\n"));
        assert!(text.contains("identity.version: 1.0.0.1\n"));
    }
}
