//! MIDI Device Inquiry (Universal System Exclusive) request/reply codec.
//!
//! The request is a fixed six byte message. The reply is parsed one byte at
//! a time by [`ReplyDecoder`], a linear state machine that resynchronizes on
//! garbage before the general-information tag and reports a
//! [`BridgeError::ProtocolViolation`] for anything malformed after it.

use crate::error::{BridgeError, Result};
use log::{debug, trace};
use std::fmt;
use std::io::{Cursor, Read};
use std::time::{Duration, Instant};

pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;
pub const SYSEX_NON_REALTIME: u8 = 0x7E;
pub const GENERAL_INFORMATION: u8 = 0x06;
pub const REQUEST_IDENTITY: u8 = 0x01;
pub const REPLY_IDENTITY: u8 = 0x02;

/// Device id sent with the inquiry, treated as broadcast by the firmware.
pub const INQUIRY_DEVICE_ID: u8 = 0x01;

const PAYLOAD_LEN: usize = 9;

/// Decoded reply to a Device Inquiry.
///
/// Every byte keeps its own meaning: the family code is two separate bytes,
/// not a 16-bit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MidiIdentity {
    pub manufacturer_id: u8,
    pub family_code: [u8; 2],
    pub model_number: [u8; 2],
    pub version: [u8; 4],
}

impl MidiIdentity {
    fn from_payload(payload: &[u8; PAYLOAD_LEN]) -> Self {
        Self {
            manufacturer_id: payload[0],
            family_code: [payload[1], payload[2]],
            model_number: [payload[3], payload[4]],
            version: [payload[5], payload[6], payload[7], payload[8]],
        }
    }

    pub fn manufacturer_label(&self) -> String {
        format!("0x{:02x}", self.manufacturer_id)
    }

    pub fn family_label(&self) -> String {
        dotted(&self.family_code)
    }

    pub fn model_label(&self) -> String {
        dotted(&self.model_number)
    }

    pub fn version_label(&self) -> String {
        dotted(&self.version)
    }
}

impl fmt::Display for MidiIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "manufacturer {} family {} model {} version {}",
            self.manufacturer_label(),
            self.family_label(),
            self.model_label(),
            self.version_label()
        )
    }
}

pub(crate) fn dotted(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// The Device Inquiry request: `F0 7E 01 06 01 F7`.
pub fn encode_request() -> [u8; 6] {
    [
        SYSEX_START,
        SYSEX_NON_REALTIME,
        INQUIRY_DEVICE_ID,
        GENERAL_INFORMATION,
        REQUEST_IDENTITY,
        SYSEX_END,
    ]
}

/// A blocking source of single bytes.
pub trait ByteSource {
    /// Returns `Ok(None)` when nothing arrived within the source's own read
    /// timeout.
    fn next_byte(&mut self) -> Result<Option<u8>>;
}

impl<T: AsRef<[u8]>> ByteSource for Cursor<T> {
    fn next_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) => Err(BridgeError::io("<buffer>", "identity read", e)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    NonRealtime,
    Channel,
    GeneralInformation,
    ReplyIdentity,
    Payload(usize),
    End,
}

/// Incremental parser for the Device Inquiry reply.
#[derive(Debug)]
pub struct ReplyDecoder {
    stage: Stage,
    payload: [u8; PAYLOAD_LEN],
    seen_start: bool,
}

impl Default for ReplyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyDecoder {
    pub fn new() -> Self {
        Self {
            stage: Stage::Start,
            payload: [0; PAYLOAD_LEN],
            seen_start: false,
        }
    }

    /// Whether a SysEx start byte has ever been observed.
    pub fn seen_start(&self) -> bool {
        self.seen_start
    }

    /// Past the general-information tag: from here on a bad byte is an error
    /// rather than a reason to resynchronize.
    pub fn is_committed(&self) -> bool {
        matches!(
            self.stage,
            Stage::ReplyIdentity | Stage::Payload(_) | Stage::End
        )
    }

    /// Between a SysEx start byte and the end of that message.
    pub fn in_message(&self) -> bool {
        !matches!(self.stage, Stage::Start)
    }

    fn reset(&mut self) {
        self.stage = Stage::Start;
    }

    /// Feeds one byte. Returns the identity once the terminating byte of a
    /// well-formed reply has been consumed.
    pub fn push(&mut self, byte: u8) -> Result<Option<MidiIdentity>> {
        match self.stage {
            Stage::Start => {
                if byte == SYSEX_START {
                    self.seen_start = true;
                    self.stage = Stage::NonRealtime;
                } else {
                    trace!(
                        "Received 0x{:02X}, waiting for SysEx start (0x{:02X})",
                        byte,
                        SYSEX_START
                    );
                }
            }
            Stage::NonRealtime => {
                if byte == SYSEX_NON_REALTIME {
                    self.stage = Stage::Channel;
                } else if byte == SYSEX_START {
                    // Another start byte: begin again from here.
                } else {
                    debug!(
                        "Discarding SysEx of type 0x{:02X}, expected non-realtime (0x{:02X})",
                        byte, SYSEX_NON_REALTIME
                    );
                    self.reset();
                }
            }
            Stage::Channel => {
                debug!("SysEx channel is 0x{:02X}", byte);
                self.stage = Stage::GeneralInformation;
            }
            Stage::GeneralInformation => {
                if byte != GENERAL_INFORMATION {
                    self.reset();
                    return Err(BridgeError::ProtocolViolation(format!(
                        "received sub-id 0x{:02X}, expected general information (0x{:02X})",
                        byte, GENERAL_INFORMATION
                    )));
                }
                self.stage = Stage::ReplyIdentity;
            }
            Stage::ReplyIdentity => {
                if byte != REPLY_IDENTITY {
                    self.reset();
                    return Err(BridgeError::ProtocolViolation(format!(
                        "received sub-id2 0x{:02X}, expected reply identity (0x{:02X})",
                        byte, REPLY_IDENTITY
                    )));
                }
                self.stage = Stage::Payload(0);
            }
            Stage::Payload(index) => {
                self.payload[index] = byte;
                self.stage = if index + 1 == PAYLOAD_LEN {
                    Stage::End
                } else {
                    Stage::Payload(index + 1)
                };
            }
            Stage::End => {
                self.reset();
                if byte != SYSEX_END {
                    return Err(BridgeError::ProtocolViolation(format!(
                        "received 0x{:02X}, expected SysEx end (0x{:02X})",
                        byte, SYSEX_END
                    )));
                }
                return Ok(Some(MidiIdentity::from_payload(&self.payload)));
            }
        }
        Ok(None)
    }
}

/// Reads from `source` until a reply is decoded or `timeout` elapses.
///
/// `Ok(None)` means no reply arrived. A reply cut short after its
/// general-information tag is a protocol violation.
pub fn decode_reply<S>(source: &mut S, timeout: Duration) -> Result<Option<MidiIdentity>>
where
    S: ByteSource + ?Sized,
{
    decode_reply_within(source, timeout, timeout)
}

/// Like [`decode_reply`], but a message that has started by `start_within`
/// may keep arriving until `finish_within`. No new message is started after
/// `start_within`.
pub fn decode_reply_within<S>(
    source: &mut S,
    start_within: Duration,
    finish_within: Duration,
) -> Result<Option<MidiIdentity>>
where
    S: ByteSource + ?Sized,
{
    let started = Instant::now();
    let start_by = started + start_within;
    let finish_by = started + finish_within.max(start_within);
    let mut decoder = ReplyDecoder::new();

    loop {
        let now = Instant::now();
        if now >= finish_by || (now >= start_by && !decoder.in_message()) {
            break;
        }
        if let Some(byte) = source.next_byte()? {
            if let Some(identity) = decoder.push(byte)? {
                debug!("Decoded identity reply: {}", identity);
                return Ok(Some(identity));
            }
        }
    }

    if decoder.is_committed() {
        return Err(BridgeError::ProtocolViolation(
            "identity reply truncated before SysEx end".to_string(),
        ));
    }
    if decoder.seen_start() {
        debug!("Partial SysEx discarded at timeout");
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: [u8; 15] = [
        0xF0, 0x7E, 0x00, 0x06, 0x02, 0x41, 0x00, 0x01, 0x00, 0x02, 0x01, 0x00, 0x00, 0x01, 0xF7,
    ];

    fn decode(bytes: &[u8]) -> Result<Option<MidiIdentity>> {
        let mut source = Cursor::new(bytes.to_vec());
        decode_reply(&mut source, Duration::from_millis(20))
    }

    #[test]
    fn test_encode_request() {
        assert_eq!(encode_request(), [0xF0, 0x7E, 0x01, 0x06, 0x01, 0xF7]);
    }

    #[test]
    fn test_decode_reference_reply() {
        let identity = decode(&REPLY).unwrap().expect("identity");
        assert_eq!(identity.manufacturer_id, 0x41);
        assert_eq!(identity.family_code, [0, 1]);
        assert_eq!(identity.model_number, [0, 2]);
        assert_eq!(identity.version, [1, 0, 0, 1]);
        assert_eq!(identity.manufacturer_label(), "0x41");
        assert_eq!(identity.version_label(), "1.0.0.1");
    }

    #[test]
    fn test_wrong_general_information_is_violation() {
        let mut reply = REPLY;
        reply[3] = 0x07;
        match decode(&reply) {
            Err(BridgeError::ProtocolViolation(msg)) => assert!(msg.contains("0x07")),
            other => panic!("expected protocol violation, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_reply_identity_is_violation() {
        let mut reply = REPLY;
        reply[4] = 0x01;
        assert!(matches!(
            decode(&reply),
            Err(BridgeError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_missing_end_is_violation() {
        let mut reply = REPLY;
        reply[14] = 0x00;
        assert!(matches!(
            decode(&reply),
            Err(BridgeError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_resyncs_after_leading_noise() {
        let mut stream = vec![0x90, 0x3C, 0x7F, 0xF0, 0x7D, 0x11];
        stream.extend_from_slice(&REPLY);
        let identity = decode(&stream).unwrap().expect("identity");
        assert_eq!(identity.manufacturer_id, 0x41);
    }

    #[test]
    fn test_repeated_start_byte_restarts_message() {
        let mut stream = vec![0xF0];
        stream.extend_from_slice(&REPLY);
        assert!(decode(&stream).unwrap().is_some());
    }

    #[test]
    fn test_silence_is_no_reply() {
        assert!(decode(&[]).unwrap().is_none());
        assert!(decode(&[0x80, 0x40, 0x00]).unwrap().is_none());
    }

    #[test]
    fn test_truncated_reply_is_violation() {
        assert!(matches!(
            decode(&REPLY[..9]),
            Err(BridgeError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_partial_prefix_before_commit_is_no_reply() {
        assert!(decode(&[0xF0, 0x7E, 0x00]).unwrap().is_none());
    }

    #[test]
    fn test_decoder_reports_commit_point() {
        let mut decoder = ReplyDecoder::new();
        for byte in &REPLY[..3] {
            assert!(decoder.push(*byte).unwrap().is_none());
        }
        assert!(!decoder.is_committed());
        decoder.push(REPLY[3]).unwrap();
        assert!(decoder.is_committed());
    }

    /// Releases each byte only once its offset from creation has passed.
    struct Paced {
        started: Instant,
        bytes: Vec<(Duration, u8)>,
        next: usize,
    }

    impl Paced {
        fn new(bursts: &[(u64, &[u8])]) -> Self {
            let mut bytes = Vec::new();
            for (ms, chunk) in bursts {
                let at = Duration::from_millis(*ms);
                bytes.extend(chunk.iter().map(|b| (at, *b)));
            }
            Self {
                started: Instant::now(),
                bytes,
                next: 0,
            }
        }
    }

    impl ByteSource for Paced {
        fn next_byte(&mut self) -> Result<Option<u8>> {
            match self.bytes.get(self.next) {
                Some((at, byte)) if self.started.elapsed() >= *at => {
                    self.next += 1;
                    Ok(Some(*byte))
                }
                _ => {
                    std::thread::sleep(Duration::from_millis(1));
                    Ok(None)
                }
            }
        }
    }

    #[test]
    fn test_reply_started_in_window_may_finish_after_it() {
        let mut source = Paced::new(&[(10, &REPLY[..7]), (60, &REPLY[7..])]);
        let identity = decode_reply_within(
            &mut source,
            Duration::from_millis(30),
            Duration::from_millis(500),
        )
        .unwrap()
        .expect("identity");
        assert_eq!(identity.version, [1, 0, 0, 1]);
    }

    #[test]
    fn test_no_new_reply_starts_after_window() {
        let mut source = Paced::new(&[(60, &REPLY)]);
        let started = Instant::now();
        let result = decode_reply_within(
            &mut source,
            Duration::from_millis(20),
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
