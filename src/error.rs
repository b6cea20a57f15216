//! Error types shared by discovery, the identity handshake and the bridge.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Port busy, vanished or not permitted. Recoverable: the bridge retries.
    #[error("device {path} unavailable: {reason}")]
    DeviceUnavailable { path: String, reason: String },

    /// Malformed Device Inquiry reply. Fatal to the probe attempt only.
    #[error("SysEx protocol violation: {0}")]
    ProtocolViolation(String),

    /// Serial chunk that was not exactly one 3-byte MIDI message.
    #[error("short read of {len} byte(s)")]
    ShortRead { len: usize },

    /// Read or write failure on an open serial handle.
    #[error("I/O error during {operation} on {path}: {source}")]
    Io {
        path: String,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Serial driver failure that is not a plain availability problem.
    #[error("serial error on {path}: {reason}")]
    Serial { path: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("MIDI error: {0}")]
    Midi(String),
}

impl BridgeError {
    pub fn io(path: &str, operation: &'static str, source: std::io::Error) -> Self {
        BridgeError::Io {
            path: path.to_string(),
            operation,
            source,
        }
    }

    /// Whether the error only means "try again later".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BridgeError::DeviceUnavailable { .. })
    }
}

impl From<midir::InitError> for BridgeError {
    fn from(e: midir::InitError) -> Self {
        BridgeError::Midi(e.to_string())
    }
}

impl From<midir::SendError> for BridgeError {
    fn from(e: midir::SendError) -> Self {
        BridgeError::Midi(e.to_string())
    }
}

impl From<config::ConfigError> for BridgeError {
    fn from(e: config::ConfigError) -> Self {
        BridgeError::Configuration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
