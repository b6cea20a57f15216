pub mod bridge;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod logging;
pub mod matcher;
pub mod mock;
pub mod ui;

pub use bridge::{BridgeEngine, BridgeState, StopHandle};
pub use config::BridgeConfig;
pub use discovery::{DeviceDescriptor, DeviceDirectory};
pub use error::{BridgeError, Result};
pub use matcher::MatchEvaluator;
