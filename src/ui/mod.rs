//! Terminal output for the device listing mode
//!
//! The spinner is drawn with indicatif on stderr so that stdout only carries
//! the listing itself.

mod listing;
mod progress;

pub use listing::{list_devices, write_devices};
pub use progress::create_probe_spinner;
