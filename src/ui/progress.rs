use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const SPINNER_TEMPLATE: &str = "{prefix:.bold.dim} {spinner} {wide_msg}";

/// Spinner shown on stderr while a discovery pass probes the ports.
pub fn create_probe_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template(SPINNER_TEMPLATE) {
        pb.set_style(style);
    }
    pb.set_prefix("Discovery");
    pb.set_message("Probing serial ports...");
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
