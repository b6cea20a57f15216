use super::progress::create_probe_spinner;
use crate::discovery::{DeviceDescriptor, DeviceDirectory, SerialBackend};
use crate::matcher::MatchEvaluator;
use std::io::{self, Write};

/// Writes every descriptor field as `name: value`, one device per block.
/// Returns the number of devices written.
pub fn write_devices<W: Write>(
    out: &mut W,
    devices: &[DeviceDescriptor],
    matcher: &MatchEvaluator,
) -> io::Result<usize> {
    if let Some(expression) = matcher.expression() {
        writeln!(out, "Match: {}", expression)?;
        writeln!(out)?;
    }

    if devices.is_empty() {
        writeln!(out, "No devices found")?;
        return Ok(0);
    }

    for (i, device) in devices.iter().enumerate() {
        if i > 0 {
            writeln!(out)?;
        }
        for (name, value) in device.flattened() {
            writeln!(out, "{}: {}", name, value)?;
        }
    }
    Ok(devices.len())
}

/// Runs one discovery pass behind a spinner and prints the matching devices
/// to stdout.
pub fn list_devices<B: SerialBackend>(
    directory: &DeviceDirectory<B>,
    matcher: &MatchEvaluator,
) -> io::Result<usize> {
    let spinner = create_probe_spinner();
    let devices: Vec<DeviceDescriptor> = directory
        .discover()
        .inspect(|device| spinner.set_message(format!("Probed {}", device.device_path)))
        .filter(|device| matcher.matches(device))
        .collect();
    spinner.finish_and_clear();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_devices(&mut out, &devices, matcher)
}
