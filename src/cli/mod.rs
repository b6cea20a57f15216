use crate::config::Overrides;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Name of the virtual MIDI ports to create
    #[arg(short, long)]
    pub name: Option<String>,

    /// Serial baud rate of the device
    #[arg(short, long)]
    pub baud_rate: Option<u32>,

    /// Seconds to wait before searching again after a failure
    #[arg(short, long, visible_alias = "sleep-interval", value_name = "SECS")]
    pub retry_interval: Option<f64>,

    /// Only use devices matching this expression, e.g. "usb_vid == 0x2341"
    #[arg(short = 'm', long = "match", value_name = "EXPR")]
    pub match_expression: Option<String>,

    /// List serial devices with their identity and exit
    #[arg(short, long)]
    pub list: bool,

    /// Skip the identity handshake while probing devices
    #[arg(long)]
    pub no_identify: bool,

    /// Configuration file (defaults to serial2midi.toml if present)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// One of off, error, warn, info, debug, trace (or verbose)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Also append log output to this file
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

impl Args {
    pub fn to_overrides(&self) -> Overrides {
        Overrides {
            config_file: self.config.clone(),
            name: self.name.clone(),
            baud_rate: self.baud_rate,
            retry_interval: self.retry_interval,
            match_expression: self.match_expression.clone(),
            no_identify: self.no_identify,
            log_level: self.log_level.clone(),
            log_file: self.log_file.clone(),
        }
    }
}
