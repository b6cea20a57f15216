// config.rs

use crate::error::{BridgeError, Result};
use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, Environment, File, Value};
use log::{debug, LevelFilter};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT_NAME: &str = "Serial2MIDI";
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_RETRY_INTERVAL_SECS: f64 = 0.3;
pub const DEFAULT_CONFIG_FILE: &str = "serial2midi.toml";
pub const ENV_PREFIX: &str = "SERIAL2MIDI";

/// Read timeout on the bridged serial handle. Bounds how long teardown waits
/// for the reader thread to notice an interruption.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Timing of the per-port probes run by the device directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSettings {
    /// Run the Device Inquiry handshake at all.
    pub identify: bool,
    pub probe_baud_rate: u32,
    /// Read timeout of probe handles.
    pub open_timeout: Duration,
    /// Passive listen before the request is sent.
    pub listen_window: Duration,
    /// Total identity probe window, listen phase included.
    pub reply_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            identify: true,
            probe_baud_rate: DEFAULT_BAUD_RATE,
            open_timeout: Duration::from_millis(100),
            listen_window: Duration::from_secs(3),
            reply_timeout: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub virtual_port_name: String,
    pub baud_rate: u32,
    pub retry_interval: Duration,
    pub match_expression: Option<String>,
    pub probe: ProbeSettings,
    pub log_level: LevelFilter,
    pub log_file: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            virtual_port_name: DEFAULT_PORT_NAME.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            retry_interval: Duration::from_secs_f64(DEFAULT_RETRY_INTERVAL_SECS),
            match_expression: None,
            probe: ProbeSettings::default(),
            log_level: LevelFilter::Info,
            log_file: None,
        }
    }
}

/// Values given on the command line. `None` leaves lower layers in charge.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub name: Option<String>,
    pub baud_rate: Option<u32>,
    pub retry_interval: Option<f64>,
    pub match_expression: Option<String>,
    pub no_identify: bool,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    name: String,
    baud_rate: i64,
    retry_interval: f64,
    #[serde(rename = "match")]
    match_expression: Option<String>,
    identify: bool,
    log_level: String,
    log_file: Option<PathBuf>,
}

impl BridgeConfig {
    /// Layers defaults, the config file, `SERIAL2MIDI_*` variables and the
    /// command line, in increasing precedence.
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("name", DEFAULT_PORT_NAME)?
            .set_default("baud_rate", i64::from(DEFAULT_BAUD_RATE))?
            .set_default("retry_interval", DEFAULT_RETRY_INTERVAL_SECS)?
            .set_default("identify", true)?
            .set_default("log_level", "info")?;

        builder = match &overrides.config_file {
            Some(path) => builder.add_source(File::from(path.as_path()).required(true)),
            None => builder.add_source(File::from(Path::new(DEFAULT_CONFIG_FILE)).required(false)),
        };

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX));
        builder = override_with(builder, "name", overrides.name.clone())?;
        builder = override_with(builder, "baud_rate", overrides.baud_rate.map(i64::from))?;
        builder = override_with(builder, "retry_interval", overrides.retry_interval)?;
        builder = override_with(builder, "match", overrides.match_expression.clone())?;
        builder = override_with(builder, "log_level", overrides.log_level.clone())?;
        builder = override_with(
            builder,
            "log_file",
            overrides
                .log_file
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        )?;
        if overrides.no_identify {
            builder = builder.set_override("identify", false)?;
        }

        let raw: RawSettings = builder.build()?.try_deserialize()?;
        debug!("Raw settings: {:?}", raw);
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self> {
        if raw.name.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "virtual port name must not be empty".to_string(),
            ));
        }
        let baud_rate = u32::try_from(raw.baud_rate)
            .ok()
            .filter(|b| *b > 0)
            .ok_or_else(|| {
                BridgeError::Configuration(format!(
                    "baud rate must be a positive integer, got {}",
                    raw.baud_rate
                ))
            })?;
        let retry_interval = parse_interval(raw.retry_interval)?;
        let log_level = parse_level(&raw.log_level)?;
        let match_expression = raw.match_expression.filter(|m| !m.trim().is_empty());

        Ok(BridgeConfig {
            virtual_port_name: raw.name,
            baud_rate,
            retry_interval,
            match_expression,
            probe: ProbeSettings {
                identify: raw.identify,
                ..ProbeSettings::default()
            },
            log_level,
            log_file: raw.log_file,
        })
    }
}

fn override_with<T: Into<Value>>(
    builder: ConfigBuilder<DefaultState>,
    key: &str,
    value: Option<T>,
) -> Result<ConfigBuilder<DefaultState>> {
    Ok(match value {
        Some(value) => builder.set_override(key, value)?,
        None => builder,
    })
}

fn parse_interval(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(BridgeError::Configuration(format!(
            "retry interval must be a non-negative number of seconds, got {}",
            secs
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

pub fn parse_level(level: &str) -> Result<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "verbose" => Ok(LevelFilter::Trace),
        other => other
            .parse::<LevelFilter>()
            .map_err(|_| BridgeError::Configuration(format!("unknown log level '{}'", level))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn raw() -> RawSettings {
        RawSettings {
            name: DEFAULT_PORT_NAME.to_string(),
            baud_rate: 115_200,
            retry_interval: 0.3,
            match_expression: None,
            identify: true,
            log_level: "info".to_string(),
            log_file: None,
        }
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_raw(raw()).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_rejects_zero_baud_rate() {
        let settings = RawSettings {
            baud_rate: 0,
            ..raw()
        };
        assert!(matches!(
            BridgeConfig::from_raw(settings),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn test_rejects_negative_retry_interval() {
        let settings = RawSettings {
            retry_interval: -1.0,
            ..raw()
        };
        assert!(BridgeConfig::from_raw(settings).is_err());
        assert!(parse_interval(f64::NAN).is_err());
        assert_eq!(parse_interval(0.0).unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_blank_match_expression_is_none() {
        let settings = RawSettings {
            match_expression: Some("  ".to_string()),
            ..raw()
        };
        let config = BridgeConfig::from_raw(settings).unwrap();
        assert_eq!(config.match_expression, None);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("verbose").unwrap(), LevelFilter::Trace);
        assert_eq!(parse_level("WARN").unwrap(), LevelFilter::Warn);
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "name = \"FromFile\"").unwrap();
        writeln!(file, "baud_rate = 31250").unwrap();
        writeln!(file, "match = \"usb_vid == 0x2341\"").unwrap();

        let overrides = Overrides {
            config_file: Some(file.path().to_path_buf()),
            baud_rate: Some(57_600),
            no_identify: true,
            ..Overrides::default()
        };
        let config = BridgeConfig::load(&overrides).unwrap();
        assert_eq!(config.virtual_port_name, "FromFile");
        assert_eq!(config.baud_rate, 57_600);
        let expression = config.match_expression.as_deref();
        assert_eq!(expression, Some("usb_vid == 0x2341"));
        assert!(!config.probe.identify);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let overrides = Overrides {
            config_file: Some(PathBuf::from("/nonexistent/serial2midi.toml")),
            ..Overrides::default()
        };
        assert!(BridgeConfig::load(&overrides).is_err());
    }
}
