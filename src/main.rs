use clap::Parser;
use serial2midi::{
    cli::Args,
    config::BridgeConfig,
    discovery::{DeviceDirectory, SystemSerial},
    logging,
    matcher::MatchEvaluator,
    ui::list_devices,
};
use std::process;
use std::sync::Arc;

fn main() {
    let args = Args::parse();
    let config = load_config(&args);
    initialize_logging(&config);

    if args.list {
        run_listing(&config);
        return;
    }

    run_bridge(&config);
}

fn load_config(args: &Args) -> BridgeConfig {
    match BridgeConfig::load(&args.to_overrides()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            process::exit(2);
        }
    }
}

fn initialize_logging(config: &BridgeConfig) {
    if let Err(e) = logging::init_logger(config.log_level, config.log_file.as_deref()) {
        eprintln!("Logger initialization failed: {}", e);
        process::exit(1);
    }
    log::debug!("Configuration: {:?}", config);
}

fn run_listing(config: &BridgeConfig) {
    let directory = DeviceDirectory::new(Arc::new(SystemSerial::new()), config.probe.clone());
    let matcher = MatchEvaluator::new(config.match_expression.as_deref());

    if let Err(e) = list_devices(&directory, &matcher) {
        log::error!("Could not write device list: {}", e);
        process::exit(1);
    }
}

#[cfg(unix)]
fn run_bridge(config: &BridgeConfig) {
    use serial2midi::bridge::{BridgeEngine, MidirVirtualPorts};

    let ports = match MidirVirtualPorts::open(&config.virtual_port_name) {
        Ok(ports) => ports,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Could not create virtual MIDI ports: {}", e);
            process::exit(1);
        }
    };

    let engine = BridgeEngine::new(config, Arc::new(SystemSerial::new()), ports);
    let stop = engine.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || stop.stop()) {
        log::warn!("Could not install signal handler: {}", e);
    }

    let stats = engine.stats();
    if let Err(e) = engine.run() {
        log::error!("{}", e);
        process::exit(1);
    }
    log::debug!("Final counters: {:?}", stats.snapshot());
}

#[cfg(not(unix))]
fn run_bridge(_config: &BridgeConfig) {
    log::error!("Virtual MIDI ports are not supported on this platform");
    eprintln!("Virtual MIDI ports are not supported on this platform; only --list is available");
    process::exit(1);
}
