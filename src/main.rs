use anyhow::Context;
use capsense_led::domain::session::SessionStateMachine;
use capsense_led::domain::settings::SettingsService;
use capsense_led::infrastructure::bluetooth::simulated::{SimulatedPeripheral, SimulatedTransport};
use capsense_led::infrastructure::bluetooth::{GattTransport, PlatformTransport};
use capsense_led::infrastructure::logging;
use capsense_led::presentation::ConsoleApp;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::info;

/// Control the LED and watch the CapSense slider of a BLE peripheral
#[derive(Parser, Debug)]
#[command(name = "capsense-led", version, about)]
struct Args {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Talk to an in-memory peripheral instead of the radio
    #[arg(long)]
    simulate: bool,

    /// Log filter, e.g. "debug" or "capsense_led=trace"
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => SettingsService::with_path(path.clone()),
        None => SettingsService::new().context("Failed to locate settings")?,
    };

    let mut log_settings = settings.get().log_settings.clone();
    if let Some(level) = &args.log_level {
        log_settings.level = level.clone();
    }
    let _log_guard = logging::init_logger(&log_settings)?;
    info!("Starting CapSense LED (settings: {})", settings.path().display());

    let config = settings.get().transport_config();
    let service = config.service;
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let transport: Arc<dyn GattTransport> = if args.simulate {
        info!("Using simulated peripheral");
        Arc::new(SimulatedTransport::new(
            SimulatedPeripheral::new(),
            config,
            event_tx,
        ))
    } else {
        Arc::new(PlatformTransport::new(config, event_tx))
    };

    let session = SessionStateMachine::spawn(transport, event_rx, service);
    let app = ConsoleApp::new(session, Arc::new(Mutex::new(settings)));
    let printer = app.spawn_event_loop();

    let result = app.run(BufReader::new(tokio::io::stdin())).await;
    printer.abort();
    info!("Exiting");
    result
}
