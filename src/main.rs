//! # VESC Bridge
//!
//! Drive a VESC motor controller from relay triggers, toggle switches and a
//! joystick, logging GET_VALUES telemetry along the way.
//!
//! # Usage
//!
//! ```text
//! vesc-bridge [config.toml]
//! ```
//!
//! Without an argument `config/default.toml` is used if present, otherwise
//! built-in defaults. The physical inputs are driven from the console (type
//! `help` at the prompt).

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use vesc_bridge::config::{Config, LoggingConfig, SessionTelemetry};
use vesc_bridge::coordinator::Coordinator;
use vesc_bridge::input::console::{run_console, Console, SimulatedAdc};
use vesc_bridge::input::{ConsoleSwitch, InputEvent, Joystick, TriggerSource};
use vesc_bridge::motor::DutyController;
use vesc_bridge::serial::VescSerial;
use vesc_bridge::telemetry::{open_sink, TelemetryPoller};

/// Default configuration file location
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Capacity of the input event queue
const EVENT_QUEUE_SIZE: usize = 16;

/// Set up stdout and daily-rolling file logging
///
/// `RUST_LOG` overrides the configured level. The returned guard must live
/// until exit or buffered file lines are lost.
fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("creating log directory {}", config.dir))?;

    let file_appender = tracing_appender::rolling::daily(&config.dir, &config.file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    Ok(guard)
}

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("loading config {}", path)),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::load(DEFAULT_CONFIG_PATH).with_context(|| format!("loading config {}", DEFAULT_CONFIG_PATH))
        }
        None => Ok(Config::default()),
    }
}

/// Main entry point for VESC Bridge
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration, set up logging
///    - Open the VESC serial port (configured port, then fallbacks)
///    - Calibrate the joystick
///    - Start background telemetry if sessions pause it
///
/// 2. **Main Loop**
///    - Console lines become trigger, switch and joystick inputs
///    - Coordinator runs sessions and manual streaming
///
/// 3. **Shutdown** (Ctrl+C or `quit`)
///    - Emergency stop, then telemetry stop, then the port is released
#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _log_guard = init_logging(&config.logging)?;

    info!("VESC Bridge v{} starting...", env!("CARGO_PKG_VERSION"));

    let serial = VescSerial::open_from_config(&config.serial)?;
    info!("VESC serial port opened at: {}", serial.device_path());
    let channel = serial.into_channel(config.serial.read_timeout());

    let duty = Arc::new(DutyController::new(
        channel.clone(),
        config.duty.clone(),
        config.stop.clone(),
    ));

    let poller = if config.telemetry.enabled {
        let poller = Arc::new(TelemetryPoller::new(channel.clone(), config.telemetry.clone()));
        if config.telemetry.session_mode != SessionTelemetry::Capture {
            poller.start(open_sink(&config.telemetry, "telemetry")?).await;
        }
        Some(poller)
    } else {
        info!("Telemetry disabled");
        None
    };

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
    let switch = ConsoleSwitch::new(config.control.power, config.control.mode);
    let adc = SimulatedAdc::new(config.joystick.adc_max);

    let mut joystick = Joystick::new(adc.clone(), &config.joystick);
    joystick.calibrate().await.context("joystick calibration")?;

    let coordinator = Coordinator::new(
        &config,
        duty.clone(),
        poller.clone(),
        switch.clone(),
        Some(joystick),
        events_rx,
    )?;

    if config.control.sweep_on_start {
        info!("Starting waveform sweep (type 'w stop' to finish)");
        events_tx
            .send(InputEvent::StartSweep)
            .await
            .context("queueing startup sweep")?;
    }

    let console = Console {
        triggers: TriggerSource::new(events_tx.clone(), &config.relay),
        switch,
        adc,
        events: events_tx,
    };
    tokio::spawn(async move {
        if let Err(e) = run_console(BufReader::new(tokio::io::stdin()), console).await {
            warn!("Console input failed: {}", e);
        }
    });

    info!("Press Ctrl+C to exit");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down...");
    };

    let result = coordinator.run(shutdown).await;

    info!("VESC Bridge stopped");
    result.map_err(Into::into)
}
