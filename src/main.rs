//! Command line front end for the tracker interpreter.
//!
//! - `run` - connect to the configured transports and log tracker events
//! - `ports` - list serial ports
//! - `scan` - look for BLE trackers
//! - `init` - write a settings file with defaults

use anyhow::Result;
use clap::{Parser, Subcommand};
use fbt_interpreter::domain::settings::SppPort;
use fbt_interpreter::infrastructure::logging::init_logger;
use fbt_interpreter::{
    MessageSeverity, SettingsService, TrackerEvent, TrackerIdentity, TrackerInterpreter,
};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

#[derive(Parser)]
#[command(name = "fbt_interpreter")]
#[command(about = "Connects to full-body-tracking wearables and reports what they send")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Settings file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log tracker events until Ctrl-C
    Run {
        /// Dongle serial port, in addition to the configured ones
        #[arg(long = "serial")]
        serial: Vec<String>,
        /// Bluetooth SPP port as PATH or PATH=TRACKER
        #[arg(long = "spp")]
        spp: Vec<String>,
        /// Also connect to BLE trackers
        #[arg(long)]
        ble: bool,
    },
    /// List serial ports
    Ports,
    /// Scan for BLE trackers
    Scan,
    /// Write a settings file with defaults
    Init,
}

fn parse_spp(arg: &str) -> Result<SppPort> {
    match arg.split_once('=') {
        Some((path, identity)) => Ok(SppPort {
            path: path.to_string(),
            identity: Some(identity.parse::<TrackerIdentity>()?),
        }),
        None => Ok(SppPort {
            path: arg.to_string(),
            identity: None,
        }),
    }
}

fn log_event(event: &TrackerEvent) {
    match event {
        TrackerEvent::Imu { identity, sample } => trace!("{}: {:?}", identity, sample),
        TrackerEvent::Tracker { identity, payload } => debug!("{}: {}", identity, payload),
        TrackerEvent::Log(message) => match message.severity {
            MessageSeverity::Error => error!("{}", message.message),
            MessageSeverity::Warning => warn!("{}", message.message),
            MessageSeverity::Info | MessageSeverity::Success => info!("{}", message.message),
        },
        other => info!("{:?}", other),
    }
}

async fn run(
    service: SettingsService,
    serial: Vec<String>,
    spp: Vec<String>,
    ble: bool,
) -> Result<()> {
    let mut settings = service.get().clone();
    settings.serial_ports.extend(serial);
    for arg in &spp {
        settings.spp_ports.push(parse_spp(arg)?);
    }

    let (interpreter, mut events) = TrackerInterpreter::new(settings);

    #[cfg(feature = "serial")]
    interpreter.start_serial();

    if ble {
        #[cfg(feature = "ble")]
        if let Err(e) = interpreter.start_ble().await {
            warn!("BLE unavailable: {}", e);
        }
        #[cfg(not(feature = "ble"))]
        warn!("Built without BLE support");
    }

    if !interpreter.is_running() {
        warn!("No transports configured; see {}", service.path().display());
    }

    pump_events(&mut events).await;
    interpreter.stop().await;
    // Drain what the shutdown produced
    while let Ok(event) = events.try_recv() {
        log_event(&event);
    }
    Ok(())
}

async fn pump_events(events: &mut mpsc::UnboundedReceiver<TrackerEvent>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => return,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let service = match &cli.config {
        Some(path) => SettingsService::with_path(path)?,
        None => SettingsService::new()?,
    };
    let _logging = init_logger(&service.get().log_settings)?;
    info!("Starting FBT interpreter v{}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Run {
        serial: Vec::new(),
        spp: Vec::new(),
        ble: false,
    }) {
        Commands::Run { serial, spp, ble } => run(service, serial, spp, ble).await?,
        Commands::Ports => {
            #[cfg(feature = "serial")]
            for port in fbt_interpreter::infrastructure::transport::scanner::list_serial_ports()? {
                println!("{}\t{}", port.path, port.description);
            }
            #[cfg(not(feature = "serial"))]
            warn!("Built without serial support");
        }
        Commands::Scan => {
            #[cfg(feature = "ble")]
            {
                use fbt_interpreter::infrastructure::transport::scanner;
                let settings = service.get();
                let adapter = scanner::default_adapter().await?;
                for tracker in scanner::scan_ble_trackers(
                    &adapter,
                    &settings.ble_name_prefix,
                    settings.ble_scan_duration(),
                )
                .await?
                {
                    println!("{}\t{}", tracker.address, tracker.name);
                }
            }
            #[cfg(not(feature = "ble"))]
            warn!("Built without BLE support");
        }
        Commands::Init => {
            service.save()?;
            println!("Wrote {}", service.path().display());
        }
    }

    Ok(())
}
