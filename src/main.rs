//! padawan-force - connect to, configure and update the PadAwan Force macropad.

use std::io::{self, BufRead, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::debug;

use padawan_force_lib::commands;
use padawan_force_lib::config::AppSettings;
use padawan_force_lib::device::{ConnectionManager, PortWatcher, Supervisor};
use padawan_force_lib::serial::sim::{SimBackend, SimulatedDevice};
use padawan_force_lib::serial::{DisplayMode, NativeBackend, SerialBackend, SerialDeviceInfo, PADAWAN_PID, PADAWAN_VID};
use padawan_force_lib::update::{DryRunFlasher, FirmwareUpdateOrchestrator, Flasher, UpdateProgress};

/// Connection manager and firmware updater for the PadAwan Force macropad.
///
/// Environment variables:
///   PADAWAN_PORT  - Preferred serial port
///   RUST_LOG      - Log filter (overrides -v/-q)
#[derive(Parser)]
#[command(name = "padawan-force")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to try first (auto-detected if not specified).
    #[arg(short, long, global = true, env = "PADAWAN_PORT")]
    port: Option<String>,

    /// Verbose output level (-v, -vv for more detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (warnings and errors only).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Run against an in-memory simulated macropad.
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports that look like a PadAwan Force.
    Ports,

    /// Connect once and print connection state and telemetry.
    Status,

    /// Keep the device connected and print status changes until Ctrl-C.
    Watch,

    /// Check that the device answers.
    Ping,

    /// Send a layout JSON file to the device.
    Upload {
        /// Layout file in the device's JSON format.
        file: PathBuf,
    },

    /// Read the layout stored on the device.
    Download {
        /// Use the single-line DOWNLOAD_CONFIG command of older firmware.
        #[arg(long)]
        legacy: bool,
    },

    /// Change what the on-board display shows.
    Display {
        #[arg(value_parser = parse_display_mode)]
        mode: DisplayMode,

        /// Turn the display off while keeping the mode.
        #[arg(long)]
        disable: bool,
    },

    /// Set the device clock (local time when omitted).
    SetTime {
        /// Time as HH:MM.
        #[arg(value_parser = parse_time)]
        time: Option<NaiveTime>,
    },

    /// Compare the device firmware with the latest release.
    CheckUpdate,

    /// Download and flash the latest firmware.
    Update {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,

        /// Flash even if the device already runs the latest version.
        #[arg(long)]
        force: bool,
    },
}

fn parse_display_mode(s: &str) -> Result<DisplayMode, String> {
    s.parse::<DisplayMode>().map_err(|e| e.to_string())
}

fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| format!("expected HH:MM: {}", e))
}

fn simulated_backend() -> SimBackend {
    let backend = SimBackend::new();
    backend.attach(SerialDeviceInfo::usb("SIM0", PADAWAN_VID, PADAWAN_PID), SimulatedDevice::new());
    backend.on_bootloader_reenumerate(
        "SIM0",
        &[SerialDeviceInfo::usb("SIM1", PADAWAN_VID, PADAWAN_PID)],
        Duration::from_millis(500),
    );
    backend
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_progress(progress: UpdateProgress) {
    println!("[{:>3}%] {}", progress.percent, progress.message);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!("padawan-force v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = AppSettings::load(cli.config_path.as_deref());
    if let Some(port) = cli.port.clone() {
        settings.preferred_port = Some(port);
    }

    let backend: Arc<dyn SerialBackend> = if cli.simulate {
        log::info!("Using simulated device on SIM0");
        Arc::new(simulated_backend())
    } else {
        Arc::new(NativeBackend::new())
    };
    let manager = Arc::new(ConnectionManager::new(backend, settings.manager_options()));

    if cli.simulate {
        return run(cli.command, &settings, &manager, DryRunFlasher).await;
    }

    // Only commands that flash need esptool on the machine
    match cli.command {
        Commands::Update { .. } => {
            let flasher = settings.flasher().context("No flashing tool available")?;
            run(cli.command, &settings, &manager, flasher).await
        }
        command => run(command, &settings, &manager, DryRunFlasher).await,
    }
}

async fn run<F: Flasher>(
    command: Commands,
    settings: &AppSettings,
    manager: &Arc<ConnectionManager>,
    flasher: F,
) -> Result<()> {
    let orchestrator = || {
        FirmwareUpdateOrchestrator::new(
            Arc::clone(manager),
            settings.release_locator(),
            flasher,
            PortWatcher::new(manager.scanner().clone(), settings.watch_policy()),
            settings.update_options(),
        )
    };

    match command {
        Commands::Ports => {
            let ports = commands::list_ports(manager)?;
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                match (port.vid, port.pid) {
                    (Some(vid), Some(pid)) => println!(
                        "{}  {:04X}:{:04X}  {}",
                        port.port_name,
                        vid,
                        pid,
                        port.product.as_deref().unwrap_or("")
                    ),
                    _ => println!("{}", port.port_name),
                }
            }
        }
        Commands::Status => {
            let report = commands::device_status(manager).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Watch => {
            let mut events = manager.subscribe_events();
            let handle = Supervisor::new(Arc::clone(manager)).start();
            println!("Watching for the device, Ctrl-C to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => println!(
                            "{}  {:?} -> {:?}  {}",
                            event.at.format("%H:%M:%S"),
                            event.previous.status,
                            event.current.status,
                            event
                                .current
                                .active_port
                                .as_deref()
                                .or(event.current.last_error.as_deref())
                                .unwrap_or("")
                        ),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Missed {} status events", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            handle.stop().await;
            manager.disconnect().await;
        }
        Commands::Ping => {
            let elapsed = commands::ping_device(manager).await?;
            println!("PONG in {} ms", elapsed.as_millis());
        }
        Commands::Upload { file } => {
            let document = commands::upload_layout_file(manager, &settings.layout_store(), &file).await?;
            println!("Uploaded {} layer(s)", document.layers.len());
        }
        Commands::Download { legacy } => {
            let store = settings.layout_store();
            let document = commands::download_layout(manager, &store, legacy).await?;
            println!("{}", document.to_json()?);
            log::info!("Saved to {}", store.path().display());
        }
        Commands::Display { mode, disable } => {
            commands::set_display(manager, mode, !disable).await?;
            println!("Display set to {}{}", mode, if disable { " (off)" } else { "" });
        }
        Commands::SetTime { time } => {
            commands::set_device_time(manager, time).await?;
            println!("Device clock set");
        }
        Commands::CheckUpdate => {
            let check = commands::check_for_update(manager, &orchestrator()).await?;
            println!(
                "Current: {}  Latest: {}  ({})",
                check.current_version.as_deref().unwrap_or("unknown"),
                check.latest_version,
                check.reason
            );
        }
        Commands::Update { yes, force } => {
            if !yes && !confirm("Flash the latest PadAwan Force firmware?")? {
                println!("Cancelled");
                return Ok(());
            }
            let orchestrator = orchestrator();
            match commands::run_update(manager, &orchestrator, force, &print_progress).await? {
                Some(report) => println!(
                    "Firmware {} installed via {}",
                    report.release.firmware_version, report.flash_port
                ),
                None => println!("Firmware is already up to date"),
            }
        }
    }

    Ok(())
}
