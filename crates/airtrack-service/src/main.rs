//! airtrack - sensor tracking daemon.
//!
//! Run with: `cargo run -p airtrack-service -- run`

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use airtrack_core::supervisor::normalize_address;
use airtrack_core::{ConnectionState, DeviceFamily, ScanOptions, scan_with_options};
use airtrack_service::config::default_config_path;
use airtrack_service::{App, Config};
use airtrack_store::{DeviceRecord, Store};

/// airtrack - relay environmental sensor readings to an MQTT broker.
#[derive(Parser, Debug)]
#[command(name = "airtrack")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground (default behavior).
    Run,

    /// Manage known devices.
    Devices {
        #[command(subcommand)]
        action: DeviceAction,
    },

    /// Inspect the telemetry queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Manage the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum DeviceAction {
    /// List known devices and their states.
    List,

    /// Add a device.
    Add {
        /// Hardware address.
        address: String,
        /// Device family (AirBeam3, AirBeamMini, AirBeam2, RuuviTag).
        family: DeviceFamily,
        /// Friendly label.
        #[arg(short, long)]
        label: Option<String>,
        /// Connect whenever the daemon runs.
        #[arg(long)]
        connect: bool,
    },

    /// Forget a device.
    Remove {
        /// Hardware address.
        address: String,
    },

    /// Scan for nearby supported devices.
    Scan {
        /// Scan duration in seconds.
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Show undelivered message counts.
    Status,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path, args.config.is_some())?;
    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }

    match args.command {
        Some(Command::Run) | None => run(config).await,
        Some(Command::Devices { action }) => handle_devices(action, &config).await,
        Some(Command::Queue { action }) => handle_queue(action, &config),
        Some(Command::Config { action }) => handle_config(action, &config, &config_path),
    }
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("airtrack={level}").parse()?)
                .add_directive(format!("airtrack_core={level}").parse()?)
                .add_directive(format!("airtrack_service={level}").parse()?),
        )
        .init();
    Ok(())
}

fn load_config(path: &Path, explicit: bool) -> anyhow::Result<Config> {
    if explicit || path.exists() {
        Config::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(Config::default())
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let app = App::start(&config).await?;
    info!(
        "airtrack running, tracking state: {}",
        app.tracking.state()
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    app.shutdown().await;
    Ok(())
}

async fn handle_devices(action: DeviceAction, config: &Config) -> anyhow::Result<()> {
    match action {
        DeviceAction::List => {
            let store = Store::open(&config.storage.path)?;
            let devices = store.list_devices()?;
            if devices.is_empty() {
                println!("No devices");
                return Ok(());
            }
            println!(
                "{:<20} {:<12} {:<24} {:<14} {:<14}",
                "ADDRESS", "FAMILY", "LABEL", "DESIRED", "ACTUAL"
            );
            for device in devices {
                println!(
                    "{:<20} {:<12} {:<24} {:<14} {:<14}",
                    device.address,
                    device.family,
                    device.label,
                    device.desired_state,
                    device.actual_state
                );
            }
        }
        DeviceAction::Add {
            address,
            family,
            label,
            connect,
        } => {
            let store = Store::open(&config.storage.path)?;
            let address = normalize_address(&address);
            if let Some(existing) = store.get_device(&address)?
                && existing.family != family
            {
                anyhow::bail!(
                    "{} is already known as {}; remove it first",
                    address,
                    existing.family
                );
            }
            let mut record = DeviceRecord::new(address.as_str(), family);
            if let Some(label) = label {
                record = record.with_label(label);
            }
            if connect {
                record.desired_state = ConnectionState::Connected;
            }
            store.upsert_device(&record)?;
            println!("Added {} ({})", record.label, record.address);
        }
        DeviceAction::Remove { address } => {
            let store = Store::open(&config.storage.path)?;
            let address = normalize_address(&address);
            if store.delete_device(&address)? {
                println!("Removed {}", address);
            } else {
                anyhow::bail!("Unknown device {}", address);
            }
        }
        DeviceAction::Scan { timeout } => {
            let options = ScanOptions::new().duration(Duration::from_secs(timeout));
            let devices = scan_with_options(options).await?;
            if devices.is_empty() {
                println!("No supported devices found");
            }
            for device in devices {
                println!(
                    "{:<20} {:<12} {:<32} {}",
                    device.identifier,
                    device
                        .family
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    device.name.as_deref().unwrap_or("-"),
                    device
                        .rssi
                        .map(|r| format!("{} dBm", r))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn handle_queue(action: QueueAction, config: &Config) -> anyhow::Result<()> {
    match action {
        QueueAction::Status => {
            let store = Store::open(&config.storage.path)?;
            let stats = store.queue_stats()?;
            println!("Pending:   {}", stats.pending);
            println!("In flight: {}", stats.in_flight);
            println!("Unowned:   {}", stats.unowned);
            if let Some(next) = store.next_pending()? {
                println!(
                    "Oldest:    #{} {} queued {}",
                    next.id,
                    next.message.kind.as_str(),
                    next.message.enqueued_at
                );
            }
        }
    }
    Ok(())
}

fn handle_config(action: ConfigAction, config: &Config, path: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote {}", path.display());
        }
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(config)?);
            if let Err(e) = config.validate() {
                eprintln!("{}", e);
            }
        }
    }
    Ok(())
}
