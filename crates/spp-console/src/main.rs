//! SPP Console - terminal front-end for the Bluetooth serial session manager
//!
//! Reads one command per line from stdin and renders session events as they
//! happen. Intents run in the background so that `stop` and `disconnect`
//! can cut short a scan or a connect that is still in progress.
//!
//! Backends:
//! - `simulated` (default) - a scripted neighbourhood of echoing devices
//! - `bluez` - the local radio via BlueZ (build with `--features bluez`)

mod commands;
mod render;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use spp_session::{Platform, SessionConfig, SessionCoordinator};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{Command, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Scripted devices, no radio needed
    Simulated,
    /// Linux BlueZ
    Bluez,
}

#[derive(Parser)]
#[command(name = "spp-console")]
#[command(about = "Discover Bluetooth serial devices and talk to them")]
struct Args {
    /// Platform backend
    #[arg(long, short, value_enum, default_value = "simulated")]
    backend: Backend,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Give up on a connect after this long (e.g. "10s")
    #[arg(long, value_parser = humantime::parse_duration)]
    connect_timeout: Option<Duration>,

    /// RFCOMM channel to connect to
    #[arg(long)]
    channel: Option<u8>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(timeout) = args.connect_timeout {
        config.connect_timeout = Some(timeout);
    }
    if let Some(channel) = args.channel {
        config.rfcomm_channel = channel;
    }
    config.validate()?;

    let platform = build_platform(args.backend, &config).await?;
    let coordinator = SessionCoordinator::new(platform, config)?;
    let printer = tokio::spawn(render::print_events(coordinator.events()));
    coordinator.start().await?;

    info!(backend = ?args.backend, version = spp_session::VERSION, "spp-console ready");
    println!("{}", render::status(&coordinator.snapshot()));
    println!("type `help` for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match commands::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => dispatch(&coordinator, command),
                    Ok(None) => {}
                    Err(e) => render::say(e.to_string()),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    coordinator.shutdown().await;
    printer.abort();
    Ok(())
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let builder = FmtSubscriber::builder().with_writer(std::io::stderr);
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let level = if verbose { Level::DEBUG } else { Level::WARN };
        let subscriber = builder.with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

async fn build_platform(backend: Backend, config: &SessionConfig) -> anyhow::Result<Platform> {
    match backend {
        Backend::Simulated => Ok(spp_session::MockPlatform::simulated().platform()),
        #[cfg(feature = "bluez")]
        Backend::Bluez => {
            let bluez = spp_session::BluezPlatform::new(config)
                .await
                .context("opening the BlueZ adapter")?;
            Ok(bluez.platform())
        }
        #[cfg(not(feature = "bluez"))]
        Backend::Bluez => {
            let _ = config;
            anyhow::bail!("built without BlueZ support; rebuild with `--features bluez`")
        }
    }
}

/// Run a command; intents run in the background
fn dispatch(coordinator: &SessionCoordinator, command: Command) {
    match command {
        Command::Devices => println!("{}", render::devices(&coordinator.snapshot())),
        Command::Status => println!("{}", render::status(&coordinator.snapshot())),
        Command::Help => println!("{}", commands::HELP),
        Command::Quit => {}
        intent => {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                debug!(?intent, "Running intent");
                if let Err(e) = run_intent(&coordinator, intent).await {
                    render::say(e);
                }
            });
        }
    }
}

async fn run_intent(coordinator: &SessionCoordinator, intent: Command) -> Result<(), String> {
    let result = match intent {
        Command::Scan => coordinator.request_scan().await,
        Command::Stop => coordinator.request_stop_scan().await,
        Command::Connect(target) => {
            let address = resolve(coordinator, target)?;
            coordinator.request_connect(&address).await
        }
        Command::Disconnect => coordinator.request_disconnect().await,
        Command::Send(text) => coordinator.request_send(&text).await,
        Command::Settings => coordinator.open_system_settings().await,
        Command::Devices | Command::Status | Command::Help | Command::Quit => Ok(()),
    };
    result.map_err(|e| render::intent_error(&e))
}

/// Turn a `connect` target into an address
fn resolve(coordinator: &SessionCoordinator, target: Target) -> Result<String, String> {
    match target {
        Target::Address(address) => Ok(address),
        Target::Index(index) => coordinator
            .snapshot()
            .devices
            .devices()
            .get(index - 1)
            .map(|device| device.address.clone())
            .ok_or_else(|| format!("no device #{} (type `devices`)", index)),
    }
}
