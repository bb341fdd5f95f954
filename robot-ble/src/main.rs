//! Command-line driver for the destination-delivery robot
//!
//! Finds the robot, sends it to a destination and confirms its arrival. Built
//! without the `btleplug` feature (or run with `--sim`) it drives an in-memory
//! robot instead of the radio.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use robot_ble_controller::sim::SimAdapter;
use robot_ble_controller::{
    AllowAll, BleAdapter, Error, Mismatch, SessionConfig, SessionController, SessionEvent,
    SessionHandle, config,
};
use robot_proto::{Destination, RoleSet};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error>;

const SIM_ADDRESS: &str = "00:00:00:00:00:01";

#[derive(Parser)]
#[command(name = "robot-ble")]
#[command(about = "Drive the delivery robot over BLE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Config file [default: $ROBOT_HOME/config.json]
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Scan duration in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
    /// Only consider devices whose name starts with this
    #[arg(long, global = true)]
    prefix: Option<String>,
    /// Protocol variant: minimal, standard or full
    #[arg(long, global = true, value_parser = parse_protocol)]
    protocol: Option<RoleSet>,
    /// Use the simulated robot
    #[arg(long, global = true)]
    sim: bool,
    /// Log more (-v debug, -vv trace); RUST_LOG wins when set
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for robots
    Scan,
    /// Send the robot to a destination and answer its arrival
    Goto {
        /// a, b, c or d
        destination: Destination,
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        /// Decline the arrival instead of confirming it
        #[arg(long)]
        reject: bool,
    },
    /// Connect and print the session state
    Status {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        /// Keep printing updates for this many seconds
        #[arg(short, long, default_value = "0")]
        watch: u64,
    },
}

fn parse_protocol(name: &str) -> Result<RoleSet, String> {
    RoleSet::preset(name).map_err(|e| e.to_string())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Config file, then command-line overrides
fn load_config(cli: &Cli) -> Result<SessionConfig, BoxError> {
    let path = cli.config.clone().or_else(config::default_config_path);
    let mut config = match &path {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    if let Some(timeout) = cli.timeout {
        config.scan_timeout_secs = timeout;
    }
    if let Some(prefix) = &cli.prefix {
        config.name_prefix = Some(prefix.clone());
    }
    if let Some(protocol) = &cli.protocol {
        config.protocol = protocol.clone();
    }
    config.validate()?;

    info!(
        path = ?path,
        protocol = config.protocol.preset_name().unwrap_or("custom"),
        "config loaded"
    );
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(&cli)?;
    start(cli.sim, config, cli.command).await
}

fn simulated_robot() -> SimAdapter {
    SimAdapter::new()
        .with_peer(SIM_ADDRESS, Some("Robot-Sim"))
        .with_autopilot(Duration::from_secs(3))
}

#[cfg(feature = "btleplug")]
async fn start(sim: bool, config: SessionConfig, command: Commands) -> Result<(), BoxError> {
    if sim {
        return run(simulated_robot(), config, command).await;
    }
    let adapter = robot_ble_controller::ble::BtleplugAdapter::new().await?;
    run(adapter, config, command).await
}

#[cfg(not(feature = "btleplug"))]
async fn start(sim: bool, config: SessionConfig, command: Commands) -> Result<(), BoxError> {
    if !sim {
        warn!("built without the btleplug feature, using the simulated robot");
    }
    run(simulated_robot(), config, command).await
}

async fn run<A: BleAdapter>(
    adapter: A,
    config: SessionConfig,
    command: Commands,
) -> Result<(), BoxError> {
    let session = SessionController::spawn(adapter, AllowAll, config);

    let result = match command {
        Commands::Scan => scan(&session).await,
        Commands::Goto { destination, device, reject } => {
            goto(&session, destination, device.as_deref(), !reject).await
        }
        Commands::Status { device, watch } => status(&session, device.as_deref(), watch).await,
    };
    session.disconnect().await?;

    if let Err(error) = &result {
        if let Some(error) = error.downcast_ref::<Error>() {
            eprintln!("{}", error.hint());
        }
    }
    result
}

fn matches_target(target: Option<&str>, address: &str, name: Option<&str>) -> bool {
    match target {
        None => true,
        Some(t) => address.eq_ignore_ascii_case(t) || name.is_some_and(|n| n.contains(t)),
    }
}

async fn scan(session: &SessionHandle) -> Result<(), BoxError> {
    let mut events = session.subscribe();
    session.start_scan().await?;
    println!("Scanning for robots...");

    loop {
        match events.recv().await {
            Ok(SessionEvent::PeerDiscovered(peer)) => {
                let name = peer.name.as_deref().unwrap_or("Unknown");
                let rssi =
                    peer.rssi.map(|r| format!("{r} dBm")).unwrap_or_else(|| "N/A".to_string());
                println!("  {name} ({}) RSSI: {rssi}", peer.address);
            }
            Ok(SessionEvent::ScanStopped(reason)) => {
                info!(?reason, "scan finished");
                break;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed session events"),
            Err(RecvError::Closed) => return Err(Error::Closed.into()),
        }
    }

    let peers = session.peers().await?;
    println!("\nFound {} robots", peers.len());
    Ok(())
}

/// Scan until a matching robot shows up; returns its address
async fn find_robot(session: &SessionHandle, target: Option<&str>) -> Result<String, BoxError> {
    let mut events = session.subscribe();
    session.start_scan().await?;
    println!("Scanning for robots...");

    loop {
        match events.recv().await {
            Ok(SessionEvent::PeerDiscovered(peer))
                if matches_target(target, &peer.address, peer.name.as_deref()) =>
            {
                println!("Found {} ({})", peer.name.as_deref().unwrap_or("Unknown"), peer.address);
                return Ok(peer.address);
            }
            Ok(SessionEvent::ScanStopped(_)) => return Err("No robot found".into()),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed session events"),
            Err(RecvError::Closed) => return Err(Error::Closed.into()),
        }
    }
}

async fn connect(session: &SessionHandle, target: Option<&str>) -> Result<(), BoxError> {
    let address = find_robot(session, target).await?;
    println!("Connecting...");
    session.connect(address).await?;
    println!("Connected! Robot is {}", session.state().robot);
    Ok(())
}

async fn goto(
    session: &SessionHandle,
    destination: Destination,
    target: Option<&str>,
    confirm: bool,
) -> Result<(), BoxError> {
    connect(session, target).await?;

    if !session.state().destination_selectable {
        println!("Robot is busy, waiting for it to become idle...");
        let state = session.wait_for(|s| s.destination_selectable || !s.is_ready()).await?;
        if !state.is_ready() {
            return Err(Error::NotReady.into());
        }
    }

    let ack = session.select_destination(destination).await?;
    println!("Destination {destination} sent ({} ms)", ack.latency.as_millis());

    let state = session.wait_for(|s| s.arrival_confirmable || !s.is_ready()).await?;
    if !state.is_ready() {
        return Err(Error::NotReady.into());
    }
    if let Some(message) = &state.last_message {
        println!("Robot: {message}");
    }

    match session.confirm_arrival(confirm).await {
        Ok(_) if confirm => println!("Arrival confirmed"),
        Ok(_) => println!("Arrival declined"),
        Err(Error::ProtocolMismatch(Mismatch::RoleNotConfigured(_))) => {
            println!("This robot does not take arrival confirmations")
        }
        Err(error) => return Err(error.into()),
    }
    Ok(())
}

async fn status(session: &SessionHandle, target: Option<&str>, watch: u64) -> Result<(), BoxError> {
    connect(session, target).await?;
    println!("{}", serde_json::to_string_pretty(&session.state())?);
    if watch == 0 {
        return Ok(());
    }

    let mut events = session.subscribe();
    let deadline = tokio::time::sleep(Duration::from_secs(watch));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(()),
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged(state)) => {
                    println!("{}", serde_json::to_string_pretty(&state)?);
                }
                Ok(SessionEvent::RobotMessage(message)) => println!("Robot: {message}"),
                Ok(SessionEvent::Disconnected { reason }) => return Err(reason.into()),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed session events"),
                Err(RecvError::Closed) => return Err(Error::Closed.into()),
            },
        }
    }
}
