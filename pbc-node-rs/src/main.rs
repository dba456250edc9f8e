//! PBC Node
//!
//! Zone controller node for priority-based coordination. Runs one zone
//! against a simulated device and talks to its peers over TCP.

use clap::Parser;
use pbc_core::{Config, ConfigStore, Listener, Node, Setting, SimulatedDevice, TcpConnector};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// PBC zone controller node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the node's JSON config file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Initial simulated temperature (defaults to the setpoint)
    #[arg(short, long)]
    temperature: Option<f64>,

    /// Simulated sensor noise, in degrees either side
    #[arg(short, long, default_value = "0.0")]
    noise: f64,
}

/// Operator commands read from stdin
#[derive(Debug)]
enum Command {
    Set(Setting),
    Temperature(f64),
    Status,
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [] => Ok(None),
        ["set", field, value] => Setting::parse(field, value)
            .map(|s| Some(Command::Set(s)))
            .map_err(|e| e.to_string()),
        ["temp", value] => value
            .parse::<f64>()
            .map(|t| Some(Command::Temperature(t)))
            .map_err(|e| format!("invalid temperature: {}", e)),
        ["status"] => Ok(Some(Command::Status)),
        _ => Err("unknown command".to_string()),
    }
}

/// Log subscriber. Targets stay visible so `pbc::invariant` reports stand
/// out from operational logs.
fn subscriber<W>(filter: EnvFilter, writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing::subscriber::set_global_default(subscriber(filter, io::stdout))?;

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    info!(
        "PBC node for zone {} of {} starting (cap {})",
        config.zone_id, config.num_zones, config.concurrency_cap
    );

    let settings = match &config.settings_path {
        Some(path) => ConfigStore::open(path, config.default_settings())?,
        None => ConfigStore::in_memory(config.default_settings()),
    };
    let settings = Arc::new(settings);

    let temperature = args.temperature.unwrap_or(config.setpoint);
    let device = Arc::new(SimulatedDevice::new(temperature).with_noise(args.noise));
    let connector = Arc::new(TcpConnector::new(config.peers.clone()));

    let listener = Listener::bind(config.listen).await?;
    info!("Listening on {}", listener.local_addr()?);

    let node = Node::new(&config, device.clone(), settings, connector)?;
    let handle = node.start();
    listener.start_receive(handle.inbound_sender(), handle.shutdown_signal());

    // Spawn stdin handler for operator commands
    let (command_tx, mut command_rx) = mpsc::channel::<Command>(16);
    std::thread::spawn(move || {
        println!("\nCommands:");
        println!("  set mode <cool|heat|off>            - Change operating mode");
        println!("  set setpoint <degrees>              - Change setpoint (60-80)");
        println!("  set control <coordinated|local>     - Follow leader or run locally");
        println!("  temp <degrees>                      - Set simulated temperature");
        println!("  status                              - Show node status\n");

        let stdin = io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            match parse_command(&line) {
                Ok(Some(command)) => {
                    if command_tx.blocking_send(command).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => println!("{}", e),
            }
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            Some(command) = command_rx.recv() => match command {
                Command::Set(setting) => {
                    if let Err(e) = handle.state().update_setting(setting) {
                        warn!("Settings update failed: {}", e);
                    }
                }
                Command::Temperature(t) => device.set_temperature(t),
                Command::Status => {
                    let state = handle.state();
                    let current = state.settings();
                    println!(
                        "zone {} | leader {:?} | live {:?} | mode {} | user {} @ {:.1} ({:?})",
                        state.zone(),
                        state.current_leader(),
                        state.live_zones(),
                        state.current_mode(),
                        current.mode,
                        current.setpoint,
                        current.control,
                    );
                }
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}
