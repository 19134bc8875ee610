#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # ntctl
//!
//! Ground-side controller for cellular/NTN IoT endpoints that speak AT
//! commands over a serial line.
//!
//! ## Subcommands
//!
//! - `ntctl connect` — load config, bring the device up, print events as
//!   they arrive until interrupted
//! - `ntctl probe` — open the transport only, send a bare `AT`, print the
//!   raw reply, exit

use clap::{Parser, Subcommand};
use tracing::info;

use ntctl::config::Config;
use ntctl::engine::{Engine, DEFAULT_FINAL};
use ntctl::session::{Session, SessionEvent};
use ntctl::transport::Transport;

/// Ground-side controller for cellular/NTN IoT endpoints.
#[derive(Parser)]
#[command(name = "ntctl", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the configured device up and stream session events.
    Connect {
        /// Path to a TOML config file. Defaults to `ntctl.toml` in CWD.
        #[arg(long)]
        config: Option<String>,
    },
    /// Open the transport, send a bare `AT`, print the reply, exit.
    Probe {
        #[arg(long)]
        config: Option<String>,
    },
}

fn init_logging(level: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Connect { config } => {
            let config = Config::load(config.as_deref());
            init_logging(&config.logging.level);
            run_connect(config).await;
        }
        Commands::Probe { config } => {
            let config = Config::load(config.as_deref());
            init_logging(&config.logging.level);
            run_probe(&config).await;
        }
    }
}

async fn run_connect(config: Config) {
    let session = Session::new();
    let mut events = session.subscribe();

    let device = config.serial.device.clone();
    let baud = config.serial.baud;
    let kind = config.profile_kind();
    let net = config.network_params();

    if let Err(e) = session.connect(&device, baud, kind, net).await {
        eprintln!("failed to open {device}: {e}");
        std::process::exit(1);
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::RawLog(_)) => continue,
                    Ok(event) => println!("{}", serde_json::to_string(&event).unwrap_or_default()),
                    Err(_) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, disconnecting");
                session.disconnect().await;
                break;
            }
        }
    }
}

async fn run_probe(config: &Config) {
    let (transport, lines_rx) = match Transport::open(&config.serial.device, config.serial.baud) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("failed to open {}: {e}", config.serial.device);
            std::process::exit(1);
        }
    };
    let engine = Engine::new(transport, lines_rx);

    match engine
        .send_command("AT", DEFAULT_FINAL, std::time::Duration::from_secs(5))
        .await
    {
        Ok((ok, lines)) => {
            println!("ok={ok}");
            for line in lines {
                println!("{line}");
            }
        }
        Err(e) => {
            eprintln!("probe failed: {e}");
            std::process::exit(1);
        }
    }
}
