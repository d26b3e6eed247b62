//! # AAS-Uplink Agent
//!
//! Integration daemon that ingests Asset Administration Shell content from
//! package files or an AAS repository and republishes every leaf property
//! onto an MQTT broker along two planes: retained UNS topics and a
//! Sparkplug B session. A command path accepts broker messages and writes
//! them back into the repository.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod config;
mod mqtt;
mod observability;
mod retained;
mod runtime;
mod sparkplug;
mod watcher;

use config::AgentConfig;
use aas_uplink_core::MappingConfig;

/// Exit codes: 0 success, 2 config error, 3 persistence error, 4 I/O fatal,
/// 1 other.
const EXIT_CONFIG: u8 = 2;
const EXIT_PERSISTENCE: u8 = 3;
const EXIT_IO_FATAL: u8 = 4;
const EXIT_OTHER: u8 = 1;

#[derive(Parser)]
#[command(
    name = "aas-uplink",
    version,
    about = "Republish AAS content onto UNS retained topics and Sparkplug B"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon
    Run {
        /// Path to the configuration document
        #[arg(short, long, default_value = "config/config.yaml")]
        config: PathBuf,
        /// Path to the hierarchy mapping table
        #[arg(short, long, default_value = "config/mappings.yaml")]
        mappings: PathBuf,
    },
    /// Validate the configuration without starting
    Validate {
        /// Path to the configuration document
        #[arg(short, long, default_value = "config/config.yaml")]
        config: PathBuf,
        /// Path to the hierarchy mapping table
        #[arg(short, long, default_value = "config/mappings.yaml")]
        mappings: PathBuf,
    },
    /// Interrogate a running instance through its health endpoint
    Status {
        /// Path to the configuration document
        #[arg(short, long, default_value = "config/config.yaml")]
        config: PathBuf,
    },
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, mappings } => run(&config, &mappings).await,
        Command::Validate { config, mappings } => validate(&config, &mappings),
        Command::Status { config } => status(&config).await,
        Command::Version => {
            println!("aas-uplink {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

async fn run(config_path: &PathBuf, mappings_path: &PathBuf) -> ExitCode {
    let config = match AgentConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    observability::init_tracing(&config.observability);

    let mappings = match MappingConfig::from_yaml(mappings_path) {
        Ok(mappings) => mappings,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting AAS-Uplink");
    match runtime::run(config, mappings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "Agent failed");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if cause.downcast_ref::<aas_uplink_state::StateError>().is_some() {
            return EXIT_PERSISTENCE;
        }
        if cause.downcast_ref::<mqtt::BrokerRefused>().is_some() {
            return EXIT_IO_FATAL;
        }
    }
    EXIT_OTHER
}

fn validate(config_path: &PathBuf, mappings_path: &PathBuf) -> ExitCode {
    let result: Result<(AgentConfig, MappingConfig)> = (|| {
        let config = AgentConfig::load(config_path)?;
        let mappings = MappingConfig::from_yaml(mappings_path)?;
        Ok((config, mappings))
    })();

    match result {
        Ok((config, mappings)) => {
            println!("Configuration valid: {}", config_path.display());
            println!("  MQTT: {}:{}", config.mqtt.host, config.mqtt.port);
            println!("  Retained plane: {}", config.uns.enabled);
            println!(
                "  Sparkplug: {} (group {}, edge node {})",
                config.sparkplug.enabled, config.sparkplug.group_id, config.sparkplug.edge_node_id
            );
            println!("  File watcher: {}", config.file_watcher.enabled);
            println!("  Repository client: {}", config.repo_client.enabled);
            println!("  Command path: {}", config.sync.enabled);
            println!(
                "  Mappings: {} exact, {} patterns",
                mappings.assets.len(),
                mappings.patterns.len()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn status(config_path: &PathBuf) -> ExitCode {
    let config = match AgentConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let base = format!("http://localhost:{}", config.observability.health_port);
    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_OTHER);
        }
    };

    match client.get(format!("{base}/healthz")).send().await {
        Ok(response) if response.status().is_success() => {
            println!("Status: running");
            let ready = client
                .get(format!("{base}/readyz"))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            println!("Broker connected: {ready}");
            ExitCode::SUCCESS
        }
        Ok(response) => {
            eprintln!("health endpoint returned {}", response.status());
            ExitCode::from(EXIT_OTHER)
        }
        Err(_) => {
            eprintln!("agent is not running or health endpoint unreachable");
            ExitCode::from(EXIT_OTHER)
        }
    }
}
