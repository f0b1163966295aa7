//! dps-mqtt - Main Entry Point
//!
//! Registers a device with the provisioning service over MQTT and prints the
//! assignment as JSON.

use clap::{Parser, Subcommand};
use dps_mqtt::config::ClientConfig;
use dps_mqtt::observability::{init_default_logging, level_for_verbosity, metrics};
use dps_mqtt::provisioning::{ProvisioningEvent, ProvisioningSession, RegistrationClient};
use dps_mqtt::transport::mqtt::RumqttcConnector;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Device provisioning over MQTT
#[derive(Parser)]
#[command(name = "dps-mqtt")]
#[command(about = "Register a device with the provisioning service over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the configured device and print its assignment
    Register {
        /// Custom allocation payload as JSON, replacing the configured one
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,
    },
    /// Validate the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(level_for_verbosity(cli.verbose));

    info!("Starting dps-mqtt v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Register { payload } => run_registration(config, payload).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in ["dps.toml", "config/dps.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass one with -c/--config or create dps.toml".into())
}

async fn run_registration(
    config: ClientConfig,
    payload: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut request = config.registration_request();
    if let Some(payload) = payload {
        request = request.with_payload(serde_json::from_str(&payload)?);
    }

    let settings = config.provisioning_settings()?;
    let (session, mut events) =
        ProvisioningSession::new(Arc::new(RumqttcConnector::default()), settings);

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ProvisioningEvent::StateChanged(state) => debug!(%state, "Session state"),
                ProvisioningEvent::Error(e) => warn!(error = %e, "Session error"),
            }
        }
    });

    let mut client = RegistrationClient::new(session.clone());
    if let Some(timeout) = config.timeout() {
        client = client.with_timeout(timeout);
    }

    info!(registration_id = %request.registration_id, "Registering device");
    let outcome = tokio::select! {
        outcome = client.register(request) => outcome,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl-C, cancelling registration...");
            session.cancel().await?;
            session.disconnect().await?;
            return Err("registration cancelled".into());
        }
    };

    debug!(metrics = ?metrics().snapshot(), "Registration metrics");
    let state = outcome?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn handle_config_command(
    config: &ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
