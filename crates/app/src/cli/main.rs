//! House Audio node CLI
//!
//! ```bash
//! # Run the node until Ctrl-C
//! house-audio run --mode distributed
//!
//! # Inspect the audio graph and the Bluetooth stack
//! house-audio outputs
//! house-audio devices
//!
//! # Write the factory configuration
//! house-audio init-config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use house_audio_core::domain::{
    AudioBackend, BluetoothStack, Collaborators, ConfigManager, Mode, NodeConfig, NodeId,
    NodeOrchestrator,
};
use house_audio_infra::{hardware, BluetoothCtl, PipeWireCli, UdpClockTransport};

#[derive(Parser)]
#[command(name = "house-audio")]
#[command(version)]
#[command(about = "Whole-house Bluetooth audio node", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ~/.config/house-audio/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until interrupted
    Run {
        /// Override the configured mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },

    /// List the speaker outputs of the audio graph
    Outputs,

    /// List the Bluetooth devices the stack knows about
    Devices,

    /// Write the factory configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Standalone,
    Distributed,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Standalone => Mode::Standalone,
            ModeArg::Distributed => Mode::Distributed,
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

fn config_manager(path: Option<PathBuf>) -> Result<ConfigManager> {
    match path {
        Some(path) => Ok(ConfigManager::with_path(path)),
        None => Ok(ConfigManager::new(
            ConfigManager::default_config_dir().context("Cannot locate config directory")?,
        )),
    }
}

async fn node_id(config: &NodeConfig) -> Result<NodeId> {
    if let Some(id) = config.node.id {
        return Ok(NodeId(id));
    }
    let mac = hardware::primary_mac()
        .await
        .context("Cannot read network interfaces")?;
    match mac {
        Some(mac) => Ok(NodeId::from_mac(&mac)),
        None => bail!("No hardware address found; set node.id in the configuration"),
    }
}

async fn run(manager: ConfigManager, mode: Option<ModeArg>) -> Result<()> {
    let mut config = manager.load().await;
    if let Some(mode) = mode {
        config.mode = mode.into();
    }
    config.validate().context("Invalid configuration")?;

    let id = node_id(&config).await?;
    info!(node = %id, mode = ?config.mode, "House Audio node starting");

    let bluetooth = Arc::new(BluetoothCtl::new());
    if let Err(e) = bluetooth.prepare_agent().await {
        warn!(error = %e, "Pairing agent setup failed, continuing");
    }

    let mut collaborators = Collaborators::new(Arc::new(PipeWireCli::new()), bluetooth);
    if config.clock_enabled() {
        collaborators = collaborators.with_clock_transport(Arc::new(UdpClockTransport::new()));
    }

    let node = NodeOrchestrator::new(id, config, collaborators).context("Cannot build node")?;
    node.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C, stopping");
        }
    })
    .await
    .context("Node failed")?;

    let state = node.state().await;
    if !state.last_errors.is_empty() {
        info!(
            errors = %serde_json::to_string(&state.last_errors)?,
            "Last errors per subsystem"
        );
    }
    Ok(())
}

async fn list_outputs() -> Result<()> {
    let backend = PipeWireCli::new();
    let default = backend.default_output().await.ok().flatten();
    let outputs = backend.list_outputs().await.context("Cannot list outputs")?;

    if outputs.is_empty() {
        println!("No outputs found");
    }
    for output in outputs {
        let marker = if Some(&output.id) == default.as_ref() { "*" } else { " " };
        println!(
            "{marker} {:<48} {:<32} {}ch {}Hz",
            output.id,
            output.display_name,
            output.channel_count(),
            output.sample_rate.hz()
        );
    }
    Ok(())
}

async fn list_devices() -> Result<()> {
    let stack = BluetoothCtl::new();
    let devices = stack.scan().await.context("Cannot list Bluetooth devices")?;

    if devices.is_empty() {
        println!("No Bluetooth devices known");
    }
    for device in devices {
        let info = stack.info(&device.mac).await.unwrap_or_default();
        let state = info
            .connection_state()
            .map(|s| format!("{s:?}"))
            .unwrap_or_else(|| "Discovered".to_string());
        let rssi = info
            .rssi
            .map(|r| format!("{r} dBm"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<24} {:<12} audio={:<5} {rssi}",
            device.mac,
            device.name,
            state,
            info.supports_audio()
        );
    }
    Ok(())
}

async fn init_config(manager: ConfigManager, force: bool) -> Result<()> {
    if manager.exists() && !force {
        bail!(
            "{} already exists, use --force to overwrite",
            manager.config_path().display()
        );
    }
    manager
        .save(&NodeConfig::default())
        .await
        .context("Cannot write configuration")?;
    println!("Wrote {}", manager.config_path().display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run { mode } => run(config_manager(cli.config)?, mode).await,
        Commands::Outputs => list_outputs().await,
        Commands::Devices => list_devices().await,
        Commands::InitConfig { force } => init_config(config_manager(cli.config)?, force).await,
    }
}
