//! Binary entrypoint for the meshbridge CLI.
//!
//! Commands:
//! - `start [--host <addr> | --serial <path>]` - run the bridge and the virtual node server
//! - `init` - write a starter `config.toml`
//! - `probe [--timeout <s>]` - connect once, wait for the config capture, print status JSON
//!
//! See the library crate docs for module-level details: `meshbridge::`.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use meshbridge::bridge::MeshBridge;
use meshbridge::config::{Config, TransportKind};
use meshbridge::metrics;
use meshbridge::storage::{JsonStore, MemoryStore, Persistence};
use meshbridge::virtual_node::VirtualNodeServer;

#[derive(Parser)]
#[command(name = "meshbridge")]
#[command(about = "Protocol bridge and virtual node server for Meshtastic devices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge
    Start {
        /// Connect over TCP to this host, overriding the config file
        #[arg(long, conflicts_with = "serial")]
        host: Option<String>,

        /// Connect over serial to this port (e.g. /dev/ttyUSB0), overriding the config file
        #[arg(long)]
        serial: Option<String>,

        /// Do not start the virtual node server
        #[arg(long)]
        no_virtual_node: bool,
    },
    /// Write a default configuration file
    Init,
    /// Connect, wait for the device config and print a status summary as JSON
    Probe {
        /// Seconds to wait before giving up
        #[arg(short, long, default_value_t = 20)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start {
            host,
            serial,
            no_virtual_node,
        } => {
            let mut config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            if let Some(host) = host {
                config.device.transport = TransportKind::Tcp;
                config.device.host = host;
            }
            if let Some(path) = serial {
                config.device.transport = TransportKind::Serial;
                config.device.serial_port = path;
            }
            config.validate()?;
            info!("Starting meshbridge v{}", env!("CARGO_PKG_VERSION"));
            run(config, no_virtual_node).await?;
        }
        Commands::Init => {
            if std::path::Path::new(&cli.config).exists() {
                return Err(anyhow!("{} already exists; not overwriting", cli.config));
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Probe { timeout } => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            let ok = probe(config, Duration::from_secs(timeout)).await?;
            std::process::exit(if ok { 0 } else { 1 });
        }
    }

    Ok(())
}

async fn run(config: Config, no_virtual_node: bool) -> Result<()> {
    let store: Arc<dyn Persistence> = Arc::new(JsonStore::open(&config.storage.data_dir)?);
    let bridge = MeshBridge::new(config.clone(), store)?;

    if config.device.auto_connect {
        info!("Connecting to {}", config.device.describe());
        bridge.connect().await;
    } else {
        info!("auto_connect disabled; waiting without a device link");
    }

    let server = if config.virtual_node.enabled && !no_virtual_node {
        let server = VirtualNodeServer::new(bridge.clone(), config.virtual_node.clone());
        match server.start().await {
            Ok(addr) => info!("Virtual node accepting clients on {}", addr),
            Err(e) => error!("Virtual node disabled: {}", e),
        }
        Some(server)
    } else {
        None
    };

    let mut capture = bridge.config_capture();
    let watcher = tokio::spawn(async move {
        while let Some((generation, identity)) = capture.next().await {
            info!(
                "Device ready: {} '{}' firmware {} (connection {})",
                identity.node_id,
                identity.long_name,
                identity.firmware_version.as_deref().unwrap_or("unknown"),
                generation
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    watcher.abort();
    if let Some(server) = server {
        server.stop();
    }
    bridge.shutdown().await;
    let stats = metrics::snapshot();
    info!(
        "Bridge stopped (frames rx={} tx={}, reconnects={})",
        stats.frames_rx, stats.frames_tx, stats.reconnects
    );
    Ok(())
}

async fn probe(config: Config, timeout: Duration) -> Result<bool> {
    let bridge = MeshBridge::new(config, Arc::new(MemoryStore::new()))?;
    bridge.connect().await;
    let ready = match bridge.wait_for_capture(timeout).await {
        Ok(_) => true,
        Err(e) => {
            warn!("Probe did not complete: {}", e);
            false
        }
    };
    let payload = serde_json::json!({
        "status": if ready { "ok" } else { "incomplete" },
        "connection": bridge.connection_status(),
        "metrics": metrics::snapshot(),
        "timeout_seconds": timeout.as_secs(),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    bridge.shutdown().await;
    Ok(ready)
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config.as_ref().and_then(|c| c.logging.file.clone()).and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| eprintln!("Cannot open log file {}: {}", path, e))
            .ok()
    });
    let security_path = config.as_ref().and_then(|c| c.logging.security_file.clone());
    let file = log_file.map(|f| Arc::new(std::sync::Mutex::new(f)));
    // Under a service manager stdout is not a TTY; the log file is enough there.
    let is_tty = atty::is(atty::Stream::Stdout);

    builder.format(move |fmt, record| {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let line = format!("{} [{}] {}", ts, record.level(), record.args());

        if let Some(ref f) = file {
            if let Ok(mut guard) = f.lock() {
                let _ = writeln!(guard, "{}", line);
            }
        }
        if record.target() == "security" {
            if let Some(ref sec_path) = security_path {
                if let Ok(mut sf) = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(sec_path)
                {
                    let _ = writeln!(sf, "{}", line);
                }
            }
        }
        if file.is_none() || is_tty {
            writeln!(fmt, "{}", line)
        } else {
            Ok(())
        }
    });
    let _ = builder.try_init();
}
