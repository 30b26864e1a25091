//! CLI entry point for sensor-daq
//!
//! - `serve`: run the acquisition service until Ctrl-C
//! - `scan`: rebuild the retention window from disk and print what it holds
//! - `query`: send one command to a running service and print the reply
//! - `config`: print the effective configuration
//!
//! # Usage
//!
//! ```bash
//! sensor_daq serve --config config/sensor_daq.toml
//! sensor_daq query '{"command":"get_status"}'
//! SENSOR_DAQ_SAMPLER__RATE_HZ=500 sensor_daq config
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
// mimalloc keeps allocation latency low next to the sampling thread.
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use sensor_daq::config::Settings;
use sensor_daq::data::{FileStore, RetentionManager};
use sensor_daq::{hardware, logging, Service};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_tungstenite::tungstenite::Message;
use tracing::info;

#[derive(Parser)]
#[command(name = "sensor_daq")]
#[command(about = "Continuous accelerometer acquisition with per-second CSV files", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Missing files fall back to defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the acquisition service
    Serve {
        /// Override network.port
        #[arg(long)]
        port: Option<u16>,
        /// Override storage.root
        #[arg(long)]
        storage_root: Option<PathBuf>,
        /// Override sampler.rate_hz
        #[arg(long)]
        rate: Option<u32>,
    },
    /// Rebuild the catalog from disk and print window statistics
    Scan {
        /// Override storage.root
        #[arg(long)]
        storage_root: Option<PathBuf>,
    },
    /// Send one JSON command to a running service and print the reply
    Query {
        /// Command object, e.g. '{"command":"get_status"}'
        command: String,
        /// Service URL (defaults to the configured bind address)
        #[arg(long)]
        url: Option<String>,
        /// Seconds to wait for the reply
        #[arg(long, default_value = "5")]
        timeout: u64,
    },
    /// Print the effective, validated configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve {
            port,
            storage_root,
            rate,
        } => {
            if let Some(port) = port {
                settings.network.port = port;
            }
            if let Some(root) = storage_root {
                settings.storage.root = root;
            }
            if let Some(rate) = rate {
                settings.sampler.rate_hz = rate;
            }
            settings.validate().context("Invalid command-line override")?;
            serve(settings).await
        }
        Commands::Scan { storage_root } => {
            if let Some(root) = storage_root {
                settings.storage.root = root;
            }
            scan(settings)
        }
        Commands::Query {
            command,
            url,
            timeout,
        } => query(&settings, &command, url, Duration::from_secs(timeout)).await,
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

async fn serve(settings: Settings) -> Result<()> {
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;
    let source = hardware::source_from_kind(&settings.sampler.source)?;
    let service = Service::start(&settings, source)
        .await
        .context("Failed to start service")?;

    println!("sensor-daq listening on ws://{}", service.local_addr());
    println!("Press Ctrl+C to stop");
    signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received");

    service.shutdown().await.context("Shutdown incomplete")?;
    Ok(())
}

fn scan(settings: Settings) -> Result<()> {
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;
    let store = Arc::new(
        FileStore::open(&settings.storage.root)
            .with_context(|| format!("Cannot open {}", settings.storage.root.display()))?,
    );
    let retention = RetentionManager::new(store, settings.storage.max_files);
    retention.restore();

    let summary = retention.summary();
    let view = retention.snapshot();
    println!("Storage root: {}", settings.storage.root.display());
    println!("Files:        {} / {}", summary.files, settings.storage.max_files);
    println!("Readings:     {}", view.reading_count());
    println!("Size:         {} bytes", summary.total_bytes);
    if let (Some(oldest), Some(newest)) = (summary.oldest, summary.newest) {
        println!("Range:        {oldest} .. {newest}");
    }
    match view.max_record() {
        Some(max) => println!("Max:          {} at {} in {}", max.value, max.timestamp, max.source),
        None => println!("Max:          (no readings)"),
    }
    Ok(())
}

async fn query(settings: &Settings, command: &str, url: Option<String>, wait: Duration) -> Result<()> {
    let parsed: serde_json::Value = serde_json::from_str(command).context("Command is not valid JSON")?;
    let expected = match parsed.get("command").and_then(|c| c.as_str()) {
        Some("get_status") => "status",
        Some("get_file_list") => "file_list",
        Some("get_csv_data") => "csv_data",
        Some("get_recent_data") => "recent_data",
        Some("get_folder_structure") => "folder_structure",
        Some("export_all_csv_zip") => "zip_export",
        Some(_) => "command_response",
        None => bail!("Command needs a \"command\" field"),
    };

    let url = url.unwrap_or_else(|| format!("ws://{}:{}", settings.network.host, settings.network.port));
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("Cannot connect to {url}"))?;
    socket.send(Message::Text(command.to_string())).await?;

    let reply = tokio::time::timeout(wait, read_reply(&mut socket, expected))
        .await
        .context("Timed out waiting for a reply")??;

    println!("{}", serde_json::to_string_pretty(&reply)?);
    let _ = socket.close(None).await;
    Ok(())
}

type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Skip the greeting status and any broadcasts until the reply arrives.
async fn read_reply(socket: &mut Socket, expected: &str) -> Result<serde_json::Value> {
    while let Some(frame) = socket.next().await {
        if let Message::Text(text) = frame? {
            let value: serde_json::Value = serde_json::from_str(&text)?;
            let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or_default();
            if kind == expected || kind == "error" {
                return Ok(value);
            }
        }
    }
    bail!("Connection closed before a reply arrived")
}
