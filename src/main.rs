use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nxlink::adapters;
use nxlink::config::AppConfig;
use nxlink::context::AppContext;
use nxlink::core::discovery::DEFAULT_DEVICE_PORT;
use nxlink::core::{
    DeviceRegistry, DiscoveryStatus, EventSink, FanoutSink, FetchTarget, Platform, RawCodec, RegistryEvent,
    TracingSink, TransferEvent, TransferOrchestrator, add_device_manually,
};
use nxlink::logging;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "nxlink")]
#[command(about = "Discover LAN dump devices and fetch titles from them", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./nxlink.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: GlobalArgs,
}

#[derive(clap::Args, Serialize)]
struct GlobalArgs {
    /// Use the in-process simulated device instead of the network
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for device beacons and print sightings
    Discover {
        /// Stop after this many seconds (runs until Ctrl-C otherwise)
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Show what a device reports about itself
    Info {
        host: String,
        #[arg(long, default_value_t = DEFAULT_DEVICE_PORT as u32)]
        port: u32,
    },
    /// List the titles a device offers
    Titles {
        host: String,
        #[arg(long, default_value_t = DEFAULT_DEVICE_PORT as u32)]
        port: u32,
        /// Print the list as JSON
        #[arg(long)]
        json: bool,
    },
    /// Extract a title on the device and save the result locally
    Fetch {
        host: String,
        #[arg(long, default_value_t = DEFAULT_DEVICE_PORT as u32)]
        port: u32,
        /// Title id as listed by `titles`
        #[arg(long)]
        title: String,
        #[arg(long, value_enum)]
        platform: Platform,
        #[arg(long, short)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;
    logging::init(logging::LogConfig::from(&config));

    let ctx = AppContext::new(config).context("Failed to set up device client")?;

    match cli.command {
        Commands::Discover { duration } => run_discover(ctx, duration)
            .await
            .context("Discovery failed")?,
        Commands::Info { host, port } => run_info(ctx, &host, port)
            .await
            .context("Failed to query device info")?,
        Commands::Titles { host, port, json } => run_titles(ctx, &host, port, json)
            .await
            .context("Failed to list titles")?,
        Commands::Fetch {
            host,
            port,
            title,
            platform,
            output,
        } => run_fetch(ctx, &host, port, &title, FetchTarget { output, platform })
            .await
            .context("Fetch failed")?,
    }

    Ok(())
}

/// Cancelled on the first Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

async fn run_discover(ctx: AppContext, duration: Option<u64>) -> Result<()> {
    let discovery = adapters::get_discovery(&ctx.config);
    let mut events = ctx.registry.subscribe();

    match discovery.start(ctx.registry.clone()) {
        DiscoveryStatus::Active => println!("Listening for devices... (Ctrl-C to stop)"),
        DiscoveryStatus::ManualOnly => {
            bail!("Discovery socket unavailable; add devices manually with `info <host>`")
        }
        DiscoveryStatus::AlreadyRunning => {}
    }

    let shutdown = shutdown_token();
    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(RegistryEvent::Discovered(device)) => {
                    println!(">> FOUND: {} at {} (v{})", device.name, device.addr, device.version);
                }
                Ok(RegistryEvent::Lost(device)) => {
                    println!(">> LOST: {} at {}", device.name, device.addr);
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Registry events dropped, resynchronising");
                    print_devices(&ctx.registry).await;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    discovery.stop();

    print_devices(&ctx.registry).await;
    Ok(())
}

async fn print_devices(registry: &DeviceRegistry) {
    let devices = registry.list().await;
    println!("{} device(s) known:", devices.len());
    for device in devices {
        println!(
            "  {:<21} {} (v{}, last seen {})",
            device.addr.to_string(),
            device.name,
            device.version,
            device.last_seen_at.format("%H:%M:%S")
        );
    }
}

async fn run_info(ctx: AppContext, host: &str, port: u32) -> Result<()> {
    let device = add_device_manually(&ctx.registry, ctx.client.as_ref(), host, port).await?;
    let mut info: Vec<_> = ctx.client.get_info(&device).await?.into_iter().collect();
    info.sort();

    println!("{} at {}", device.name, device.addr);
    for (key, value) in info {
        println!("  {:<12} {}", key, value);
    }
    Ok(())
}

async fn run_titles(ctx: AppContext, host: &str, port: u32, json: bool) -> Result<()> {
    let device = add_device_manually(&ctx.registry, ctx.client.as_ref(), host, port).await?;
    let titles = ctx.client.list_titles(&device).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&titles)?);
        return Ok(());
    }

    println!("{} titles on {}:", titles.len(), device.name);
    for title in titles {
        println!(
            "  {} {:<32} v{:<10} {:>12} bytes{}",
            title.title_id,
            title.name,
            title.version,
            title.size,
            if title.extractable { "" } else { "  (not extractable)" }
        );
    }
    Ok(())
}

async fn run_fetch(
    ctx: AppContext,
    host: &str,
    port: u32,
    title_id: &str,
    target: FetchTarget,
) -> Result<()> {
    let device = add_device_manually(&ctx.registry, ctx.client.as_ref(), host, port).await?;

    let sink = FanoutSink::new(vec![
        Arc::new(TracingSink::default()) as Arc<dyn EventSink>,
        Arc::new(ConsoleSink::default()),
    ]);
    let orchestrator = TransferOrchestrator::new(
        ctx.client.clone(),
        Arc::new(RawCodec),
        Arc::new(sink),
        ctx.config.transfer.transfer_config(),
    );

    orchestrator.connect(device.clone()).await?;

    let titles = ctx.client.list_titles(&device).await?;
    let Some(title) = titles.into_iter().find(|t| t.title_id == title_id) else {
        bail!("Title {} is not offered by {}", title_id, device.name);
    };
    if !title.extractable {
        bail!("Title {} ({}) is not extractable", title.title_id, title.name);
    }

    let outcome = orchestrator
        .extract_and_fetch(&title, &target, shutdown_token())
        .await?;

    println!(
        "Saved {} ({} bytes, blake3 {}) to {}",
        title.name,
        outcome.content_bytes,
        outcome.digest,
        outcome.output.display()
    );
    Ok(())
}

/// Prints download progress in 10% steps. Status lines reach the terminal
/// through the tracing sink.
#[derive(Default)]
struct ConsoleSink {
    last_decile: AtomicU64,
}

impl EventSink for ConsoleSink {
    fn emit(&self, event: TransferEvent) {
        let TransferEvent::DownloadProgress {
            bytes_read,
            total_bytes,
        } = event
        else {
            return;
        };
        if total_bytes == 0 {
            return;
        }

        let decile = (bytes_read.min(total_bytes) * 10 / total_bytes).min(10);
        if self.last_decile.fetch_max(decile, Ordering::Relaxed) < decile {
            println!(
                "Downloaded {}% ({}/{} bytes)",
                decile * 10,
                bytes_read,
                total_bytes
            );
        }
    }
}
