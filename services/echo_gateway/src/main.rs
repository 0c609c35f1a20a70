//! Echo gateway entry point
//!
//! Accepts TCP clients speaking length-prefixed frames and echoes every frame
//! back through a module running on the fabric.

mod echo;

use anyhow::{Context, Result};
use clap::Parser;
use echo::EchoModule;
use fabric_actors::{ModuleManager, ModuleSessionDelegate};
use fabric_config::load_config;
use fabric_network::NetworkFrame;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<String>,

    /// Worker threads, overrides the config file
    #[arg(long)]
    workers: Option<usize>,

    /// Network execution contexts, overrides the config file
    #[arg(long)]
    net_threads: Option<usize>,

    /// Idle session timeout in milliseconds, 0 disables it
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Echo module config string, e.g. `name:echo;report_interval:5000`
    #[arg(long, default_value = "name:echo")]
    module_config: String,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fabric_echo_gateway=info,fabric_actors=info,fabric_network=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting echo gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config.runtime.worker_num = workers;
    }
    if let Some(threads) = args.net_threads {
        config.network.thread_num = threads;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.network.timeout_ms = timeout_ms;
    }
    let host = args
        .host
        .or_else(|| config.network.listen_host.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args
        .port
        .or_else(|| config.network.listen_port.clone())
        .unwrap_or_else(|| "9000".to_string());

    info!("Configuration loaded: {:?}", config);

    let manager = ModuleManager::new(config.runtime.clone());
    let delegate = Arc::new(ModuleSessionDelegate::new(manager.clone()));
    let frame = Arc::new(
        NetworkFrame::with_config(delegate.clone(), &config.network)
            .context("Failed to create network frame")?,
    );

    let echo = manager
        .create_module(Box::new(EchoModule::new(Arc::clone(&frame))), &args.module_config, None)
        .context("Failed to create echo module")?;
    delegate.set_target(echo);

    frame
        .listen(&host, &port)
        .with_context(|| format!("Failed to listen on {}:{}", host, port))?;

    manager.run().context("Failed to start workers")?;
    frame.run().context("Failed to start network frame")?;

    match frame.local_addr() {
        Some(addr) => info!(%addr, module_id = %echo, "Echo gateway ready"),
        None => error!("Echo gateway is not listening: {}", frame.error_message()),
    }

    // the fabric owns its runtimes; this one only waits for the signal
    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    signals
        .block_on(tokio::signal::ctrl_c())
        .context("Failed to install CTRL+C signal handler")?;
    info!("Shutdown signal received");

    frame.stop();
    manager.stop();

    let stats = manager.stats();
    info!(
        delivered = stats.messages_delivered,
        dropped = stats.messages_dropped,
        faults = stats.module_faults,
        "Echo gateway stopped"
    );
    Ok(())
}
