//! nbstore-daemon: WebSocket server for nbstore spaces.

use anyhow::{Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nbstore_daemon::{Backend, DaemonConfig, SpaceServer};

#[derive(Parser, Debug)]
#[command(name = "nbstore-daemon")]
#[command(about = "Serve nbstore spaces over WebSocket")]
struct Args {
    /// Path to the JSON config file (written with defaults if missing)
    #[arg(short, long, env = "NBSTORE_DAEMON_CONFIG", default_value = "nbstore-daemon.json")]
    config: PathBuf,

    /// Address to listen on, overriding the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Data directory, overriding the config file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Storage backend: embedded, nativeFile or memory
    #[arg(long, value_parser = parse_backend)]
    backend: Option<Backend>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn parse_backend(value: &str) -> Result<Backend> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| anyhow!("unknown backend {:?} (expected embedded, nativeFile or memory)", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_filter = if args.verbose {
        "debug,nbstore=debug,nbstore_daemon=debug"
    } else {
        "info,nbstore=info,nbstore_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting nbstore-daemon");

    let mut config = DaemonConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    info!("Data directory: {:?} ({:?})", config.data_dir, config.backend);

    let server = SpaceServer::bind(config).await?;
    info!("Daemon running on {}. Press Ctrl+C to stop.", server.local_addr()?);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    server.close().await;
    info!("Shutting down");
    Ok(())
}
