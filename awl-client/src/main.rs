//! awl - peer-to-peer mesh VPN node
//!
//! Usage:
//!   # start the node with the config in ./data (TUN requires admin/root)
//!   awl --data-dir ./data
//!
//!   # verbose logs
//!   awl --data-dir ./data --verbose

use std::path::PathBuf;

use awl_client::config::{ConfigHandle, CONFIG_FILE_NAME};
use awl_client::log_buffer::LogBuffer;
use awl_client::{AppOptions, Application, BoxError, EventBus};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Anywherelan mesh VPN node
#[derive(Parser, Debug)]
#[command(name = "awl")]
#[command(version)]
#[command(about = "Peer-to-peer mesh VPN over libp2p", long_about = None)]
struct Args {
    /// Directory holding config_awl.json
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,

    /// Override the TUN interface name from the config
    #[arg(long)]
    tun_name: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    // The log level lives in the config, so read it before anything logs
    let config = ConfigHandle::load_or_create(&args.data_dir, EventBus::new())?;
    if let Some(name) = &args.tun_name {
        config.update_quiet(|c| c.vpn.interface_name = name.clone());
        config.save()?;
    }
    let level = if args.verbose {
        "debug".to_string()
    } else {
        config.read(|c| c.logger_level.clone())
    };
    drop(config);

    let logs = LogBuffer::default();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(logs.clone()))
        .init();

    info!(
        "📂 using {}",
        args.data_dir.join(CONFIG_FILE_NAME).display()
    );

    let cancel = CancellationToken::new();
    let mut opts = AppOptions::new(&args.data_dir);
    opts.log_buffer = Some(logs);
    let app = Application::init_with(opts, &cancel).await.map_err(|e| {
        error!("❌ failed to start: {}", e);
        e
    })?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("received ctrl-c, shutting down");
        }
        _ = app.cancelled() => error!("❌ node stopped unexpectedly"),
    }
    app.close().await;
    Ok(())
}
