//! Huddle server binary
//!
//! Binds the control, audio, and video listeners and runs until
//! interrupted. Exits non-zero when any listener fails to bind.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use huddle::{supervisor, HubConfig};

#[derive(Debug, Parser)]
#[command(name = "huddle", about = "LAN conferencing hub server", version)]
struct Cli {
    /// Address to bind all listeners to
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// TCP control port
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// UDP audio mixing port
    #[arg(long, default_value_t = 11000)]
    audio_port: u16,

    /// UDP video/screen fan-out port
    #[arg(long, default_value_t = 10000)]
    video_port: u16,

    /// Directory for completed uploads
    #[arg(long, default_value = "uploads")]
    upload_dir: PathBuf,

    /// Directory for the append-only event logs
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = HubConfig {
        host: cli.host,
        control_port: cli.port,
        audio_port: cli.audio_port,
        video_port: cli.video_port,
        upload_dir: cli.upload_dir,
        log_dir: cli.log_dir,
    };

    info!(
        host = %config.host,
        control = config.control_port,
        audio = config.audio_port,
        video = config.video_port,
        "starting huddle v{}",
        env!("CARGO_PKG_VERSION")
    );

    supervisor::run(config).await.context("hub server failed")?;
    Ok(())
}
