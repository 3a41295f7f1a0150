use clap::Parser;
use client::network::{Backoff, ClientConfig, ViewerClient};
use client::viewer::Viewer;
use client::{CacheConfig, PoolConfig, ViewportConfig};
use log::{error, info};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Hub URL to connect to
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Starting camera column
    #[arg(short = 'x', long, default_value = "500.0")]
    x: f32,

    /// Starting camera row
    #[arg(short = 'y', long, default_value = "500.0")]
    y: f32,

    /// Camera drift per tick along x, in boards
    #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
    pan_x: f32,

    /// Camera drift per tick along y, in boards
    #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
    pan_y: f32,

    /// Radius of the always-materialized window
    #[arg(long, default_value = "2")]
    active_radius: u16,

    /// Radius of the pre-fetched ring
    #[arg(long, default_value = "4")]
    buffer_radius: u16,

    /// Reconnect attempts before giving up
    #[arg(long, default_value = "10")]
    max_reconnect_attempts: u32,

    /// Milliseconds between camera ticks
    #[arg(long, default_value = "250")]
    tick_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let viewport = ViewportConfig {
        active_radius: args.active_radius,
        buffer_radius: args.buffer_radius.max(args.active_radius),
    };
    // Size the pool to the window so every visible board fits
    let pool = PoolConfig {
        max_active: viewport.active_window(),
        max_buffer: viewport.buffer_ring(),
        max_total: viewport.active_window() + viewport.buffer_ring() + 15,
        ..PoolConfig::default()
    };
    let viewer = Viewer::new(viewport, pool, CacheConfig::default(), args.x, args.y)?;

    let config = ClientConfig {
        server_url: args.server,
        tick_interval: Duration::from_millis(args.tick_ms.max(1)),
        pan_per_tick: (args.pan_x, args.pan_y),
        backoff: Backoff {
            max_attempts: args.max_reconnect_attempts,
            ..Backoff::default()
        },
    };

    info!("Starting viewer at ({}, {})", args.x, args.y);
    info!("Connecting to: {}", config.server_url);

    let mut client = ViewerClient::new(config, viewer);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown gracefully
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(e) = client.run(shutdown_rx).await {
        error!("Viewer stopped: {}", e);
        return Err(e.into());
    }

    Ok(())
}
