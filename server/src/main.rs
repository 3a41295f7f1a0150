use clap::Parser;
use log::{error, info};
use server::hub::{Hub, HubConfig};
use server::network::{ConnectionConfig, Server};
use server::store::BoardStore;
use std::sync::Arc;

/// Main-method of the application.
/// Parses command-line arguments, then starts the hub loop and the WebSocket listener.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Side length of every board, used to decode move positions
        #[clap(short, long, default_value = "19")]
        board_size: u8,
        /// Largest number of boards one FETCH_REGION may return
        #[clap(long, default_value = "2500")]
        max_region_area: u64,
        /// Outbound messages buffered per connection before it is dropped
        #[clap(long, default_value = "256")]
        mailbox_capacity: usize,
        /// Requests buffered between all readers and the hub
        #[clap(long, default_value = "1000")]
        inbound_capacity: usize,
        /// Maximum number of concurrent connections
        #[clap(long, default_value = "10000")]
        max_clients: usize,
    }

    let args = Args::parse();
    if args.board_size == 0 {
        return Err("board size must be at least 1".into());
    }

    let config = HubConfig {
        board_size: args.board_size,
        max_region_area: args.max_region_area,
        mailbox_capacity: args.mailbox_capacity.max(1),
        inbound_capacity: args.inbound_capacity.max(1),
        max_clients: args.max_clients,
        ..HubConfig::default()
    };

    let store = Arc::new(BoardStore::new(config.board_size));
    let (hub, handle) = Hub::new(config, store);
    let hub_task = tokio::spawn(hub.run());

    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, handle, ConnectionConfig::default()).await?;

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Listener stopped: {}", e);
            }
        }
        result = hub_task => {
            if let Err(e) = result {
                error!("Hub task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
