//! codoc-relay binary entry point.
//!
//! ```bash
//! codoc-relay --bind 127.0.0.1:9090
//! RUST_LOG=debug codoc-relay
//! ```

use clap::Parser;
use codoc_relay::{RelayServer, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "WebSocket relay for collaborative documents", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Broadcast channel capacity per session
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let server = RelayServer::new(ServerConfig {
        bind_addr: cli.bind,
        broadcast_capacity: cli.broadcast_capacity,
    });

    server.run().await
}
