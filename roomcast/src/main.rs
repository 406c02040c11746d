mod config;
mod logging;
mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::config::Config;
use crate::server::RoomcastServer;

#[derive(Parser, Debug)]
#[command(name = "roomcast")]
#[command(about = "One-to-many WebRTC relay with a WebSocket signaling hub", long_about = None)]
struct Args {
    /// Configuration file (YAML/TOML), must exist; without it ./config.yaml is used when present
    #[arg(long, env = "ROOMCAST_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref())?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("roomcast starting...");
    info!("HTTP address: {}", config.http_address());
    info!(
        ice_servers = ?config.sfu.ice_servers,
        max_rooms = config.sfu.max_rooms,
        max_subscribers_per_room = config.sfu.max_subscribers_per_room,
        "SFU configured"
    );

    // 4. Start servers
    RoomcastServer::new(config)?.start().await
}
