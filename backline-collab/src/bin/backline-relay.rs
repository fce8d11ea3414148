//! Standalone relay for Backline document channels.
//!
//! Usage: `backline-relay [BIND_ADDR] [CONFIG.toml]`
//!
//! The optional TOML file uses the same layout as the client configuration;
//! only its `[channel]` table is read here.

use backline_collab::{CollabConfig, RelayServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let mut config = ServerConfig::default();
    if let Some(addr) = args.next() {
        config.bind_addr = addr;
    }
    if let Some(path) = args.next() {
        match CollabConfig::load(&path) {
            Ok(collab) => config.channel = collab.channel,
            Err(e) => {
                log::error!("failed to load {path}: {e}");
                std::process::exit(2);
            }
        }
    }

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("relay stopped: {e}");
        std::process::exit(1);
    }
}
