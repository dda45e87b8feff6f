//! Standalone Loom sync server.
//!
//! Environment:
//! - `LOOM_BIND_ADDR`: listen address (default `127.0.0.1:9090`)
//! - `LOOM_DATA_DIR`: RocksDB directory; unset keeps documents in memory
//! - `RUST_LOG`: log filter (default `info`)

use std::path::PathBuf;

use loom_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("LOOM_BIND_ADDR") {
        config.bind_addr = addr;
    }
    config.storage_path = std::env::var_os("LOOM_DATA_DIR").map(PathBuf::from);
    if config.storage_path.is_none() {
        log::warn!("LOOM_DATA_DIR not set, documents will not survive a restart");
    }

    let server = SyncServer::new(config)?;
    server.run().await
}
