// Quorum cache node — process entry point.
//
// Loads configuration, starts a single cluster member, and blocks until a
// shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use quorum_cache::backing_store::InMemoryBackingStore;
use quorum_cache::{node, Config, Node, Result};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let config = load_config();

    // The backing store is an external collaborator by design (see
    // DESIGN.md); this in-memory implementation is a usable default for a
    // standalone run and a stand-in for wiring in a real durable store.
    let backing = Arc::new(InMemoryBackingStore::new());

    let (node, tasks) = Node::start(config, backing).await?;
    info!(addr = %node.listen_addr(), "quorum-cache node ready");

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received, stopping");
    node::shutdown(tasks);

    Ok(())
}

fn load_config() -> Config {
    let config_path = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("quorum-cache.json");

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, path = %config_path.display(), "failed to parse config, using defaults");
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}
