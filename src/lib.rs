//! Write-through, quorum-replicated in-memory cache fronting a durable
//! store: a WAL-backed local cache with segment rotation and background
//! flush, quorum write replication, racing fan-out reads, and hinted
//! handoff for peers that were unreachable at write time.

pub mod backing_store;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod hintlog;
pub mod local_cache;
pub mod lru;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod record;
pub mod replay;
pub mod rpc;
pub mod server;
pub mod wal;

pub use config::Config;
pub use error::{Error, Result};
pub use node::Node;
