use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::peer::NodeId;

/// WAL durability policy, mirroring the original `Sync`/`BytesPerSync` knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// fsync after every record.
    EveryWrite,
    /// fsync once at least N bytes have been appended since the last sync.
    EveryNBytes(u64),
    /// Caller is responsible for calling `Wal::sync` explicitly.
    Explicit,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::EveryWrite
    }
}

/// Top-level node configuration. Serde-derived so it can be loaded from JSON
/// the way the original process read its config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_id: NodeId,
    pub wal_path: PathBuf,
    pub slog_path: PathBuf,

    pub cache_size: usize,
    pub ro_cache_size: usize,
    pub max_signal_queue: usize,

    pub wal_segment_size: u64,
    pub wal_sync_mode: SyncMode,
    pub wal_file_ext: String,

    #[serde(with = "duration_millis")]
    pub ticker_delay: Duration,

    pub quorum_threshold: usize,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub peer_set_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub health_interval: Duration,

    pub peers: Vec<(NodeId, String)>,
    pub listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            wal_path: PathBuf::from("./data/wal"),
            slog_path: PathBuf::from("./data/hints.redb"),
            cache_size: 10_000,
            ro_cache_size: 10_000,
            max_signal_queue: 1_024,
            wal_segment_size: 16 * 1024 * 1024,
            wal_sync_mode: SyncMode::EveryWrite,
            wal_file_ext: "WSG".to_string(),
            ticker_delay: Duration::from_secs(5),
            quorum_threshold: 0,
            request_timeout: Duration::from_secs(5),
            peer_set_timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(10),
            peers: Vec::new(),
            listen_addr: "0.0.0.0:7070".to_string(),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
