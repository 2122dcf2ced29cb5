use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::peer::NodeId;

/// Errors produced anywhere in the cache, replication, or hint-log layers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("WAL record corrupted in {segment:?} at offset {offset}: {reason}")]
    Corruption {
        segment: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("deserialization error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("hint log error: {0}")]
    HintLog(String),

    #[error("backing store error: {0}")]
    BackingStore(String),

    #[error("replication error: {0}")]
    Replication(String),

    #[error("peer {node_id} unreachable: {reason}")]
    PeerUnreachable { node_id: NodeId, reason: String },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("signal channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Error::Io { operation, source }
    }
}
