//! Hinted-handoff replay: walks the hint log and retries delivering each
//! hinted write to the peer it missed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::Result;
use crate::hintlog::{strip_salt, HintLog};
use crate::peer::{NodeId, PeerHandle};
use crate::rpc::SetRequest;

/// One-method trait for fetching a key's current local value, preferred
/// over a bare closure so it composes cleanly with `Arc` and trait objects.
#[async_trait]
pub trait LocalLookup: Send + Sync {
    async fn get_key(&self, key: &str) -> Option<Vec<u8>>;
}

#[async_trait]
impl LocalLookup for crate::local_cache::LocalCache {
    async fn get_key(&self, key: &str) -> Option<Vec<u8>> {
        match self.get(key).await {
            Ok(crate::local_cache::GetResult::Found(v)) => Some(v),
            _ => None,
        }
    }
}

pub struct HintReplayer {
    hints: Arc<HintLog>,
    peers: Arc<DashMap<NodeId, Arc<PeerHandle>>>,
    local: Arc<dyn LocalLookup>,
    running: AtomicBool,
    call_timeout: Duration,
}

impl HintReplayer {
    pub fn new(
        hints: Arc<HintLog>,
        peers: Arc<DashMap<NodeId, Arc<PeerHandle>>>,
        local: Arc<dyn LocalLookup>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            hints,
            peers,
            local,
            running: AtomicBool::new(false),
            call_timeout,
        }
    }

    /// Runs one replay pass. Non-reentrant: a call that finds a pass already
    /// in flight returns immediately without error.
    pub async fn walk_and_send(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("replay already in progress, skipping this cycle");
            return Ok(());
        }
        let result = self.walk_and_send_inner().await;
        self.running.store(false, Ordering::Release);
        result
    }

    async fn walk_and_send_inner(&self) -> Result<()> {
        let hints = self.hints.scan()?;
        for (composite_key, node_id) in hints {
            let Ok(uuid) = strip_salt(&composite_key) else {
                continue;
            };

            let Some(peer) = self.peers.get(&node_id).map(|e| e.value().clone()) else {
                continue;
            };
            if !peer.is_active() {
                continue;
            }

            let Some(value) = self.local.get_key(&uuid).await else {
                continue;
            };

            let conn = match peer.connection() {
                Some(conn) => conn,
                None => continue,
            };

            let result = conn
                .call_set(
                    SetRequest {
                        uuid: uuid.clone(),
                        value,
                        local: true,
                        quorum: 0,
                    },
                    self.call_timeout,
                )
                .await;

            match result {
                Ok(resp) if resp.success => {
                    if let Err(e) = self.hints.delete(&composite_key) {
                        warn!(uuid, error = %e, "failed to delete retired hint");
                    }
                }
                Ok(_) => {
                    debug!(uuid, node_id, "replay rejected by peer, leaving hint");
                }
                Err(e) => {
                    debug!(uuid, node_id, error = %e, "replay failed, leaving hint");
                }
            }
        }
        Ok(())
    }
}
