//! Peer health loop: periodically re-dials inactive peers and kicks off a
//! hint-replay cycle for peers that are already active.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::peer::{Dialer, NodeId, PeerHandle};
use crate::replay::HintReplayer;

pub struct HealthLoop {
    peers: Arc<DashMap<NodeId, Arc<PeerHandle>>>,
    dialer: Arc<dyn Dialer>,
    replayer: Arc<HintReplayer>,
    interval: Duration,
}

impl HealthLoop {
    pub fn new(
        peers: Arc<DashMap<NodeId, Arc<PeerHandle>>>,
        dialer: Arc<dyn Dialer>,
        replayer: Arc<HintReplayer>,
        interval: Duration,
    ) -> Self {
        Self {
            peers,
            dialer,
            replayer,
            interval,
        }
    }

    pub async fn tick_once(&self) {
        let mut any_active = false;
        for entry in self.peers.iter() {
            let peer = entry.value().clone();
            if peer.is_active() {
                any_active = true;
                continue;
            }
            match peer.init(self.dialer.as_ref()).await {
                Ok(()) => info!(peer = peer.id, "peer reconnected"),
                Err(e) => debug!(peer = peer.id, error = %e, "peer still unreachable"),
            }
        }

        if any_active {
            if let Err(e) = self.replayer.walk_and_send().await {
                debug!(error = %e, "hint replay cycle failed");
            }
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.tick_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::hintlog::HintLog;
    use crate::rpc::{GetRequest, GetResponse, SetRequest, SetResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingDialer {
        attempts: Arc<AtomicUsize>,
        succeed: bool,
    }

    struct NoopConn;

    #[async_trait]
    impl crate::peer::PeerConnection for NoopConn {
        async fn call_set(&self, _req: SetRequest, _timeout: Duration) -> Result<SetResponse> {
            Ok(SetResponse {
                success: true,
                consistent_nodes: 1,
            })
        }
        async fn call_get(&self, _req: GetRequest, _timeout: Duration) -> Result<GetResponse> {
            Ok(GetResponse {
                found: false,
                value: None,
            })
        }
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self, _address: &str) -> Result<Arc<dyn crate::peer::PeerConnection>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(Arc::new(NoopConn))
            } else {
                Err(Error::Replication("still down".to_string()))
            }
        }
    }

    struct EmptyLookup;

    #[async_trait]
    impl crate::replay::LocalLookup for EmptyLookup {
        async fn get_key(&self, _key: &str) -> Option<Vec<u8>> {
            None
        }
    }

    #[tokio::test]
    async fn reconnects_inactive_peer() {
        let dir = TempDir::new().unwrap();
        let peers = Arc::new(DashMap::new());
        peers.insert(1, Arc::new(PeerHandle::new(1, "peer-1")));

        let attempts = Arc::new(AtomicUsize::new(0));
        let dialer: Arc<dyn Dialer> = Arc::new(CountingDialer {
            attempts: attempts.clone(),
            succeed: true,
        });
        let hints = Arc::new(HintLog::open(&dir.path().join("hints.redb")).unwrap());
        let replayer = Arc::new(HintReplayer::new(
            hints,
            peers.clone(),
            Arc::new(EmptyLookup),
            Duration::from_secs(1),
        ));

        let health = HealthLoop::new(peers.clone(), dialer, replayer, Duration::from_secs(10));
        health.tick_once().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(peers.get(&1).unwrap().is_active());
    }

    #[tokio::test]
    async fn does_not_redial_already_active_peer() {
        let dir = TempDir::new().unwrap();
        let peers = Arc::new(DashMap::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let dialer: Arc<dyn Dialer> = Arc::new(CountingDialer {
            attempts: attempts.clone(),
            succeed: true,
        });

        let handle = PeerHandle::new(1, "peer-1");
        handle.init(dialer.as_ref()).await.unwrap();
        peers.insert(1, Arc::new(handle));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let hints = Arc::new(HintLog::open(&dir.path().join("hints.redb")).unwrap());
        let replayer = Arc::new(HintReplayer::new(
            hints,
            peers.clone(),
            Arc::new(EmptyLookup),
            Duration::from_secs(1),
        ));
        let health = HealthLoop::new(peers, dialer, replayer, Duration::from_secs(10));
        health.tick_once().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1, "active peer should not be redialed");
    }
}
