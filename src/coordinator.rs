//! Quorum write fan-out and racing fan-out read.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;

use crate::error::Result;
use crate::hintlog::HintLog;
use crate::local_cache::{GetResult, LocalCache};
use crate::metrics::Metrics;
use crate::peer::{NodeId, PeerHandle};
use crate::rpc::{GetRequest, SetRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOutcome {
    pub success: bool,
    pub consistent_nodes: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOutcome {
    pub found: bool,
    pub value: Option<Vec<u8>>,
}

pub struct CoordinatorConfig {
    pub request_timeout: Duration,
    pub peer_set_timeout: Duration,
}

pub struct Coordinator {
    set_mutex: AsyncMutex<()>,
    local: Arc<LocalCache>,
    peers: Arc<DashMap<NodeId, Arc<PeerHandle>>>,
    hints: Arc<HintLog>,
    config: CoordinatorConfig,
    metrics: Arc<Metrics>,
}

impl Coordinator {
    pub fn new(
        local: Arc<LocalCache>,
        peers: Arc<DashMap<NodeId, Arc<PeerHandle>>>,
        hints: Arc<HintLog>,
        config: CoordinatorConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            set_mutex: AsyncMutex::new(()),
            local,
            peers,
            hints,
            config,
            metrics,
        }
    }

    /// Effective quorum: the caller's requested threshold, or the computed
    /// majority of non-self peers, whichever is larger (floor division,
    /// matching the original implementation's literal `peers/2`).
    fn effective_quorum(&self, requested_quorum: usize, peer_count: usize) -> usize {
        requested_quorum.max(peer_count / 2)
    }

    pub async fn set(&self, key: String, value: Vec<u8>, local_only: bool, requested_quorum: usize) -> Result<SetOutcome> {
        let _guard = self.set_mutex.lock().await;

        if let Err(e) = self.local.store(key.clone(), value.clone()).await {
            return Err(e);
        }

        if local_only {
            return Ok(SetOutcome {
                success: true,
                consistent_nodes: 1,
            });
        }

        let peer_snapshot: Vec<Arc<PeerHandle>> = self.peers.iter().map(|e| e.value().clone()).collect();
        let quorum = self.effective_quorum(requested_quorum, peer_snapshot.len());
        let successes = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::with_capacity(peer_snapshot.len());
        for peer in peer_snapshot {
            let key = key.clone();
            let value = value.clone();
            let successes = successes.clone();
            let hints = self.hints.clone();
            let metrics = self.metrics.clone();
            let timeout = self.config.request_timeout;
            joins.push(tokio::spawn(async move {
                let outcome = fan_out_one(&peer, key.clone(), value, timeout).await;
                match outcome {
                    Ok(resp) if resp.success => {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {
                        peer.mark_inactive();
                        metrics.replication_errors.inc();
                        if let Err(e) = hints.put(&key, peer.id) {
                            warn!(peer = peer.id, error = %e, "failed to record hint");
                        }
                    }
                }
            }));
        }

        for join in joins {
            let _ = join.await;
        }

        let successes = successes.load(Ordering::SeqCst);
        Ok(SetOutcome {
            success: successes >= quorum,
            consistent_nodes: 1 + successes as i32,
        })
    }

    pub async fn get(&self, key: String, local_only: bool) -> Result<GetOutcome> {
        if local_only {
            return match self.local.get(&key).await? {
                GetResult::Found(v) => Ok(GetOutcome {
                    found: true,
                    value: Some(v),
                }),
                GetResult::NotFound => Ok(GetOutcome {
                    found: false,
                    value: None,
                }),
            };
        }

        let active_peers: Vec<Arc<PeerHandle>> = self
            .peers
            .iter()
            .filter(|e| e.value().is_active())
            .map(|e| e.value().clone())
            .collect();

        let mut remaining = active_peers.len() + 1;
        let cancel = Arc::new(AtomicBool::new(false));
        let (found_tx, mut found_rx) = mpsc::channel::<Vec<u8>>(remaining);
        let (nf_tx, mut nf_rx) = mpsc::channel::<()>(remaining);

        {
            let local = self.local.clone();
            let key = key.clone();
            let cancel = cancel.clone();
            let found_tx = found_tx.clone();
            let nf_tx = nf_tx.clone();
            tokio::spawn(async move {
                let result = local.get(&key).await;
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                match result {
                    Ok(GetResult::Found(v)) => {
                        let _ = found_tx.send(v).await;
                    }
                    _ => {
                        let _ = nf_tx.send(()).await;
                    }
                }
            });
        }

        for peer in active_peers {
            let key = key.clone();
            let cancel = cancel.clone();
            let found_tx = found_tx.clone();
            let nf_tx = nf_tx.clone();
            let timeout = self.config.peer_set_timeout;
            tokio::spawn(async move {
                let outcome = fan_out_get(&peer, key, timeout).await;
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                match outcome {
                    Ok(resp) if resp.found => {
                        if let Some(v) = resp.value {
                            let _ = found_tx.send(v).await;
                            return;
                        }
                        let _ = nf_tx.send(()).await;
                    }
                    _ => {
                        let _ = nf_tx.send(()).await;
                    }
                }
            });
        }
        drop(found_tx);
        drop(nf_tx);

        let deadline = tokio::time::sleep(self.config.peer_set_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                Some(v) = found_rx.recv() => {
                    cancel.store(true, Ordering::SeqCst);
                    return Ok(GetOutcome { found: true, value: Some(v) });
                }
                Some(()) = nf_rx.recv() => {
                    remaining -= 1;
                    if remaining == 0 {
                        cancel.store(true, Ordering::SeqCst);
                        return Ok(GetOutcome { found: false, value: None });
                    }
                }
                _ = &mut deadline => {
                    cancel.store(true, Ordering::SeqCst);
                    return Ok(GetOutcome { found: false, value: None });
                }
            }
        }
    }
}

async fn fan_out_one(
    peer: &Arc<PeerHandle>,
    key: String,
    value: Vec<u8>,
    timeout: Duration,
) -> Result<crate::rpc::SetResponse> {
    let conn = peer
        .connection()
        .ok_or_else(|| crate::error::Error::PeerUnreachable {
            node_id: peer.id,
            reason: "no active connection".to_string(),
        })?;
    conn.call_set(
        SetRequest {
            uuid: key,
            value,
            local: true,
            quorum: 0,
        },
        timeout,
    )
    .await
}

async fn fan_out_get(peer: &Arc<PeerHandle>, key: String, timeout: Duration) -> Result<crate::rpc::GetResponse> {
    let conn = peer
        .connection()
        .ok_or_else(|| crate::error::Error::PeerUnreachable {
            node_id: peer.id,
            reason: "no active connection".to_string(),
        })?;
    conn.call_get(GetRequest { uuid: key, local: true }, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing_store::InMemoryBackingStore;
    use crate::config::Config;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct AlwaysOkConn;

    #[async_trait]
    impl crate::peer::PeerConnection for AlwaysOkConn {
        async fn call_set(&self, _req: SetRequest, _timeout: Duration) -> Result<crate::rpc::SetResponse> {
            Ok(crate::rpc::SetResponse {
                success: true,
                consistent_nodes: 0,
            })
        }
        async fn call_get(&self, _req: GetRequest, _timeout: Duration) -> Result<crate::rpc::GetResponse> {
            Ok(crate::rpc::GetResponse {
                found: false,
                value: None,
            })
        }
    }

    struct AlwaysFailConn;

    #[async_trait]
    impl crate::peer::PeerConnection for AlwaysFailConn {
        async fn call_set(&self, _req: SetRequest, _timeout: Duration) -> Result<crate::rpc::SetResponse> {
            Err(crate::error::Error::Replication("boom".to_string()))
        }
        async fn call_get(&self, _req: GetRequest, _timeout: Duration) -> Result<crate::rpc::GetResponse> {
            Err(crate::error::Error::Replication("boom".to_string()))
        }
    }

    async fn build_coordinator(
        dir: &TempDir,
    ) -> (Coordinator, Arc<DashMap<NodeId, Arc<PeerHandle>>>, Arc<HintLog>) {
        let backing = Arc::new(InMemoryBackingStore::new());
        let metrics = Arc::new(Metrics::default());
        let config = Config {
            wal_path: dir.path().join("wal"),
            ..Config::default()
        };
        let (local, _tasks) = LocalCache::open(&config, backing, metrics.clone()).await.unwrap();
        let hints = Arc::new(HintLog::open(&dir.path().join("hints.redb")).unwrap());
        let peers = Arc::new(DashMap::new());
        let coordinator = Coordinator::new(
            Arc::new(local),
            peers.clone(),
            hints.clone(),
            CoordinatorConfig {
                request_timeout: Duration::from_millis(500),
                peer_set_timeout: Duration::from_millis(500),
            },
            metrics,
        );
        (coordinator, peers, hints)
    }

    async fn install_peer(peers: &DashMap<NodeId, Arc<PeerHandle>>, id: NodeId, active: bool, ok: bool) {
        let handle = PeerHandle::new(id, format!("peer-{id}"));
        if active {
            // Simulate a successful dial by poking the connection in directly
            // through `init` with a trivial always-succeeding dialer.
            let conn: Arc<dyn crate::peer::PeerConnection> = if ok {
                Arc::new(AlwaysOkConn)
            } else {
                Arc::new(AlwaysFailConn)
            };
            struct FixedDialer(Arc<dyn crate::peer::PeerConnection>);
            #[async_trait]
            impl crate::peer::Dialer for FixedDialer {
                async fn dial(&self, _address: &str) -> Result<Arc<dyn crate::peer::PeerConnection>> {
                    Ok(self.0.clone())
                }
            }
            let dialer = FixedDialer(conn);
            handle.init(&dialer).await.unwrap();
        }
        peers.insert(id, Arc::new(handle));
    }

    #[tokio::test]
    async fn quorum_succeeds_with_three_peers_two_successes() {
        let dir = TempDir::new().unwrap();
        let (coordinator, peers, hints) = build_coordinator(&dir).await;
        install_peer(&peers, 1, true, true).await;
        install_peer(&peers, 2, true, true).await;
        install_peer(&peers, 3, true, false).await;

        let outcome = coordinator
            .set("k1".to_string(), b"v1".to_vec(), false, 1)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.consistent_nodes, 3);
        assert_eq!(hints.len().unwrap(), 1, "exactly the one failed peer should have a hint recorded");
    }

    #[tokio::test]
    async fn quorum_fails_with_four_peers_zero_successes() {
        let dir = TempDir::new().unwrap();
        let (coordinator, peers, hints) = build_coordinator(&dir).await;
        for id in 1..=4 {
            install_peer(&peers, id, true, false).await;
        }

        let outcome = coordinator
            .set("k1".to_string(), b"v1".to_vec(), false, 0)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.consistent_nodes, 1);
        assert_eq!(hints.len().unwrap(), 4, "every one of the four failed peers should have a hint recorded");
    }

    #[tokio::test]
    async fn local_only_set_never_contacts_peers() {
        let dir = TempDir::new().unwrap();
        let (coordinator, peers, _hints) = build_coordinator(&dir).await;
        install_peer(&peers, 1, true, false).await;

        let outcome = coordinator
            .set("k1".to_string(), b"v1".to_vec(), true, 0)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.consistent_nodes, 1);
    }

    #[tokio::test]
    async fn get_falls_back_to_not_found_with_no_peers() {
        let dir = TempDir::new().unwrap();
        let (coordinator, _peers, _hints) = build_coordinator(&dir).await;
        let outcome = coordinator.get("missing".to_string(), false).await.unwrap();
        assert!(!outcome.found);
    }

    #[tokio::test]
    async fn get_finds_local_value_without_peers() {
        let dir = TempDir::new().unwrap();
        let (coordinator, _peers, _hints) = build_coordinator(&dir).await;
        coordinator
            .set("k1".to_string(), b"v1".to_vec(), true, 0)
            .await
            .unwrap();
        let outcome = coordinator.get("k1".to_string(), false).await.unwrap();
        assert!(outcome.found);
        assert_eq!(outcome.value, Some(b"v1".to_vec()));
    }
}
