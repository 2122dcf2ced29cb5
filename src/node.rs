//! Top-level wiring: one `Node` owns the config, local cache, hint log,
//! peer registry, coordinator, health loop, and RPC server for a single
//! cluster member.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::info;

use crate::backing_store::BackingStore;
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorConfig, GetOutcome, SetOutcome};
use crate::error::Result;
use crate::health::HealthLoop;
use crate::hintlog::HintLog;
use crate::local_cache::LocalCache;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::peer::{Dialer, NodeId, PeerHandle};
use crate::replay::{HintReplayer, LocalLookup};
use crate::rpc::TcpDialer;
use crate::server::PeerServer;

pub struct NodeTasks {
    pub flush_worker: JoinHandle<()>,
    pub ticker: JoinHandle<()>,
    pub health_loop: JoinHandle<()>,
    pub rpc_server: JoinHandle<()>,
}

pub struct Node {
    pub coordinator: Arc<Coordinator>,
    pub metrics: Arc<Metrics>,
    pub peers: Arc<DashMap<NodeId, Arc<PeerHandle>>>,
    listen_addr: std::net::SocketAddr,
}

impl Node {
    /// Builds and starts every component of a cluster member: backing store,
    /// local cache (with recovery already run), hint log, peer registry
    /// seeded from `config.peers`, coordinator, health loop, and RPC server.
    /// Returns the node plus handles to its background tasks.
    pub async fn start(config: Config, backing: Arc<dyn BackingStore>) -> Result<(Self, NodeTasks)> {
        let metrics = Arc::new(Metrics::default());

        let (local_cache, cache_tasks) = LocalCache::open(&config, backing, metrics.clone()).await?;
        let local_cache = Arc::new(local_cache);

        let hints = Arc::new(HintLog::open(&config.slog_path)?);

        let peers: Arc<DashMap<NodeId, Arc<PeerHandle>>> = Arc::new(DashMap::new());
        for (id, address) in &config.peers {
            peers.insert(*id, Arc::new(PeerHandle::new(*id, address.clone())));
        }

        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::default());

        let coordinator = Arc::new(Coordinator::new(
            local_cache.clone(),
            peers.clone(),
            hints.clone(),
            CoordinatorConfig {
                request_timeout: config.request_timeout,
                peer_set_timeout: config.peer_set_timeout,
            },
            metrics.clone(),
        ));

        let lookup: Arc<dyn LocalLookup> = local_cache.clone();
        let replayer = Arc::new(HintReplayer::new(
            hints.clone(),
            peers.clone(),
            lookup,
            config.request_timeout,
        ));

        let health_loop = Arc::new(HealthLoop::new(
            peers.clone(),
            dialer.clone(),
            replayer,
            config.health_interval,
        ));

        let server = PeerServer::bind(&config.listen_addr).await?;
        let listen_addr = server.local_addr()?;

        let ticker = local_cache.spawn_ticker(config.ticker_delay);
        let health_loop_handle = health_loop.spawn();
        let rpc_server = server.spawn(coordinator.clone());

        info!(%listen_addr, node_id = config.node_id, "node started");

        let node = Node {
            coordinator,
            metrics,
            peers,
            listen_addr,
        };
        let tasks = NodeTasks {
            flush_worker: cache_tasks.flush_worker,
            ticker,
            health_loop: health_loop_handle,
            rpc_server,
        };
        Ok((node, tasks))
    }

    pub fn listen_addr(&self) -> std::net::SocketAddr {
        self.listen_addr
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn set(&self, key: String, value: Vec<u8>, local_only: bool, quorum: usize) -> Result<SetOutcome> {
        self.coordinator.set(key, value, local_only, quorum).await
    }

    pub async fn get(&self, key: String, local_only: bool) -> Result<GetOutcome> {
        self.coordinator.get(key, local_only).await
    }
}

/// Stops the node's background tasks. Dropping the `Node` (and its
/// `Arc<LocalCache>`) closes the signal channel's sender once every clone is
/// gone, which lets the flush worker's `recv()` loop end on its own; this
/// forcibly aborts the rest, which don't have a natural end-of-stream.
pub fn shutdown(tasks: NodeTasks) {
    tasks.ticker.abort();
    tasks.health_loop.abort();
    tasks.rpc_server.abort();
    // flush_worker is left to drain and exit naturally when the cache's
    // signal_tx is dropped.
    drop(tasks.flush_worker);
}
