//! Per-peer connection state and the pluggable transport traits. The crate
//! ships a default TCP implementation (see `src/rpc.rs`), but `Dialer`/
//! `PeerConnection` let a caller swap in any transport without touching the
//! coordinator, health loop, or replay logic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::rpc::{GetRequest, GetResponse, SetRequest, SetResponse};

pub type NodeId = u64;

/// One established (or not-yet-established) connection to a peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn call_set(&self, req: SetRequest, timeout: Duration) -> Result<SetResponse>;
    async fn call_get(&self, req: GetRequest, timeout: Duration) -> Result<GetResponse>;
}

/// Produces a `PeerConnection` for a given address. Injected so tests and
/// alternate deployments can swap transports without touching replication
/// logic.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> Result<Arc<dyn PeerConnection>>;
}

struct Inner {
    active: bool,
    conn: Option<Arc<dyn PeerConnection>>,
}

/// A registered peer: its id, address, and current connection state. All
/// mutation goes through the write lock; the coordinator, health loop, and
/// replay module all read `is_active()`/`connection()` under the read lock.
pub struct PeerHandle {
    pub id: NodeId,
    pub address: String,
    inner: RwLock<Inner>,
}

impl PeerHandle {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            inner: RwLock::new(Inner {
                active: false,
                conn: None,
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.read().active
    }

    pub fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.inner.read().conn.clone()
    }

    /// Attempts to (re)establish the connection. On success marks the peer
    /// active and installs the new connection; on failure marks it inactive
    /// and drops any stale connection.
    pub async fn init(&self, dialer: &dyn Dialer) -> Result<()> {
        match dialer.dial(&self.address).await {
            Ok(conn) => {
                let mut guard = self.inner.write();
                guard.conn = Some(conn);
                guard.active = true;
                Ok(())
            }
            Err(e) => {
                let mut guard = self.inner.write();
                guard.conn = None;
                guard.active = false;
                Err(e)
            }
        }
    }

    pub fn mark_inactive(&self) {
        let mut guard = self.inner.write();
        guard.active = false;
        guard.conn = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct FlakyDialer {
        succeed: bool,
    }

    struct NoopConn;

    #[async_trait]
    impl PeerConnection for NoopConn {
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
    impl Dialer for FlakyDialer {
        async fn dial(&self, _address: &str) -> Result<Arc<dyn PeerConnection>> {
            if self.succeed {
                Ok(Arc::new(NoopConn))
            } else {
                Err(Error::Replication("dial failed".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn init_success_marks_active() {
        let peer = PeerHandle::new(1, "127.0.0.1:0");
        assert!(!peer.is_active());
        peer.init(&FlakyDialer { succeed: true }).await.unwrap();
        assert!(peer.is_active());
        assert!(peer.connection().is_some());
    }

    #[tokio::test]
    async fn init_failure_leaves_inactive() {
        let peer = PeerHandle::new(1, "127.0.0.1:0");
        peer.init(&FlakyDialer { succeed: true }).await.unwrap();
        assert!(peer.is_active());
        peer.init(&FlakyDialer { succeed: false }).await.unwrap_err();
        assert!(!peer.is_active());
        assert!(peer.connection().is_none());
    }
}
