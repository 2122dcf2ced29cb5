//! Inbound RPC listener: accepts peer connections and dispatches `Set`/`Get`
//! frames into this node's coordinator, so a node can actually serve the
//! requests its peers send it rather than only originating them.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use crate::rpc::{self, Frame, GetResponse, SetResponse};

pub struct PeerServer {
    listener: TcpListener,
}

impl PeerServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| Error::io("bind peer server", e))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().map_err(|e| Error::io("peer server local_addr", e))
    }

    /// Spawns the accept loop, dispatching every inbound connection to
    /// `coordinator`. Runs until the listener is dropped or an unrecoverable
    /// accept error occurs.
    pub fn spawn(self, coordinator: Arc<Coordinator>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "accepted peer connection");
                        let coordinator = coordinator.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, coordinator).await {
                                warn!(error = %e, "peer connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed, stopping peer server");
                        break;
                    }
                }
            }
        })
    }
}

async fn serve_connection(mut stream: TcpStream, coordinator: Arc<Coordinator>) -> Result<()> {
    loop {
        let frame = match rpc::read_frame(&mut stream).await {
            Ok(f) => f,
            Err(_) => return Ok(()), // peer closed the connection; not an error worth propagating
        };

        let response = match frame {
            Frame::SetRequest(req) => {
                let outcome = coordinator.set(req.uuid, req.value, req.local, req.quorum as usize).await?;
                Frame::SetResponse(SetResponse {
                    success: outcome.success,
                    consistent_nodes: outcome.consistent_nodes,
                })
            }
            Frame::GetRequest(req) => {
                let outcome = coordinator.get(req.uuid, req.local).await?;
                Frame::GetResponse(GetResponse {
                    found: outcome.found,
                    value: outcome.value,
                })
            }
            _ => {
                warn!("received a response frame on the server side, ignoring connection");
                return Ok(());
            }
        };

        rpc::write_frame(&mut stream, &response).await?;
    }
}
