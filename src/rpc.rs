//! Wire types for the two-method RPC surface (`Set`, `Get`) plus a default
//! TCP transport: one `u32` big-endian length prefix, then a `bincode`-
//! encoded `Frame`. This is the "external collaborator" the wider design
//! treats as swappable — `Dialer`/`PeerConnection` are the seam — but a
//! crate that only defines wire types without a working transport isn't
//! actually runnable, so this module supplies one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::peer::{Dialer, PeerConnection};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRequest {
    pub uuid: String,
    pub value: Vec<u8>,
    pub local: bool,
    pub quorum: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetResponse {
    pub success: bool,
    pub consistent_nodes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub uuid: String,
    pub local: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub found: bool,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    SetRequest(SetRequest),
    SetResponse(SetResponse),
    GetRequest(GetRequest),
    GetResponse(GetResponse),
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(w: &mut W, frame: &Frame) -> Result<()> {
    let payload = bincode::serde::encode_to_vec(frame, bincode::config::standard())?;
    w.write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| Error::io("rpc write len", e))?;
    w.write_all(&payload)
        .await
        .map_err(|e| Error::io("rpc write payload", e))?;
    Ok(())
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::io("rpc read len", e))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| Error::io("rpc read payload", e))?;
    let (frame, _): (Frame, usize) =
        bincode::serde::decode_from_slice(&payload, bincode::config::standard())?;
    Ok(frame)
}

/// Default TCP connection: each call takes an internal async lock so two
/// concurrent calls on the same `TcpPeerConnection` don't interleave frames.
/// Concurrent calls to different peers use different connections and proceed
/// in parallel.
pub struct TcpPeerConnection {
    stream: AsyncMutex<TcpStream>,
}

impl TcpPeerConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: AsyncMutex::new(stream),
        }
    }

    async fn call(&self, frame: Frame, timeout: Duration) -> Result<Frame> {
        let mut stream = self.stream.lock().await;
        tokio::time::timeout(timeout, async {
            write_frame(&mut *stream, &frame).await?;
            read_frame(&mut *stream).await
        })
        .await
        .map_err(|_| Error::Timeout(timeout))?
    }
}

#[async_trait]
impl PeerConnection for TcpPeerConnection {
    async fn call_set(&self, req: SetRequest, timeout: Duration) -> Result<SetResponse> {
        match self.call(Frame::SetRequest(req), timeout).await? {
            Frame::SetResponse(resp) => Ok(resp),
            _ => Err(Error::Replication("unexpected response frame for Set".to_string())),
        }
    }

    async fn call_get(&self, req: GetRequest, timeout: Duration) -> Result<GetResponse> {
        match self.call(Frame::GetRequest(req), timeout).await? {
            Frame::GetResponse(resp) => Ok(resp),
            _ => Err(Error::Replication("unexpected response frame for Get".to_string())),
        }
    }
}

pub struct TcpDialer {
    pub connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn PeerConnection>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::Timeout(self.connect_timeout))?
            .map_err(|e| Error::io("tcp dial", e))?;
        Ok(Arc::new(TcpPeerConnection::new(stream)))
    }
}
