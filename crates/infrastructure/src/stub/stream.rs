//! Accepted stub TCP connections.
//!
//! A stream outlives the queries it carries: the read loop keeps pulling
//! length-framed messages while completed queries write their replies back
//! through the shared write half. When the connection dies, every query
//! still in flight on it is aborted.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;

use super::dispatcher::DupKey;

/// Largest DNS message the 16-bit length framing can carry.
pub const TCP_MESSAGE_SIZE_MAX: usize = 0xFFFF;

pub struct StubStream {
    peer: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Queries carried by this stream, for cancellation when it closes.
    queries: Mutex<Vec<(DupKey, AbortHandle)>>,
}

impl StubStream {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> (Arc<Self>, OwnedReadHalf) {
        let (read_half, write_half) = stream.into_split();
        (
            Arc::new(Self {
                peer,
                writer: tokio::sync::Mutex::new(write_half),
                queries: Mutex::new(Vec::new()),
            }),
            read_half,
        )
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Writes one length-framed DNS message. Replies from concurrent queries
    /// serialize on the writer lock, in completion order.
    pub async fn write_packet(&self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > TCP_MESSAGE_SIZE_MAX {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "DNS message too large for TCP framing",
            ));
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&(bytes.len() as u16).to_be_bytes())
            .await?;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    pub fn register_query(&self, key: DupKey, abort: AbortHandle) {
        self.queries.lock().unwrap().push((key, abort));
    }

    pub fn forget_query(&self, key: &DupKey) {
        self.queries.lock().unwrap().retain(|(k, _)| k != key);
    }

    /// Hands out everything still registered, leaving the stream empty. The
    /// terminating read loop aborts these and clears their table entries.
    pub fn take_queries(&self) -> Vec<(DupKey, AbortHandle)> {
        std::mem::take(&mut *self.queries.lock().unwrap())
    }
}

/// Reads one length-framed DNS message; `Ok(None)` on a clean end of
/// stream before the length prefix.
pub async fn read_framed(read_half: &mut OwnedReadHalf) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    match read_half.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u16::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    read_half.read_exact(&mut body).await?;
    Ok(Some(body))
}
