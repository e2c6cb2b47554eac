//! Byte-level transport under the protocol engines.
//!
//! [`ModbusTransport`] is the seam between the engines and the network: a
//! connected, ordered byte stream with exact-read semantics. [`TcpTransport`]
//! implements it over a Tokio TCP stream; tests substitute scripted
//! transports behind the same trait.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{ModbusError, ModbusResult};
use crate::DEFAULT_TIMEOUT;

/// Format raw bytes as a hex string for packet traces.
pub(crate) fn format_hex_packet(data: &[u8]) -> String {
    hex::encode_upper(data)
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or("??"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Transfer counters kept by a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A connected, ordered byte stream the protocol engines run over.
///
/// Implementations must preserve write ordering and complete `read_exact`
/// only when the requested count has arrived; a peer close mid-read is a
/// connection error, never a short read.
#[async_trait]
pub trait ModbusTransport: Send {
    /// Write the whole buffer to the peer.
    async fn write_all(&mut self, data: &[u8]) -> ModbusResult<()>;

    /// Read exactly `buf.len()` bytes from the peer.
    async fn read_exact(&mut self, buf: &mut [u8]) -> ModbusResult<()>;

    /// Close the connection. Further operations fail with a connection
    /// error.
    async fn close(&mut self) -> ModbusResult<()>;

    fn is_connected(&self) -> bool;

    fn stats(&self) -> TransportStats;
}

/// [`ModbusTransport`] over a Tokio TCP stream.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    stats: TransportStats,
}

impl TcpTransport {
    /// Connect to a peer, honoring the connect timeout.
    pub async fn connect(peer: SocketAddr, connect_timeout: Duration) -> ModbusResult<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| ModbusError::Timeout(connect_timeout))?
            .map_err(|e| ModbusError::connection(format!("failed to connect to {peer}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ModbusError::connection(format!("failed to set TCP_NODELAY: {e}")))?;
        debug!(%peer, "connected");
        Ok(Self {
            stream: Some(stream),
            peer,
            stats: TransportStats::default(),
        })
    }

    /// Connect with the default timeout.
    pub async fn connect_default(peer: SocketAddr) -> ModbusResult<Self> {
        Self::connect(peer, DEFAULT_TIMEOUT).await
    }

    /// Wrap an already-connected stream, e.g. one accepted by a listener.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer,
            stats: TransportStats::default(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn stream_mut(&mut self) -> ModbusResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("transport is closed"))
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn write_all(&mut self, data: &[u8]) -> ModbusResult<()> {
        let len = data.len();
        self.stream_mut()?.write_all(data).await?;
        self.stats.bytes_sent += len as u64;
        trace!(peer = %self.peer, "TX {}", format_hex_packet(data));
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> ModbusResult<()> {
        self.stream_mut()?.read_exact(buf).await?;
        self.stats.bytes_received += buf.len() as u64;
        trace!(peer = %self.peer, "RX {}", format_hex_packet(buf));
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
            debug!(peer = %self.peer, "connection closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }
}
