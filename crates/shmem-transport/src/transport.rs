//! Transport trait abstraction.
//!
//! `Transport` is the object-safe face of a connection: code that only moves
//! payloads (the CLI's echo loop, benchmarks, the FFI) can hold a
//! `Box<dyn Transport>` without caring about roles, handshakes or segments.

use async_trait::async_trait;
use shmem_core::{Result, SessionState, SessionStats};

use crate::connection::Connection;

/// Async message transport.
///
/// # Examples
///
/// ```no_run
/// use shmem_core::ConnectionOptions;
/// use shmem_transport::transport::Transport;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let conn = shmem_transport::connect("chan1", ConnectionOptions::default()).await?;
/// let transport: &dyn Transport = &conn;
///
/// transport.send(b"ping").await?;
/// let reply = transport.recv().await?;
/// println!("Received {} bytes", reply.len());
/// transport.close().await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message.
    ///
    /// # Errors
    /// Returns an error if the message cannot be delivered to the ring
    async fn send(&self, buf: &[u8]) -> Result<()>;

    /// Receive one message.
    ///
    /// # Errors
    /// Returns an error once the transport is closed or the peer is gone
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Close the transport and release resources.
    ///
    /// After calling this method, all subsequent operations should
    /// return `Error::Closed`.
    ///
    /// # Errors
    /// Returns an error if closing fails
    async fn close(&self) -> Result<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics (optional).
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total payload bytes sent
    pub bytes_sent: u64,
    /// Total payload bytes received
    pub bytes_received: u64,
    /// Total messages sent
    pub messages_sent: u64,
    /// Total messages received
    pub messages_received: u64,
    /// Messages sent compressed
    pub compressed_sent: u64,
    /// Messages received compressed
    pub compressed_received: u64,
}

impl TransportStats {
    /// Fraction of sent messages that went out compressed
    #[must_use]
    pub fn compression_ratio(&self) -> f64 {
        if self.messages_sent == 0 {
            return 0.0;
        }
        self.compressed_sent as f64 / self.messages_sent as f64
    }
}

impl From<&SessionStats> for TransportStats {
    fn from(stats: &SessionStats) -> Self {
        Self {
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            messages_sent: stats.frames_sent,
            messages_received: stats.frames_received,
            compressed_sent: stats.compressed_frames_sent,
            compressed_received: stats.compressed_frames_received,
        }
    }
}

#[async_trait]
impl Transport for Connection {
    async fn send(&self, buf: &[u8]) -> Result<()> {
        Connection::send(self, buf).await
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        self.receive().await
    }

    async fn close(&self) -> Result<()> {
        Connection::close(self).await
    }

    fn is_closed(&self) -> bool {
        matches!(self.state(), SessionState::Closed | SessionState::Error)
    }

    fn stats(&self) -> TransportStats {
        TransportStats::from(&Connection::stats(self))
    }
}
