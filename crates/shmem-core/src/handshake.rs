//! Handshake records.
//!
//! The opener proposes its parameters in a `Hello` frame; the creator checks
//! them against its own and answers with a `HelloAck` carrying the
//! negotiated parameters and an accept/reject status. There is exactly one
//! attempt per session.
//!
//! Record layout (little-endian):
//!
//! ```text
//! version:u32 capacity:u64 max_frame:u32 compression:u8 threshold:u32
//! heartbeat_ms:u32 liveness_ms:u32 [status:u8, HelloAck only]
//! ```

use std::time::Duration;

use crate::PROTOCOL_VERSION;
use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::options::ConnectionOptions;

/// Encoded size of a [`Hello`]
pub const HELLO_LEN: usize = 29;

/// Encoded size of a [`HelloAck`]
pub const HELLO_ACK_LEN: usize = HELLO_LEN + 1;

/// Session parameters exchanged during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Protocol version
    pub version: u32,
    /// Ring capacity per direction
    pub capacity: u64,
    /// Maximum frame payload
    pub max_frame_size: u32,
    /// Whether this side wants compression
    pub compression: bool,
    /// Compression threshold in bytes
    pub compression_threshold: u32,
    /// Heartbeat interval in milliseconds
    pub heartbeat_ms: u32,
    /// Liveness timeout in milliseconds
    pub liveness_ms: u32,
}

impl Hello {
    /// Parameters proposed by `options`
    #[must_use]
    pub fn from_options(options: &ConnectionOptions) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            capacity: options.capacity as u64,
            max_frame_size: clamp_u32(options.max_frame_size as u64),
            compression: options.compression,
            compression_threshold: clamp_u32(options.compression_threshold as u64),
            heartbeat_ms: clamp_u32(options.heartbeat_interval.as_millis() as u64),
            liveness_ms: clamp_u32(options.liveness_timeout.as_millis() as u64),
        }
    }

    /// Encode to the wire record
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HELLO_ACK_LEN);
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.capacity.to_le_bytes());
        buf.extend_from_slice(&self.max_frame_size.to_le_bytes());
        buf.push(u8::from(self.compression));
        buf.extend_from_slice(&self.compression_threshold.to_le_bytes());
        buf.extend_from_slice(&self.heartbeat_ms.to_le_bytes());
        buf.extend_from_slice(&self.liveness_ms.to_le_bytes());
    }

    /// Decode a wire record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolMismatch`] if the record has the wrong size
    /// or an invalid compression byte.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != HELLO_LEN {
            return Err(Error::mismatch(format!(
                "hello record is {} bytes, expected {HELLO_LEN}",
                data.len()
            )));
        }
        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let mut capacity = [0u8; 8];
        capacity.copy_from_slice(&data[4..12]);
        let compression = match data[16] {
            0 => false,
            1 => true,
            other => {
                return Err(Error::mismatch(format!("invalid compression byte {other}")));
            }
        };

        Ok(Self {
            version: u32_at(0),
            capacity: u64::from_le_bytes(capacity),
            max_frame_size: u32_at(12),
            compression,
            compression_threshold: u32_at(17),
            heartbeat_ms: u32_at(21),
            liveness_ms: u32_at(25),
        })
    }

    /// Check that `peer` can talk to us.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolMismatch`] naming the first disagreeing field.
    pub fn check_compatible(&self, peer: &Self) -> Result<()> {
        if self.version != peer.version {
            return Err(Error::mismatch(format!(
                "protocol version {} != {}",
                peer.version, self.version
            )));
        }
        if self.capacity != peer.capacity {
            return Err(Error::mismatch(format!(
                "ring capacity {} != {}",
                peer.capacity, self.capacity
            )));
        }
        if self.max_frame_size != peer.max_frame_size {
            return Err(Error::mismatch(format!(
                "max frame size {} != {}",
                peer.max_frame_size, self.max_frame_size
            )));
        }
        Ok(())
    }

    /// Negotiated parameters.
    ///
    /// Compression is on only if both sides enable it, and the larger
    /// threshold wins. Timing uses the more patient of the two sides.
    #[must_use]
    pub fn negotiate(&self, peer: &Self) -> Self {
        Self {
            version: self.version,
            capacity: self.capacity,
            max_frame_size: self.max_frame_size,
            compression: self.compression && peer.compression,
            compression_threshold: self.compression_threshold.max(peer.compression_threshold),
            heartbeat_ms: self.heartbeat_ms.max(peer.heartbeat_ms),
            liveness_ms: self.liveness_ms.max(peer.liveness_ms),
        }
    }

    /// Codec for these parameters
    #[must_use]
    pub fn codec(&self) -> Codec {
        Codec::new(
            self.compression,
            self.compression_threshold as usize,
            self.max_frame_size as usize,
        )
    }

    /// Negotiated liveness timeout
    #[must_use]
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.liveness_ms))
    }
}

/// Creator's verdict on a [`Hello`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelloStatus {
    /// Session established with the carried parameters
    Accepted = 0,
    /// Parameters incompatible; the carried parameters are the creator's own
    Rejected = 1,
}

/// Creator's handshake reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloAck {
    /// Negotiated (or, when rejected, the creator's) parameters
    pub params: Hello,
    /// Verdict
    pub status: HelloStatus,
}

impl HelloAck {
    /// Encode to the wire record
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HELLO_ACK_LEN);
        self.params.encode_into(&mut buf);
        buf.push(self.status as u8);
        buf
    }

    /// Decode a wire record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolMismatch`] for a malformed record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != HELLO_ACK_LEN {
            return Err(Error::mismatch(format!(
                "hello-ack record is {} bytes, expected {HELLO_ACK_LEN}",
                data.len()
            )));
        }
        let params = Hello::decode(&data[..HELLO_LEN])?;
        let status = match data[HELLO_LEN] {
            0 => HelloStatus::Accepted,
            1 => HelloStatus::Rejected,
            other => return Err(Error::mismatch(format!("invalid handshake status {other}"))),
        };
        Ok(Self { params, status })
    }
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
