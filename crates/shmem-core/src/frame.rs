//! Frame header encoding for the ring record protocol.
//!
//! A frame on the wire is `[length:u32][flags:u8][payload]`. Inside a ring
//! the header occupies an 8-byte slot so the length word stays 4-byte
//! aligned and can be published with a single atomic store:
//!
//! ```text
//! 0        4       5            8
//! +--------+-------+------------+------------------+
//! | length | flags | reserved=0 | payload (padded) |
//! +--------+-------+------------+------------------+
//! ```
//!
//! All multi-byte fields are little-endian.

use crate::RECORD_HEADER_SIZE;
use crate::error::{Error, Result};

/// Frame kinds, carried in the high nibble of the flags byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Application payload
    Data = 0x0,
    /// Opener handshake proposal
    Hello = 0x1,
    /// Creator handshake reply
    HelloAck = 0x2,
    /// Graceful close marker
    Close = 0x3,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Data),
            0x1 => Ok(Self::Hello),
            0x2 => Ok(Self::HelloAck),
            0x3 => Ok(Self::Close),
            _ => Err(Error::corrupt(format!("unknown frame kind 0x{value:X}"))),
        }
    }
}

/// Frame flags byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Payload is LZ4 compressed
    pub const CMP: u8 = 0b0000_0001;

    const KIND_SHIFT: u8 = 4;
    const RESERVED_MASK: u8 = 0b0000_1110;

    /// Flags for a frame of `kind`
    #[must_use]
    pub fn new(kind: FrameKind) -> Self {
        Self((kind as u8) << Self::KIND_SHIFT)
    }

    /// Add the compressed flag
    #[must_use]
    pub fn with_compressed(mut self, compressed: bool) -> Self {
        if compressed {
            self.0 |= Self::CMP;
        }
        self
    }

    /// Check if the compressed flag is set
    #[must_use]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::CMP != 0
    }

    /// Frame kind encoded in the high nibble
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptFrame`] for an unknown kind or reserved bits.
    pub fn kind(self) -> Result<FrameKind> {
        if self.0 & Self::RESERVED_MASK != 0 {
            return Err(Error::corrupt(format!(
                "reserved flag bits set: 0x{:02X}",
                self.0
            )));
        }
        let kind = FrameKind::try_from(self.0 >> Self::KIND_SHIFT)?;
        if kind != FrameKind::Data && self.is_compressed() {
            return Err(Error::corrupt(format!(
                "{kind:?} frame marked compressed"
            )));
        }
        Ok(kind)
    }

    /// Raw byte
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Wrap a raw byte (validated lazily by [`FrameFlags::kind`])
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Decoded 8-byte record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes
    pub length: u32,
    /// Flags byte
    pub flags: FrameFlags,
}

impl FrameHeader {
    /// Encode into the ring slot layout
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4] = self.flags.as_u8();
        buf
    }

    /// Decode a ring slot, checking kind, reserved bytes and the length bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptFrame`] if the header is malformed or the
    /// length exceeds `max_frame_size`.
    pub fn decode(buf: &[u8; RECORD_HEADER_SIZE], max_frame_size: usize) -> Result<Self> {
        let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let flags = FrameFlags(buf[4]);
        if buf[5..8] != [0, 0, 0] {
            return Err(Error::corrupt("reserved header bytes are not zero"));
        }
        flags.kind()?;
        if length as usize > max_frame_size {
            return Err(Error::corrupt(format!(
                "length prefix {length} exceeds max frame size {max_frame_size}"
            )));
        }
        Ok(Self { length, flags })
    }
}

/// An owned frame popped from or destined for a ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    compressed: bool,
    payload: Vec<u8>,
}

impl Frame {
    /// Data frame carrying `payload` (already encoded by the codec)
    #[must_use]
    pub fn data(payload: Vec<u8>, compressed: bool) -> Self {
        Self {
            kind: FrameKind::Data,
            compressed,
            payload,
        }
    }

    /// Control frame of `kind`
    #[must_use]
    pub fn control(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            compressed: false,
            payload,
        }
    }

    /// Frame kind
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Whether the payload is compressed
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Flags byte for this frame
    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::new(self.kind).with_compressed(self.compressed)
    }

    /// Payload bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame, returning the payload
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub(crate) fn from_parts(flags: FrameFlags, payload: Vec<u8>) -> Result<Self> {
        Ok(Self {
            kind: flags.kind()?,
            compressed: flags.is_compressed(),
            payload,
        })
    }
}
