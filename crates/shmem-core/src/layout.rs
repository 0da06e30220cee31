//! Shared memory layout.
//!
//! ```text
//! offset 0      SegmentHeader            (SEGMENT_HEADER_SIZE bytes)
//! +256          RingHeader[0]            creator -> opener
//! +384          RingHeader[1]            opener -> creator
//! +512          ring data[0]             capacity bytes
//! +512+cap      ring data[1]             capacity bytes
//! ```
//!
//! Both processes map the same file, so every type here is `#[repr(C)]` and
//! only holds plain integers or atomics. Fields the creator writes before
//! publishing `ready` are plain; everything touched afterwards is atomic.

use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::error::{Error, Result};
use crate::{MIN_CAPACITY, record_size};

/// Bytes reserved for the segment header
pub const SEGMENT_HEADER_SIZE: usize = 256;

/// Bytes reserved for each ring header
pub const RING_HEADER_SIZE: usize = 128;

/// Offset of the first ring header
pub const RING_HEADERS_OFFSET: usize = SEGMENT_HEADER_SIZE;

/// Offset of the first ring data region
pub const RING_DATA_OFFSET: usize = SEGMENT_HEADER_SIZE + 2 * RING_HEADER_SIZE;

/// Which side of a segment a process is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Created the segment (the server / `accept` side)
    Creator,
    /// Opened an existing segment (the client / `connect` side)
    Opener,
}

impl Role {
    /// Index into per-role header arrays
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Creator => 0,
            Self::Opener => 1,
        }
    }

    /// The other side
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Creator => Self::Opener,
            Self::Opener => Self::Creator,
        }
    }

    /// Ring this role produces into
    #[must_use]
    pub fn outbound_ring(self) -> usize {
        self.index()
    }

    /// Ring this role consumes from
    #[must_use]
    pub fn inbound_ring(self) -> usize {
        self.peer().index()
    }

    /// Short tag used in file names and logs
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Creator => "c",
            Self::Opener => "o",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creator => write!(f, "creator"),
            Self::Opener => write!(f, "opener"),
        }
    }
}

/// Segment header at offset 0 of the mapping
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// [`crate::SEGMENT_MAGIC`]
    pub magic: [u8; 8],
    /// [`crate::PROTOCOL_VERSION`]
    pub version: u32,
    /// Set to 1 (release) once the creator finished initialising
    pub ready: AtomicU32,
    /// Ring capacity per direction
    pub capacity: u64,
    /// Maximum frame payload
    pub max_frame_size: u32,
    /// Pid of the creating process
    pub creator_pid: u32,
    /// Pid of the attached opener, 0 while unclaimed
    pub opener_pid: AtomicU32,
    /// Set once by whoever removes the backing file
    pub destroy_claimed: AtomicU32,
    /// Number of attached processes
    pub attached: AtomicU32,
    _reserved: u32,
    /// Per-role heartbeat stamps in monotonic milliseconds
    pub heartbeat: [AtomicU64; 2],
    /// Per-role closed flags
    pub closed: [AtomicU32; 2],
}

/// Ring indices, one per direction
///
/// The producer owns `head`/`pushed`, the consumer owns `tail`/`popped`;
/// the two pairs sit on separate cache lines.
#[repr(C, align(64))]
pub struct RingHeader {
    /// Total bytes ever written (monotonic)
    pub head: AtomicU64,
    /// Total frames ever written
    pub pushed: AtomicU64,
    _pad0: [u8; 48],
    /// Total bytes ever consumed (monotonic)
    pub tail: AtomicU64,
    /// Total frames ever consumed
    pub popped: AtomicU64,
    _pad1: [u8; 48],
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() <= SEGMENT_HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<RingHeader>() == RING_HEADER_SIZE);

/// Geometry of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    /// Ring capacity per direction (power of two)
    pub capacity: usize,
    /// Maximum frame payload
    pub max_frame_size: usize,
}

impl SegmentLayout {
    /// Validated layout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the capacity is not a power of
    /// two, is below [`MIN_CAPACITY`], or cannot hold one maximum frame.
    pub fn new(capacity: usize, max_frame_size: usize) -> Result<Self> {
        let layout = Self {
            capacity,
            max_frame_size,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Check the layout invariants.
    ///
    /// # Errors
    ///
    /// See [`SegmentLayout::new`].
    pub fn validate(&self) -> Result<()> {
        if !self.capacity.is_power_of_two() || self.capacity < MIN_CAPACITY {
            return Err(Error::InvalidConfig(format!(
                "capacity {} must be a power of two >= {MIN_CAPACITY}",
                self.capacity
            )));
        }
        if self.capacity > (u32::MAX as usize) + 1 {
            return Err(Error::InvalidConfig(format!(
                "capacity {} exceeds 4 GiB",
                self.capacity
            )));
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max frame size {} out of range",
                self.max_frame_size
            )));
        }
        if record_size(self.max_frame_size) > self.capacity {
            return Err(Error::InvalidConfig(format!(
                "max frame size {} does not fit a ring of {} bytes",
                self.max_frame_size, self.capacity
            )));
        }
        Ok(())
    }

    /// Total mapped size in bytes
    #[must_use]
    pub fn total_size(&self) -> usize {
        RING_DATA_OFFSET + 2 * self.capacity
    }

    /// Offset of ring header `ring`
    #[must_use]
    pub fn ring_header_offset(&self, ring: usize) -> usize {
        RING_HEADERS_OFFSET + ring * RING_HEADER_SIZE
    }

    /// Offset of ring data region `ring`
    #[must_use]
    pub fn ring_data_offset(&self, ring: usize) -> usize {
        RING_DATA_OFFSET + ring * self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_rings() {
        assert_eq!(Role::Creator.outbound_ring(), Role::Opener.inbound_ring());
        assert_eq!(Role::Opener.outbound_ring(), Role::Creator.inbound_ring());
        assert_ne!(Role::Creator.outbound_ring(), Role::Creator.inbound_ring());
        assert_eq!(Role::Creator.peer(), Role::Opener);
    }

    #[test]
    fn test_layout_offsets() {
        let layout = SegmentLayout::new(4096, 1024).unwrap();
        assert_eq!(layout.ring_header_offset(0), 256);
        assert_eq!(layout.ring_header_offset(1), 384);
        assert_eq!(layout.ring_data_offset(0), 512);
        assert_eq!(layout.ring_data_offset(1), 512 + 4096);
        assert_eq!(layout.total_size(), 512 + 8192);
    }

    #[test]
    fn test_layout_rejects_bad_capacity() {
        assert!(SegmentLayout::new(100, 16).is_err());
        assert!(SegmentLayout::new(32, 16).is_err());
        assert!(SegmentLayout::new(64, 56).is_ok());
        assert!(SegmentLayout::new(64, 57).is_err());
        assert!(SegmentLayout::new(64, 0).is_err());
    }
}
