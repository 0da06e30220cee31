//! # shmem-connect core
//!
//! Process-independent building blocks of the shmem-connect transport.
//!
//! This crate provides:
//! - Named shared-memory segments (create, open, release, destroy)
//! - Single-producer/single-consumer ring buffers carrying length-prefixed frames
//! - LZ4 block compression for large payloads
//! - The handshake record and the session state machine
//! - Connection options and the error taxonomy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Session                                  │
//! │   (handshake, state machine, liveness, statistics)              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Codec                                    │
//! │   (LZ4 block compression above a size threshold)                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Ring Buffers (x2)                             │
//! │   (creator -> opener, opener -> creator; framed records)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                   Shared-Memory Segment                          │
//! │   (header + two ring regions in one mapped file)                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The tokio integration lives in `shmem-transport`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod clock;
pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod layout;
pub mod options;
pub mod ring;
pub mod segment;
pub mod session;

pub use backend::{BACKENDS, BackendInfo, ResolvedBackend, resolve_backend};
pub use codec::{Codec, Encoded};
pub use error::{Error, ErrorKind, Result};
pub use frame::{Frame, FrameFlags, FrameHeader, FrameKind};
pub use handshake::{Hello, HelloAck, HelloStatus};
pub use layout::{Role, SegmentLayout};
pub use options::ConnectionOptions;
pub use ring::{RingConsumer, RingProducer};
pub use segment::{HeartbeatHandle, PeerLiveness, Segment, SegmentInfo};
pub use session::{Session, SessionState, SessionStats};

/// Protocol version written into every segment header and handshake
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Segment magic (`"SHMCONN\0"`)
pub const SEGMENT_MAGIC: [u8; 8] = *b"SHMCONN\0";

/// Size of a frame header slot inside the ring (length, flags, reserved)
pub const RECORD_HEADER_SIZE: usize = 8;

/// Ring records are padded to this alignment
pub const RECORD_ALIGN: usize = 8;

/// Smallest permitted ring capacity
pub const MIN_CAPACITY: usize = 64;

/// Default ring capacity per direction (4 MiB)
pub const DEFAULT_CAPACITY: usize = 4 * 1024 * 1024;

/// Default maximum frame payload (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default compression threshold in bytes
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 250_000;

/// Round `len` up to the record alignment.
#[must_use]
pub const fn align_record(len: usize) -> usize {
    (len + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

/// Bytes a payload of `len` bytes occupies in the ring, header included.
#[must_use]
pub const fn record_size(len: usize) -> usize {
    RECORD_HEADER_SIZE + align_record(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size() {
        assert_eq!(record_size(0), 8);
        assert_eq!(record_size(1), 16);
        assert_eq!(record_size(8), 16);
        assert_eq!(record_size(9), 24);
    }

    #[test]
    fn test_constants_consistent() {
        assert!(DEFAULT_CAPACITY.is_power_of_two());
        assert!(record_size(DEFAULT_MAX_FRAME_SIZE) <= DEFAULT_CAPACITY);
        assert!(DEFAULT_COMPRESSION_THRESHOLD < DEFAULT_MAX_FRAME_SIZE);
    }
}
