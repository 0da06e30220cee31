//! Fuzz target for ring record headers
//!
//! A peer process can write anything into the ring; header decoding must
//! reject garbage without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shmem_core::{FrameFlags, FrameHeader};

fuzz_target!(|input: ([u8; 8], u32)| {
    let (raw, max) = input;
    let max = max as usize % (1 << 24);

    if let Ok(header) = FrameHeader::decode(&raw, max) {
        assert!(header.length as usize <= max);
        assert_eq!(header.encode(), raw);
    }

    let flags = FrameFlags::from_u8(raw[4]);
    if let Ok(kind) = flags.kind() {
        assert_eq!(FrameFlags::new(kind).with_compressed(flags.is_compressed()).kind().ok(), Some(kind));
    }
});
