//! Fuzz target for handshake records
//!
//! Tests that Hello and HelloAck decoding handles arbitrary input without
//! panicking, and that accepted records re-encode to the same bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shmem_core::{Hello, HelloAck};

fuzz_target!(|data: &[u8]| {
    if let Ok(hello) = Hello::decode(data) {
        assert_eq!(hello.encode(), data);
        let _ = hello.check_compatible(&hello);
        let _ = hello.negotiate(&hello).codec();
    }

    if let Ok(ack) = HelloAck::decode(data) {
        assert_eq!(ack.encode(), data);
    }
});
