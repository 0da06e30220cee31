//! Fuzz target for LZ4 frame decoding
//!
//! Compressed payloads come from the peer; a forged size prefix or a broken
//! block must fail cleanly and never allocate past the frame limit.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shmem_core::Codec;

const MAX_FRAME: usize = 64 * 1024;

fuzz_target!(|input: (bool, Vec<u8>)| {
    let (compressed, bytes) = input;
    let codec = Codec::new(true, 1, MAX_FRAME);

    if let Ok(decoded) = codec.decode(compressed, bytes.clone()) {
        assert!(decoded.len() <= MAX_FRAME);
        if !compressed {
            assert_eq!(decoded, bytes);
        }
    }

    if bytes.len() <= MAX_FRAME {
        let encoded = codec.encode(&bytes);
        let restored = codec
            .decode(encoded.compressed, encoded.bytes.into_owned())
            .expect("own encoding must decode");
        assert_eq!(restored, bytes);
    }
});
