//! Fuzz target for environment overrides
//!
//! Arbitrary `SHMEM_*` values must parse or be rejected with an error, and
//! validation must cope with whatever parsed.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shmem_core::ConnectionOptions;

#[derive(Debug, Arbitrary)]
struct Overrides {
    values: Vec<(u8, String)>,
}

const KEYS: &[&str] = &[
    "SHMEM_CAPACITY",
    "SHMEM_MAX_FRAME_SIZE",
    "SHMEM_COMPRESSION",
    "SHMEM_COMPRESSION_THRESHOLD",
    "SHMEM_HEARTBEAT_MS",
    "SHMEM_LIVENESS_MS",
    "SHMEM_DIR",
];

fuzz_target!(|input: Overrides| {
    let lookup = |key: &str| {
        input
            .values
            .iter()
            .rev()
            .find(|(index, _)| KEYS[*index as usize % KEYS.len()] == key)
            .map(|(_, value)| value.clone())
    };

    if let Ok(options) = ConnectionOptions::default().apply_env(lookup) {
        if options.validate().is_ok() {
            assert!(options.layout().validate().is_ok());
        }
    }
});
