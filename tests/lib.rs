//! Shared fixtures for the shmem-connect integration tests.


pub use test_helpers::{
    ci_timeout, is_ci_environment, numbered_payload, pair, payload_number, small_options,
};
