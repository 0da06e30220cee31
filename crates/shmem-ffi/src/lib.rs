//! # shmem-ffi - C-compatible FFI bindings
//!
//! This crate provides a stable C ABI for shmem-connect, so C and C++
//! programs (and anything with a C FFI) can connect to or serve a channel.
//!
//! ## Threading
//!
//! All handles share one process-wide tokio runtime with a single worker
//! thread. Calls block the calling thread until they complete; the worker
//! keeps heartbeats and doorbells running between calls, so a caller that
//! sits idle does not look dead to its peer.
//!
//! ## Safety
//!
//! All FFI functions taking pointers are marked `unsafe`. Callers must ensure:
//! - Valid pointers (non-null where required, pointing to initialized data)
//! - Proper memory ownership (don't double-free, don't use-after-free)
//! - String encoding (UTF-8, NUL-terminated)
//! - A connection handle is used by one thread at a time
//!
//! ## Memory Management
//!
//! - Rust owns all opaque handle memory (options, servers, connections)
//! - Buffers returned by `shmem_read()` belong to the connection handle and
//!   stay valid until the next read or close on that handle
//! - Error strings must be freed with `shmem_free_string()`
//!
//! ## Error Handling
//!
//! Functions return a [`ShmemErrorCode`] (0 = success). Error details are
//! written to an optional `error_out` parameter.

// FFI code inherently requires unsafe operations within unsafe functions
#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::sync::{Arc, OnceLock};

use tokio::runtime::Runtime;

pub mod connection;
pub mod error;
pub mod options;

pub use error::{ShmemError, ShmemErrorCode};

/// Opaque handle to connection options
#[repr(C)]
pub struct ShmemOptions {
    _private: [u8; 0],
}

/// Opaque handle to a listening server channel
#[repr(C)]
pub struct ShmemServer {
    _private: [u8; 0],
}

/// Opaque handle to an established connection
#[repr(C)]
pub struct ShmemConnection {
    _private: [u8; 0],
}

static RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

/// Shared runtime, built on first use
pub(crate) fn runtime() -> Result<Arc<Runtime>, ShmemError> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime.clone());
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("shmem-reactor")
        .enable_all()
        .build()?;
    Ok(RUNTIME.get_or_init(|| Arc::new(runtime)).clone())
}

/// Initialize the shmem-connect FFI library
///
/// Installs logging (`RUST_LOG`, default `info`) and starts the shared
/// runtime. Returns 0 on success.
///
/// # Safety
///
/// Safe to call multiple times (idempotent).
#[unsafe(no_mangle)]
pub extern "C" fn shmem_init() -> c_int {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    match runtime() {
        Ok(_) => ShmemErrorCode::Success as c_int,
        Err(e) => e.code as c_int,
    }
}

/// Get the version string of the library
///
/// Returns a pointer to a static null-terminated string.
/// Caller must NOT free this pointer.
#[unsafe(no_mangle)]
pub extern "C" fn shmem_version() -> *const c_char {
    const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr().cast()
}

/// Free a string returned by shmem-connect FFI functions
///
/// # Safety
///
/// - `s` must be a valid pointer returned by a shmem-connect FFI function
/// - `s` must not be used after this call
/// - `s` must not be freed multiple times
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Rust string to an owned C string; interior NULs become spaces
pub(crate) fn to_c_string(s: String) -> *mut c_char {
    let bytes: Vec<u8> = s
        .into_bytes()
        .into_iter()
        .map(|b| if b == 0 { b' ' } else { b })
        .collect();
    CString::new(bytes).unwrap_or_default().into_raw()
}

/// Helper to convert C string to Rust String
///
/// # Safety
///
/// - `s` must be null or a valid null-terminated string
pub(crate) unsafe fn from_c_string(s: *const c_char) -> Option<String> {
    if s.is_null() {
        None
    } else {
        CStr::from_ptr(s).to_str().ok().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_idempotent() {
        assert_eq!(shmem_init(), 0);
        assert_eq!(shmem_init(), 0);
    }

    #[test]
    fn test_version() {
        let version_ptr = shmem_version();
        assert!(!version_ptr.is_null());
        assert_eq!(version_ptr, shmem_version());

        unsafe {
            let version = CStr::from_ptr(version_ptr).to_str().unwrap();
            assert_eq!(version, env!("CARGO_PKG_VERSION"));
        }
    }

    #[test]
    fn test_string_conversion() {
        let c_str = to_c_string("test string".to_string());
        unsafe {
            assert_eq!(from_c_string(c_str), Some("test string".to_string()));
            shmem_free_string(c_str);
        }
    }

    #[test]
    fn test_from_null_string() {
        unsafe {
            assert_eq!(from_c_string(std::ptr::null()), None);
        }
    }

    #[test]
    fn test_free_null_string() {
        unsafe {
            shmem_free_string(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_runtime_is_shared() {
        let a = runtime().unwrap();
        let b = runtime().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
