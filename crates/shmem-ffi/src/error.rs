//! Error handling for the FFI boundary

use std::os::raw::c_char;

use shmem_core::ErrorKind;

/// FFI error codes.
///
/// Every error kind of the Rust API has its own code so C callers can tell
/// "reconnect" (`PeerUnresponsive`, `CorruptFrame`, `Closed`) from "retry
/// the call" (`Timeout`, `FrameTooLarge`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmemErrorCode {
    /// Operation succeeded
    Success = 0,
    /// Invalid argument provided
    InvalidArgument = 1,
    /// A live segment already holds the name
    AlreadyExists = 2,
    /// No segment with that name
    NotFound = 3,
    /// Handshake or layout disagreement
    ProtocolMismatch = 4,
    /// Malformed frame or compressed payload
    CorruptFrame = 5,
    /// Peer stopped heartbeating
    PeerUnresponsive = 6,
    /// Operation cancelled
    Cancelled = 7,
    /// Segment already has an opener
    InUse = 8,
    /// Session closed
    Closed = 9,
    /// Payload exceeds the maximum frame size
    FrameTooLarge = 10,
    /// Deadline expired
    Timeout = 11,
    /// Invalid options
    InvalidConfig = 12,
    /// Operation not valid in the current state
    InvalidState = 13,
    /// I/O error
    IoError = 14,
    /// Internal error
    InternalError = 99,
}

impl From<i32> for ShmemErrorCode {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::InvalidArgument,
            2 => Self::AlreadyExists,
            3 => Self::NotFound,
            4 => Self::ProtocolMismatch,
            5 => Self::CorruptFrame,
            6 => Self::PeerUnresponsive,
            7 => Self::Cancelled,
            8 => Self::InUse,
            9 => Self::Closed,
            10 => Self::FrameTooLarge,
            11 => Self::Timeout,
            12 => Self::InvalidConfig,
            13 => Self::InvalidState,
            14 => Self::IoError,
            _ => Self::InternalError,
        }
    }
}

impl From<ErrorKind> for ShmemErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::AlreadyExists => Self::AlreadyExists,
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::ProtocolMismatch => Self::ProtocolMismatch,
            ErrorKind::CorruptFrame => Self::CorruptFrame,
            ErrorKind::PeerUnresponsive => Self::PeerUnresponsive,
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::InUse => Self::InUse,
            ErrorKind::Closed => Self::Closed,
            ErrorKind::FrameTooLarge => Self::FrameTooLarge,
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::InvalidConfig => Self::InvalidConfig,
            ErrorKind::InvalidState => Self::InvalidState,
            ErrorKind::Io => Self::IoError,
        }
    }
}

/// Error type for FFI operations
#[derive(Debug)]
pub struct ShmemError {
    /// Code returned to the caller
    pub code: ShmemErrorCode,
    /// Message written to `error_out`
    pub message: String,
}

impl ShmemError {
    /// Error with an explicit code
    pub fn new(code: ShmemErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `InvalidArgument` error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ShmemErrorCode::InvalidArgument, message)
    }

    /// `InternalError` error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ShmemErrorCode::InternalError, message)
    }

    /// Convert error to C-compatible error string
    pub fn to_c_string(&self) -> *mut c_char {
        crate::to_c_string(self.message.clone())
    }
}

impl From<shmem_core::Error> for ShmemError {
    fn from(err: shmem_core::Error) -> Self {
        Self::new(err.kind().into(), err.to_string())
    }
}

impl From<std::io::Error> for ShmemError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ShmemErrorCode::IoError, err.to_string())
    }
}

/// Write `err` to `error_out` (if non-null) and return its code.
///
/// # Safety
///
/// `error_out` must be null or valid for a pointer write.
pub(crate) unsafe fn report(err: ShmemError, error_out: *mut *mut c_char) -> i32 {
    if !error_out.is_null() {
        // SAFETY: checked non-null; validity is the caller's contract.
        unsafe {
            *error_out = err.to_c_string();
        }
    }
    err.code as i32
}

/// Helper macro for FFI error handling (for functions returning c_int error codes)
///
/// Writes error message to `error_out` if provided and returns error code.
#[macro_export]
macro_rules! ffi_try {
    ($result:expr, $error_out:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => {
                let shmem_err: $crate::error::ShmemError = err.into();
                if !$error_out.is_null() {
                    unsafe {
                        *$error_out = shmem_err.to_c_string();
                    }
                }
                return shmem_err.code as i32;
            }
        }
    };
}

/// Helper macro for FFI error handling (for functions returning pointers)
///
/// Writes error message to `error_out` if provided and returns null pointer.
#[macro_export]
macro_rules! ffi_try_ptr {
    ($result:expr, $error_out:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => {
                let shmem_err: $crate::error::ShmemError = err.into();
                if !$error_out.is_null() {
                    unsafe {
                        *$error_out = shmem_err.to_c_string();
                    }
                }
                return std::ptr::null_mut();
            }
        }
    };
}
