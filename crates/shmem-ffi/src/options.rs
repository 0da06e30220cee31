//! Connection options FFI

use std::os::raw::{c_char, c_int};
use std::time::Duration;

use shmem_core::ConnectionOptions;

use crate::error::{ShmemError, ShmemErrorCode, report};
use crate::{ShmemOptions, ffi_try, ffi_try_ptr, from_c_string};

/// Internal representation of ShmemOptions
pub(crate) struct OptionsHandle {
    pub(crate) options: ConnectionOptions,
}

/// Options used when a caller passes a null options handle
pub(crate) unsafe fn options_or_default(
    options: *const ShmemOptions,
) -> Result<ConnectionOptions, ShmemError> {
    if options.is_null() {
        return Ok(ConnectionOptions::from_env()?);
    }
    Ok((*(options as *const OptionsHandle)).options.clone())
}

unsafe fn handle_mut<'a>(
    options: *mut ShmemOptions,
    error_out: *mut *mut c_char,
) -> Result<&'a mut OptionsHandle, c_int> {
    if options.is_null() {
        return Err(report(
            ShmemError::invalid_argument("options is null"),
            error_out,
        ));
    }
    Ok(&mut *(options as *mut OptionsHandle))
}

/// Create options with defaults overridden by `SHMEM_*` environment variables
///
/// Returns null if an environment variable does not parse.
///
/// # Safety
///
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_options_new(error_out: *mut *mut c_char) -> *mut ShmemOptions {
    let options = ffi_try_ptr!(ConnectionOptions::from_env(), error_out);
    Box::into_raw(Box::new(OptionsHandle { options })) as *mut ShmemOptions
}

/// Free an options handle
///
/// # Safety
///
/// - `options` must be null or a pointer returned by `shmem_options_new()`
/// - `options` must not be used after this call
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_options_free(options: *mut ShmemOptions) {
    if !options.is_null() {
        drop(Box::from_raw(options as *mut OptionsHandle));
    }
}

/// Set the ring capacity (power of two); the maximum frame size shrinks to fit
///
/// # Safety
///
/// - `options` must be a valid options handle
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_options_set_capacity(
    options: *mut ShmemOptions,
    capacity: usize,
    error_out: *mut *mut c_char,
) -> c_int {
    let handle = match handle_mut(options, error_out) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    let updated = handle.options.clone().with_capacity(capacity);
    ffi_try!(updated.validate(), error_out);
    handle.options = updated;
    ShmemErrorCode::Success as c_int
}

/// Set the maximum frame size
///
/// # Safety
///
/// - `options` must be a valid options handle
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_options_set_max_frame_size(
    options: *mut ShmemOptions,
    max_frame_size: usize,
    error_out: *mut *mut c_char,
) -> c_int {
    let handle = match handle_mut(options, error_out) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    let updated = handle.options.clone().with_max_frame_size(max_frame_size);
    ffi_try!(updated.validate(), error_out);
    handle.options = updated;
    ShmemErrorCode::Success as c_int
}

/// Enable (non-zero) or disable compression with a size threshold
///
/// # Safety
///
/// - `options` must be a valid options handle
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_options_set_compression(
    options: *mut ShmemOptions,
    enabled: c_int,
    threshold: usize,
    error_out: *mut *mut c_char,
) -> c_int {
    let handle = match handle_mut(options, error_out) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    let updated = handle
        .options
        .clone()
        .with_compression(enabled != 0, threshold);
    ffi_try!(updated.validate(), error_out);
    handle.options = updated;
    ShmemErrorCode::Success as c_int
}

/// Set the heartbeat interval in milliseconds
///
/// # Safety
///
/// - `options` must be a valid options handle
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_options_set_heartbeat_ms(
    options: *mut ShmemOptions,
    heartbeat_ms: u32,
    error_out: *mut *mut c_char,
) -> c_int {
    let handle = match handle_mut(options, error_out) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    let mut updated = handle.options.clone();
    updated.heartbeat_interval = Duration::from_millis(u64::from(heartbeat_ms));
    ffi_try!(updated.validate(), error_out);
    handle.options = updated;
    ShmemErrorCode::Success as c_int
}

/// Set the liveness timeout in milliseconds
///
/// # Safety
///
/// - `options` must be a valid options handle
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_options_set_liveness_ms(
    options: *mut ShmemOptions,
    liveness_ms: u32,
    error_out: *mut *mut c_char,
) -> c_int {
    let handle = match handle_mut(options, error_out) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    let mut updated = handle.options.clone();
    updated.liveness_timeout = Duration::from_millis(u64::from(liveness_ms));
    ffi_try!(updated.validate(), error_out);
    handle.options = updated;
    ShmemErrorCode::Success as c_int
}

/// Set how long connect keeps retrying a missing segment, in milliseconds
///
/// # Safety
///
/// - `options` must be a valid options handle
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_options_set_connect_timeout_ms(
    options: *mut ShmemOptions,
    timeout_ms: u32,
    error_out: *mut *mut c_char,
) -> c_int {
    let handle = match handle_mut(options, error_out) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    handle.options.connect_timeout = Duration::from_millis(u64::from(timeout_ms));
    ShmemErrorCode::Success as c_int
}

/// Set the directory segments are created in
///
/// # Safety
///
/// - `options` must be a valid options handle
/// - `dir` must be a valid null-terminated UTF-8 string
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_options_set_shm_dir(
    options: *mut ShmemOptions,
    dir: *const c_char,
    error_out: *mut *mut c_char,
) -> c_int {
    let handle = match handle_mut(options, error_out) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    let dir = ffi_try!(
        from_c_string(dir).ok_or_else(|| ShmemError::invalid_argument("dir is null or not UTF-8")),
        error_out
    );
    handle.options.shm_dir = Some(dir.into());
    ShmemErrorCode::Success as c_int
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn new_options() -> *mut ShmemOptions {
        let options = unsafe { shmem_options_new(std::ptr::null_mut()) };
        assert!(!options.is_null());
        options
    }

    #[test]
    fn test_setters() {
        let options = new_options();
        let dir = CString::new("/tmp/shmem-ffi-test").unwrap();
        unsafe {
            assert_eq!(shmem_options_set_capacity(options, 8192, std::ptr::null_mut()), 0);
            assert_eq!(
                shmem_options_set_max_frame_size(options, 2048, std::ptr::null_mut()),
                0
            );
            assert_eq!(
                shmem_options_set_compression(options, 1, 512, std::ptr::null_mut()),
                0
            );
            assert_eq!(shmem_options_set_liveness_ms(options, 3000, std::ptr::null_mut()), 0);
            assert_eq!(shmem_options_set_heartbeat_ms(options, 50, std::ptr::null_mut()), 0);
            assert_eq!(
                shmem_options_set_shm_dir(options, dir.as_ptr(), std::ptr::null_mut()),
                0
            );

            let resolved = options_or_default(options).unwrap();
            assert_eq!(resolved.capacity, 8192);
            assert_eq!(resolved.max_frame_size, 2048);
            assert!(resolved.compression);
            assert_eq!(resolved.compression_threshold, 512);
            assert_eq!(resolved.heartbeat_interval, Duration::from_millis(50));
            assert_eq!(resolved.liveness_timeout, Duration::from_millis(3000));
            assert_eq!(resolved.shm_dir.as_deref(), Some(std::path::Path::new("/tmp/shmem-ffi-test")));
            shmem_options_free(options);
        }
    }

    #[test]
    fn test_invalid_value_is_rejected_and_kept() {
        let options = new_options();
        let mut error_out: *mut c_char = std::ptr::null_mut();
        unsafe {
            let code = shmem_options_set_capacity(options, 1000, &mut error_out);
            assert_eq!(code, ShmemErrorCode::InvalidConfig as c_int);
            assert!(!error_out.is_null());
            crate::shmem_free_string(error_out);

            let resolved = options_or_default(options).unwrap();
            assert_eq!(resolved.capacity, shmem_core::DEFAULT_CAPACITY);
            shmem_options_free(options);
        }
    }

    #[test]
    fn test_null_handle() {
        unsafe {
            assert_eq!(
                shmem_options_set_capacity(std::ptr::null_mut(), 4096, std::ptr::null_mut()),
                ShmemErrorCode::InvalidArgument as c_int
            );
            shmem_options_free(std::ptr::null_mut());
        }
    }
}
