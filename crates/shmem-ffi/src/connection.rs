//! Connection and server API FFI
//!
//! Every call blocks the calling thread on the shared runtime. Reads hand
//! out a buffer owned by the connection handle, valid until the next read
//! or close on that handle.
//!
//! One thread may read while another writes on the same handle. Read state
//! sits behind a mutex, so concurrent reads serialize; `shmem_close` must
//! not race with any other call on the handle.

use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use parking_lot::Mutex;
use shmem_transport::{Connection, Listener};
use tokio::runtime::Runtime;

use crate::error::{ShmemError, ShmemErrorCode, report};
use crate::options::options_or_default;
use crate::{ShmemConnection, ShmemOptions, ShmemServer, ffi_try, from_c_string, runtime};

/// Internal representation of ShmemConnection
pub(crate) struct ConnectionHandle {
    pub(crate) conn: Connection,
    pub(crate) runtime: Arc<Runtime>,
    reads: Mutex<ReadState>,
}

/// Buffers owned by the read side of a handle
#[derive(Default)]
struct ReadState {
    buf: Vec<u8>,
    pending: Option<Vec<u8>>,
}

impl ConnectionHandle {
    fn new(conn: Connection, runtime: Arc<Runtime>) -> Self {
        Self {
            conn,
            runtime,
            reads: Mutex::new(ReadState::default()),
        }
    }

    fn next_message(&self, reads: &mut ReadState) -> Result<Vec<u8>, ShmemError> {
        if let Some(pending) = reads.pending.take() {
            return Ok(pending);
        }
        Ok(self.runtime.block_on(self.conn.receive())?)
    }
}

/// Internal representation of ShmemServer
pub(crate) struct ServerHandle {
    pub(crate) listener: Listener,
    pub(crate) runtime: Arc<Runtime>,
}

/// Connection statistics
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ShmemStats {
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Messages sent
    pub frames_sent: u64,
    /// Messages received
    pub frames_received: u64,
    /// Messages sent compressed
    pub compressed_frames_sent: u64,
    /// Messages received compressed
    pub compressed_frames_received: u64,
}

unsafe fn null_argument(name: &str, error_out: *mut *mut c_char) -> c_int {
    report(
        ShmemError::invalid_argument(format!("{name} is null")),
        error_out,
    )
}

unsafe fn publish_connection(
    conn: Connection,
    runtime: Arc<Runtime>,
    conn_out: *mut *mut ShmemConnection,
) -> c_int {
    let handle = Box::new(ConnectionHandle::new(conn, runtime));
    *conn_out = Box::into_raw(handle) as *mut ShmemConnection;
    ShmemErrorCode::Success as c_int
}

/// Connect to the channel `name` as a client
///
/// Retries until the server has created the channel or the connect timeout
/// expires. A null `options` uses the defaults plus `SHMEM_*` overrides.
///
/// # Safety
///
/// - `name` must be a valid null-terminated UTF-8 string
/// - `options` must be null or a valid options handle
/// - `conn_out` must be a valid pointer to receive the connection handle
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_connect(
    name: *const c_char,
    options: *const ShmemOptions,
    conn_out: *mut *mut ShmemConnection,
    error_out: *mut *mut c_char,
) -> c_int {
    if conn_out.is_null() {
        return null_argument("conn_out", error_out);
    }
    let name = ffi_try!(
        from_c_string(name).ok_or_else(|| ShmemError::invalid_argument("name is null or not UTF-8")),
        error_out
    );
    let options = ffi_try!(options_or_default(options), error_out);
    let runtime = ffi_try!(runtime(), error_out);

    let conn = ffi_try!(
        runtime.block_on(shmem_transport::connect(&name, options)),
        error_out
    );
    publish_connection(conn, runtime, conn_out)
}

/// Connect to the channel of numbered backend `id`
///
/// # Safety
///
/// - `options` must be null or a valid options handle
/// - `conn_out` must be a valid pointer to receive the connection handle
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_connect_id(
    id: usize,
    options: *const ShmemOptions,
    conn_out: *mut *mut ShmemConnection,
    error_out: *mut *mut c_char,
) -> c_int {
    if conn_out.is_null() {
        return null_argument("conn_out", error_out);
    }
    let options = ffi_try!(options_or_default(options), error_out);
    let runtime = ffi_try!(runtime(), error_out);

    let conn = ffi_try!(
        runtime.block_on(shmem_transport::connect_backend(id, options)),
        error_out
    );
    publish_connection(conn, runtime, conn_out)
}

/// Listen on the channel `name`
///
/// # Safety
///
/// - `name` must be a valid null-terminated UTF-8 string
/// - `options` must be null or a valid options handle
/// - `server_out` must be a valid pointer to receive the server handle
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_server_init(
    name: *const c_char,
    options: *const ShmemOptions,
    server_out: *mut *mut ShmemServer,
    error_out: *mut *mut c_char,
) -> c_int {
    if server_out.is_null() {
        return null_argument("server_out", error_out);
    }
    let name = ffi_try!(
        from_c_string(name).ok_or_else(|| ShmemError::invalid_argument("name is null or not UTF-8")),
        error_out
    );
    let options = ffi_try!(options_or_default(options), error_out);
    let runtime = ffi_try!(runtime(), error_out);
    let listener = ffi_try!(Listener::bind(name, options), error_out);

    let handle = Box::new(ServerHandle { listener, runtime });
    *server_out = Box::into_raw(handle) as *mut ShmemServer;
    ShmemErrorCode::Success as c_int
}

/// Listen on the channel of numbered backend `id`
///
/// # Safety
///
/// - `options` must be null or a valid options handle
/// - `server_out` must be a valid pointer to receive the server handle
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_server_init_id(
    id: usize,
    options: *const ShmemOptions,
    server_out: *mut *mut ShmemServer,
    error_out: *mut *mut c_char,
) -> c_int {
    if server_out.is_null() {
        return null_argument("server_out", error_out);
    }
    let options = ffi_try!(options_or_default(options), error_out);
    let runtime = ffi_try!(runtime(), error_out);
    let listener = ffi_try!(Listener::from_backend(id, options), error_out);

    let handle = Box::new(ServerHandle { listener, runtime });
    *server_out = Box::into_raw(handle) as *mut ShmemServer;
    ShmemErrorCode::Success as c_int
}

/// Wait for the next client on a server channel
///
/// # Safety
///
/// - `server` must be a valid server handle
/// - `conn_out` must be a valid pointer to receive the connection handle
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_server_accept(
    server: *mut ShmemServer,
    conn_out: *mut *mut ShmemConnection,
    error_out: *mut *mut c_char,
) -> c_int {
    if server.is_null() {
        return null_argument("server", error_out);
    }
    if conn_out.is_null() {
        return null_argument("conn_out", error_out);
    }

    let handle = &*(server as *const ServerHandle);
    let runtime = handle.runtime.clone();
    let conn = ffi_try!(runtime.block_on(handle.listener.accept()), error_out);
    publish_connection(conn, runtime, conn_out)
}

/// Free a server handle
///
/// Connections accepted from it stay valid.
///
/// # Safety
///
/// - `server` must be null or a handle returned by `shmem_server_init()`
/// - `server` must not be used after this call
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_server_close(server: *mut ShmemServer) {
    if !server.is_null() {
        drop(Box::from_raw(server as *mut ServerHandle));
    }
}

/// Receive the next message
///
/// On success `*buf_out` points to `*len_out` bytes owned by the connection
/// handle, valid until the next read or close.
///
/// # Safety
///
/// - `conn` must be a valid connection handle
/// - the returned buffer must not be used once another thread reads on `conn`
/// - `buf_out` and `len_out` must be valid pointers
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_read(
    conn: *mut ShmemConnection,
    buf_out: *mut *const u8,
    len_out: *mut usize,
    error_out: *mut *mut c_char,
) -> c_int {
    if conn.is_null() {
        return null_argument("conn", error_out);
    }
    if buf_out.is_null() || len_out.is_null() {
        return null_argument("buf_out/len_out", error_out);
    }

    let handle = &*(conn as *const ConnectionHandle);
    let mut reads = handle.reads.lock();
    let message = ffi_try!(handle.next_message(&mut reads), error_out);
    reads.buf = message;
    *buf_out = reads.buf.as_ptr();
    *len_out = reads.buf.len();
    ShmemErrorCode::Success as c_int
}

/// Receive the next message into a caller buffer
///
/// If the message does not fit, nothing is copied, `*len_out` is set to the
/// required size, `InvalidArgument` is returned, and the message stays
/// queued for the next read.
///
/// # Safety
///
/// - `conn` must be a valid connection handle
/// - `buf` must be valid for `capacity` bytes of writes
/// - `len_out` must be a valid pointer
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_read_into(
    conn: *mut ShmemConnection,
    buf: *mut u8,
    capacity: usize,
    len_out: *mut usize,
    error_out: *mut *mut c_char,
) -> c_int {
    if conn.is_null() {
        return null_argument("conn", error_out);
    }
    if len_out.is_null() {
        return null_argument("len_out", error_out);
    }

    let handle = &*(conn as *const ConnectionHandle);
    let mut reads = handle.reads.lock();
    let message = ffi_try!(handle.next_message(&mut reads), error_out);
    *len_out = message.len();

    if message.len() > capacity || (buf.is_null() && !message.is_empty()) {
        let needed = message.len();
        reads.pending = Some(message);
        return report(
            ShmemError::invalid_argument(format!(
                "buffer of {capacity} bytes too small for a {needed}-byte message"
            )),
            error_out,
        );
    }
    if !message.is_empty() {
        std::ptr::copy_nonoverlapping(message.as_ptr(), buf, message.len());
    }
    ShmemErrorCode::Success as c_int
}

/// Send one message
///
/// # Safety
///
/// - `conn` must be a valid connection handle
/// - `buf` must be valid for `len` bytes of reads (may be null if `len` is 0)
/// - `error_out` must be null or a valid pointer to receive error message
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_write(
    conn: *mut ShmemConnection,
    buf: *const u8,
    len: usize,
    error_out: *mut *mut c_char,
) -> c_int {
    if conn.is_null() {
        return null_argument("conn", error_out);
    }
    if buf.is_null() && len > 0 {
        return null_argument("buf", error_out);
    }

    let payload: &[u8] = if len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(buf, len)
    };
    let handle = &*(conn as *const ConnectionHandle);
    ffi_try!(handle.runtime.block_on(handle.conn.send(payload)), error_out);
    ShmemErrorCode::Success as c_int
}

/// Get statistics for a connection
///
/// # Safety
///
/// - `conn` must be a valid connection handle
/// - `stats_out` must be a valid pointer
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_stats(
    conn: *const ShmemConnection,
    stats_out: *mut ShmemStats,
) -> c_int {
    if conn.is_null() || stats_out.is_null() {
        return ShmemErrorCode::InvalidArgument as c_int;
    }

    let handle = &*(conn as *const ConnectionHandle);
    let stats = handle.conn.stats();
    *stats_out = ShmemStats {
        bytes_sent: stats.bytes_sent,
        bytes_received: stats.bytes_received,
        frames_sent: stats.frames_sent,
        frames_received: stats.frames_received,
        compressed_frames_sent: stats.compressed_frames_sent,
        compressed_frames_received: stats.compressed_frames_received,
    };
    ShmemErrorCode::Success as c_int
}

/// Close a connection and free its handle
///
/// # Safety
///
/// - `conn` must be null or a handle returned by `shmem_connect()` or
///   `shmem_server_accept()`
/// - `conn` must not be used after this call
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shmem_close(conn: *mut ShmemConnection) -> c_int {
    if conn.is_null() {
        return ShmemErrorCode::InvalidArgument as c_int;
    }

    let handle = Box::from_raw(conn as *mut ConnectionHandle);
    let result = handle.runtime.block_on(handle.conn.close());
    drop(handle);
    match result {
        Ok(()) => ShmemErrorCode::Success as c_int,
        Err(e) => {
            tracing::warn!("Closing connection failed: {}", e);
            ShmemError::from(e).code as c_int
        }
    }
}
