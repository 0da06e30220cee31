//! # shmem-connect transport
//!
//! tokio integration for shmem-connect: named-FIFO doorbells, the reactor
//! bridge that turns shared-memory readiness into task wakeups, and the
//! async [`Connection`] built on top of them.
//!
//! ## Example
//!
//! ```no_run
//! use shmem_core::ConnectionOptions;
//!
//! # async fn example() -> shmem_core::Result<()> {
//! let options = ConnectionOptions::default().with_capacity(4096);
//!
//! // server side
//! let server = tokio::spawn(async move {
//!     let conn = shmem_transport::accept("chan1", ConnectionOptions::default().with_capacity(4096)).await?;
//!     let ping = conn.receive().await?;
//!     conn.send(&ping).await?;
//!     conn.close().await
//! });
//!
//! // client side
//! let conn = shmem_transport::connect("chan1", options).await?;
//! conn.send(b"ping").await?;
//! assert_eq!(conn.receive().await?, b"ping");
//! conn.close().await?;
//! # let _ = server;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bridge;
pub mod connection;
pub mod doorbell;
pub mod listener;
pub mod transport;

pub use bridge::{BridgeConfig, LinkStatus, ReactorBridge};
pub use connection::{Canceller, Connection, accept, connect};
pub use listener::Listener;
pub use transport::{Transport, TransportStats};

use shmem_core::{ConnectionOptions, Result, resolve_backend};

/// Connect to the channel of backend `id`.
///
/// The backend's compression default is applied on top of `options`; the
/// creator still has to agree during the handshake.
///
/// # Errors
///
/// Returns [`shmem_core::Error::InvalidConfig`] for an unknown id, otherwise
/// the errors of [`connect`].
pub async fn connect_backend(id: usize, options: ConnectionOptions) -> Result<Connection> {
    let backend = resolve_backend(id)?;
    let options = ConnectionOptions {
        compression: options.compression || backend.compress,
        ..options
    };
    connect(&backend.channel, options).await
}
