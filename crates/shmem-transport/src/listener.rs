//! Server entry point.
//!
//! A [`Listener`] owns one channel name and hands out sessions one after
//! another: each [`Listener::accept`] creates the segment, waits for a
//! client and returns the established [`Connection`]. The creator removes
//! the segment when its session closes, so the next `accept` can reuse the
//! name right away.

use std::sync::atomic::{AtomicU64, Ordering};

use shmem_core::{ConnectionOptions, Result, resolve_backend};

use crate::connection::{self, Connection};

/// Sequential acceptor for one channel
#[derive(Debug)]
pub struct Listener {
    name: String,
    options: ConnectionOptions,
    accepted: AtomicU64,
}

impl Listener {
    /// Listen on channel `name`.
    ///
    /// # Errors
    ///
    /// Returns [`shmem_core::Error::InvalidConfig`] for invalid options.
    pub fn bind(name: impl Into<String>, options: ConnectionOptions) -> Result<Self> {
        options.validate()?;
        let name = name.into();
        tracing::info!("Listening on channel {}", name);
        Ok(Self {
            name,
            options,
            accepted: AtomicU64::new(0),
        })
    }

    /// Listen on the channel of backend `id`.
    ///
    /// The backend's compression default is applied on top of `options`.
    ///
    /// # Errors
    ///
    /// Returns [`shmem_core::Error::InvalidConfig`] for an unknown id or
    /// invalid options.
    pub fn from_backend(id: usize, options: ConnectionOptions) -> Result<Self> {
        let backend = resolve_backend(id)?;
        let options = ConnectionOptions {
            compression: options.compression || backend.compress,
            ..options
        };
        Self::bind(backend.channel, options)
    }

    /// Wait for the next client.
    ///
    /// # Errors
    ///
    /// See [`connection::accept`]. A failed handshake does not poison the
    /// listener; call `accept` again.
    pub async fn accept(&self) -> Result<Connection> {
        let conn = connection::accept(&self.name, self.options.clone()).await?;
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Channel name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options every session is accepted with
    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Number of sessions accepted so far
    #[must_use]
    pub fn sessions_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}
