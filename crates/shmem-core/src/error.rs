//! Error types for shmem-connect.

use thiserror::Error;

/// Convenience alias used throughout the workspace
pub type Result<T> = std::result::Result<T, Error>;

/// Transport errors
#[derive(Debug, Error)]
pub enum Error {
    /// A live segment with this name already exists
    #[error("segment already exists: {0}")]
    AlreadyExists(String),

    /// No ready segment with this name exists
    #[error("segment not found: {0}")]
    NotFound(String),

    /// Layout or handshake parameters disagree between the peers
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Framing or compression integrity violation
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    /// The peer stopped refreshing its heartbeat
    #[error("peer unresponsive for {timeout_ms} ms")]
    PeerUnresponsive {
        /// Configured liveness timeout
        timeout_ms: u64,
    },

    /// The caller cancelled a pending operation
    #[error("operation cancelled")]
    Cancelled,

    /// The segment already has an opener attached
    #[error("segment in use: {0}")]
    InUse(String),

    /// The session is draining or closed
    #[error("connection closed")]
    Closed,

    /// Payload exceeds the negotiated maximum frame size
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Offending payload size
        size: usize,
        /// Maximum frame size
        max: usize,
    },

    /// A connect or handshake deadline expired
    #[error("timed out: {0}")]
    Timeout(String),

    /// Invalid connection options
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not permitted in the current session state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable classification of [`Error`] values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::AlreadyExists`]
    AlreadyExists,
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::ProtocolMismatch`]
    ProtocolMismatch,
    /// See [`Error::CorruptFrame`]
    CorruptFrame,
    /// See [`Error::PeerUnresponsive`]
    PeerUnresponsive,
    /// See [`Error::Cancelled`]
    Cancelled,
    /// See [`Error::InUse`]
    InUse,
    /// See [`Error::Closed`]
    Closed,
    /// See [`Error::FrameTooLarge`]
    FrameTooLarge,
    /// See [`Error::Timeout`]
    Timeout,
    /// See [`Error::InvalidConfig`]
    InvalidConfig,
    /// See [`Error::InvalidState`]
    InvalidState,
    /// See [`Error::Io`]
    Io,
}

impl Error {
    /// Stable kind of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            Self::CorruptFrame(_) => ErrorKind::CorruptFrame,
            Self::PeerUnresponsive { .. } => ErrorKind::PeerUnresponsive,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InUse(_) => ErrorKind::InUse,
            Self::Closed => ErrorKind::Closed,
            Self::FrameTooLarge { .. } => ErrorKind::FrameTooLarge,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the error ends the session.
    ///
    /// Fatal errors move a session to `Error`; the caller has to reconnect.
    /// Everything else leaves the session usable and the call may be retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProtocolMismatch | ErrorKind::CorruptFrame | ErrorKind::PeerUnresponsive
        )
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptFrame(msg.into())
    }

    pub(crate) fn mismatch(msg: impl Into<String>) -> Self {
        Self::ProtocolMismatch(msg.into())
    }
}
