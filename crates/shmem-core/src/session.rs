//! Session state machine and statistics.
//!
//! A Session tracks one logical connection over a segment pair:
//!
//! ```text
//! Connecting -> Established -> Draining -> Closed
//!      \             \            \
//!       +-------------+------------+--> Error (absorbing)
//! ```
//!
//! The state machine is pure bookkeeping; the I/O lives in
//! `shmem_transport::Connection`.

use std::time::Instant;

use crate::error::{Error, ErrorKind, Result};
use crate::layout::Role;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Segment created/opened, handshake in progress
    Connecting,
    /// Handshake complete, data flows both ways
    Established,
    /// A close frame was sent or received; no new sends
    Draining,
    /// Torn down
    Closed,
    /// Failed; no further transitions
    Error,
}

impl SessionState {
    /// Whether no further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }

    /// Whether new sends are accepted
    #[must_use]
    pub fn can_send(self) -> bool {
        self == Self::Established
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Established => "established",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// One side of a connection
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    role: Role,
    established_at: Option<Instant>,
    last_activity: Instant,
    failure: Option<ErrorKind>,
    bytes_sent: u64,
    bytes_received: u64,
    frames_sent: u64,
    frames_received: u64,
    compressed_frames_sent: u64,
    compressed_frames_received: u64,
}

impl Session {
    /// New session in `Connecting`
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            state: SessionState::Connecting,
            role,
            established_at: None,
            last_activity: Instant::now(),
            failure: None,
            bytes_sent: 0,
            bytes_received: 0,
            frames_sent: 0,
            frames_received: 0,
            compressed_frames_sent: 0,
            compressed_frames_received: 0,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// This side's role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Kind of the error that moved the session to `Error`
    #[must_use]
    pub fn failure(&self) -> Option<ErrorKind> {
        self.failure
    }

    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(&self, to: SessionState) -> bool {
        matches!(
            (self.state, to),
            (
                SessionState::Connecting,
                SessionState::Established | SessionState::Closed | SessionState::Error
            ) | (
                SessionState::Established,
                SessionState::Draining | SessionState::Closed | SessionState::Error
            ) | (
                SessionState::Draining,
                SessionState::Closed | SessionState::Error
            )
        )
    }

    /// Transition to a new state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the transition is not allowed.
    pub fn transition_to(&mut self, new_state: SessionState) -> Result<()> {
        if !self.can_transition(new_state) {
            return Err(Error::InvalidState(format!(
                "{} -> {}",
                self.state, new_state
            )));
        }

        let old_state = self.state;
        self.state = new_state;
        if new_state == SessionState::Established && self.established_at.is_none() {
            self.established_at = Some(Instant::now());
        }

        tracing::debug!(
            "Session ({}) state transition: {:?} -> {:?}",
            self.role,
            old_state,
            new_state
        );
        Ok(())
    }

    /// Move to `Error` after a fatal failure. No-op once terminal.
    pub fn fail(&mut self, kind: ErrorKind) {
        if self.state.is_terminal() {
            return;
        }
        self.failure = Some(kind);
        let _ = self.transition_to(SessionState::Error);
    }

    /// Move to `Closed` unless already terminal
    pub fn finish(&mut self) {
        if !self.state.is_terminal() {
            let _ = self.transition_to(SessionState::Closed);
        }
    }

    /// Account an outgoing data frame of `bytes` payload bytes
    pub fn record_sent(&mut self, bytes: usize, compressed: bool) {
        self.bytes_sent += bytes as u64;
        self.frames_sent += 1;
        if compressed {
            self.compressed_frames_sent += 1;
        }
        self.last_activity = Instant::now();
    }

    /// Account an incoming data frame of `bytes` payload bytes
    pub fn record_received(&mut self, bytes: usize, compressed: bool) {
        self.bytes_received += bytes as u64;
        self.frames_received += 1;
        if compressed {
            self.compressed_frames_received += 1;
        }
        self.last_activity = Instant::now();
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            frames_sent: self.frames_sent,
            frames_received: self.frames_received,
            compressed_frames_sent: self.compressed_frames_sent,
            compressed_frames_received: self.compressed_frames_received,
            established_at: self.established_at,
            last_activity: self.last_activity,
        }
    }
}

/// Session statistics snapshot
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Current session state
    pub state: SessionState,
    /// Application payload bytes sent (before compression)
    pub bytes_sent: u64,
    /// Application payload bytes received (after decompression)
    pub bytes_received: u64,
    /// Data frames sent
    pub frames_sent: u64,
    /// Data frames received
    pub frames_received: u64,
    /// Data frames sent compressed
    pub compressed_frames_sent: u64,
    /// Data frames received compressed
    pub compressed_frames_received: u64,
    /// When the session was established
    pub established_at: Option<Instant>,
    /// Last send or receive
    pub last_activity: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_connecting() {
        let session = Session::new(Role::Opener);
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.role(), Role::Opener);
        assert!(session.failure().is_none());
    }

    #[test]
    fn test_happy_path() {
        let mut session = Session::new(Role::Creator);
        session.transition_to(SessionState::Established).unwrap();
        assert!(session.stats().established_at.is_some());
        session.transition_to(SessionState::Draining).unwrap();
        session.transition_to(SessionState::Closed).unwrap();
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut session = Session::new(Role::Creator);
        assert!(!session.can_transition(SessionState::Draining));
        assert!(matches!(
            session.transition_to(SessionState::Draining),
            Err(Error::InvalidState(_))
        ));

        session.transition_to(SessionState::Established).unwrap();
        assert!(!session.can_transition(SessionState::Connecting));
        session.transition_to(SessionState::Closed).unwrap();
        assert!(!session.can_transition(SessionState::Established));
        assert!(!session.can_transition(SessionState::Error));
    }

    #[test]
    fn test_error_is_absorbing() {
        let mut session = Session::new(Role::Opener);
        session.transition_to(SessionState::Established).unwrap();
        session.fail(ErrorKind::PeerUnresponsive);
        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(session.failure(), Some(ErrorKind::PeerUnresponsive));

        for to in [
            SessionState::Connecting,
            SessionState::Established,
            SessionState::Draining,
            SessionState::Closed,
        ] {
            assert!(!session.can_transition(to));
        }

        session.finish();
        session.fail(ErrorKind::CorruptFrame);
        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(session.failure(), Some(ErrorKind::PeerUnresponsive));
    }

    #[test]
    fn test_stats_accounting() {
        let mut session = Session::new(Role::Creator);
        session.record_sent(100, false);
        session.record_sent(5000, true);
        session.record_received(42, false);

        let stats = session.stats();
        assert_eq!(stats.bytes_sent, 5100);
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.compressed_frames_sent, 1);
        assert_eq!(stats.bytes_received, 42);
        assert_eq!(stats.frames_received, 1);
    }
}
