//! Connections: the async session object over a segment.
//!
//! The `accept` side creates the segment and waits for an opener; the
//! `connect` side opens it, sends `Hello` and waits for `HelloAck`. Once
//! established, `send` and `receive` move frames through the two rings and
//! suspend on the reactor bridge when a ring is full or empty.
//!
//! Ring handles sit behind `parking_lot` mutexes that are only held for the
//! synchronous push or pop, never across an `.await`. A frame is therefore
//! never torn by cancellation or by a dropped future.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use shmem_core::{
    Codec, ConnectionOptions, Encoded, Error, ErrorKind, Frame, FrameFlags, FrameKind, Hello,
    HelloAck, HelloStatus, Result, RingConsumer, RingProducer, Role, Segment, Session,
    SessionState, SessionStats,
};
use tokio::time::Instant;

use crate::bridge::{BridgeConfig, BridgeWaker, LinkStatus, ReactorBridge};

/// First delay between `connect` attempts on a missing segment
const CONNECT_RETRY_MIN: Duration = Duration::from_millis(5);

/// Upper bound for the `connect` retry delay
const CONNECT_RETRY_MAX: Duration = Duration::from_millis(100);

/// Create the segment `name` and wait for one peer to connect.
///
/// Waits until an opener sends its `Hello`; drop the future to stop waiting.
///
/// # Errors
///
/// - [`Error::AlreadyExists`] if a live segment holds the name
/// - [`Error::ProtocolMismatch`] if the peer's parameters are incompatible
/// - [`Error::PeerUnresponsive`] if the peer attached and then died
/// - [`Error::InvalidConfig`] for invalid options
pub async fn accept(name: &str, options: ConnectionOptions) -> Result<Connection> {
    options.validate()?;
    let segment = Segment::create(name, options.layout(), &options.segment_dir())?;
    tracing::debug!("Waiting for a peer on {}", name);

    let mut parts = Parts::new(segment, &options)?;
    match parts.handshake_as_creator(&options).await {
        Ok(agreed) => Ok(Connection::establish(parts, agreed)),
        Err(e) => {
            parts.abandon(&e);
            Err(e)
        }
    }
}

/// Open the segment `name` and perform the handshake.
///
/// A segment that does not exist yet (or still serves a previous client) is
/// retried with backoff until `connect_timeout` expires.
///
/// # Errors
///
/// - [`Error::NotFound`] / [`Error::InUse`] if no free segment appeared in time
/// - [`Error::ProtocolMismatch`] if the creator rejected our parameters
/// - [`Error::Timeout`] if the creator did not answer within `handshake_timeout`
/// - [`Error::InvalidConfig`] for invalid options
pub async fn connect(name: &str, options: ConnectionOptions) -> Result<Connection> {
    options.validate()?;
    let dir = options.segment_dir();
    let deadline = Instant::now() + options.connect_timeout;
    let mut delay = CONNECT_RETRY_MIN;

    let segment = loop {
        match Segment::open(name, &dir) {
            Ok(segment) => break segment,
            Err(e @ (Error::NotFound(_) | Error::InUse(_))) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(e);
                }
                tracing::trace!("Segment {} not available yet: {}", name, e);
                tokio::time::sleep(delay.min(deadline - now)).await;
                delay = (delay * 2).min(CONNECT_RETRY_MAX);
            }
            Err(e) => return Err(e),
        }
    };

    let mut parts = Parts::new(segment, &options)?;
    match parts.handshake_as_opener(&options).await {
        Ok(agreed) => Ok(Connection::establish(parts, agreed)),
        Err(e) => {
            parts.abandon(&e);
            Err(e)
        }
    }
}

/// Session pieces before the handshake completes
struct Parts {
    segment: Segment,
    producer: RingProducer,
    consumer: RingConsumer,
    bridge: ReactorBridge,
    session: Session,
}

impl Parts {
    fn new(mut segment: Segment, options: &ConnectionOptions) -> Result<Self> {
        let role = segment.role();
        let (producer, consumer) = segment.take_rings()?;
        let bridge = ReactorBridge::start(
            segment.heartbeat_handle()?,
            &segment.bell_path(role),
            &segment.bell_path(role.peer()),
            BridgeConfig::from(options),
        );
        Ok(Self {
            segment,
            producer,
            consumer,
            bridge,
            session: Session::new(role),
        })
    }

    async fn handshake_as_creator(&mut self, options: &ConnectionOptions) -> Result<Hello> {
        let frame = self.next_frame(None).await?;
        if frame.kind() != FrameKind::Hello {
            return Err(Error::ProtocolMismatch(format!(
                "expected Hello, got {:?}",
                frame.kind()
            )));
        }

        let local = Hello::from_options(options);
        let verdict = Hello::decode(frame.payload()).and_then(|peer| {
            local.check_compatible(&peer)?;
            Ok(local.negotiate(&peer))
        });
        let ack = match &verdict {
            Ok(agreed) => HelloAck {
                params: *agreed,
                status: HelloStatus::Accepted,
            },
            Err(e) => {
                tracing::warn!("Rejecting peer on {}: {}", self.segment.name(), e);
                HelloAck {
                    params: local,
                    status: HelloStatus::Rejected,
                }
            }
        };
        self.push_control(FrameKind::HelloAck, ack.encode())?;
        verdict
    }

    async fn handshake_as_opener(&mut self, options: &ConnectionOptions) -> Result<Hello> {
        let local = Hello::from_options(options);
        self.push_control(FrameKind::Hello, local.encode())?;

        let deadline = Instant::now() + options.handshake_timeout;
        let frame = self.next_frame(Some(deadline)).await?;
        if frame.kind() != FrameKind::HelloAck {
            return Err(Error::ProtocolMismatch(format!(
                "expected HelloAck, got {:?}",
                frame.kind()
            )));
        }

        let ack = HelloAck::decode(frame.payload())?;
        local.check_compatible(&ack.params)?;
        if ack.status == HelloStatus::Rejected {
            return Err(Error::ProtocolMismatch(
                "handshake rejected by creator".into(),
            ));
        }
        Ok(ack.params)
    }

    fn push_control(&mut self, kind: FrameKind, payload: Vec<u8>) -> Result<()> {
        if !self.producer.push(&Frame::control(kind, payload))? {
            return Err(Error::InvalidState(format!(
                "no room for {kind:?} in a fresh ring"
            )));
        }
        self.bridge.notify_peer();
        Ok(())
    }

    async fn next_frame(&mut self, deadline: Option<Instant>) -> Result<Frame> {
        loop {
            let notified = self.bridge.notified();
            if let Some(frame) = self.consumer.pop()? {
                self.bridge.notify_peer();
                return Ok(frame);
            }
            match self.bridge.status() {
                LinkStatus::Alive => {}
                LinkStatus::PeerClosed => return Err(Error::Closed),
                LinkStatus::PeerUnresponsive => return Err(self.bridge.unresponsive_error()),
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(Error::Timeout(format!(
                            "no handshake reply on {}",
                            self.segment.name()
                        )));
                    }
                }
                None => notified.await,
            }
        }
    }

    fn abandon(mut self, error: &Error) {
        self.session.fail(error.kind());
        self.bridge.shutdown();
        if let Err(e) = release_segment(&mut self.segment, self.bridge.status()) {
            tracing::debug!("Releasing {} after failed handshake: {}", self.segment.name(), e);
        }
        tracing::warn!("Handshake on {} failed: {}", self.segment.name(), error);
    }
}

/// Detach from `segment`.
///
/// The creator owns the name and removes the file on its way out, so the
/// same name can be accepted on again while the opener still drains its
/// mapping. An opener removes it when it is last out or the creator is gone.
fn release_segment(segment: &mut Segment, status: LinkStatus) -> Result<bool> {
    let peer_alive =
        segment.role() == Role::Opener && status != LinkStatus::PeerUnresponsive;
    segment.release(peer_alive)
}

/// Cancels operations currently suspended on a [`Connection`].
///
/// Operations started after `cancel()` are not affected.
#[derive(Debug, Clone)]
pub struct Canceller {
    epoch: Arc<AtomicU64>,
    waker: BridgeWaker,
}

impl Canceller {
    /// Resolve every pending `send`/`receive` with [`Error::Cancelled`]
    pub fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.waker.wake();
    }
}

/// One established shared-memory connection
pub struct Connection {
    name: String,
    role: Role,
    codec: Codec,
    producer: Mutex<Option<RingProducer>>,
    consumer: Mutex<Option<RingConsumer>>,
    session: Mutex<Session>,
    segment: Mutex<Segment>,
    bridge: ReactorBridge,
    cancel_epoch: Arc<AtomicU64>,
    torn_down: AtomicBool,
}

impl Connection {
    fn establish(parts: Parts, agreed: Hello) -> Self {
        let Parts {
            segment,
            producer,
            consumer,
            bridge,
            mut session,
        } = parts;

        // Connecting -> Established is always valid for a fresh session.
        let _ = session.transition_to(SessionState::Established);
        bridge.set_liveness_timeout(agreed.liveness_timeout());

        let codec = agreed.codec();
        tracing::info!(
            "Session on {} established as {} (compression: {}, threshold: {})",
            segment.name(),
            segment.role(),
            codec.is_enabled(),
            codec.threshold()
        );

        Self {
            name: segment.name().to_string(),
            role: segment.role(),
            codec,
            producer: Mutex::new(Some(producer)),
            consumer: Mutex::new(Some(consumer)),
            session: Mutex::new(session),
            segment: Mutex::new(segment),
            bridge,
            cancel_epoch: Arc::new(AtomicU64::new(0)),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Send `payload`, suspending while the outbound ring is full.
    ///
    /// # Errors
    ///
    /// - [`Error::FrameTooLarge`] if `payload` exceeds the maximum frame size
    /// - [`Error::Closed`] once the session is draining or closed
    /// - [`Error::PeerUnresponsive`] if the peer dies while we wait
    /// - [`Error::Cancelled`] if a [`Canceller`] fires while we wait
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.check_sendable(payload.len())?;
        let encoded = self.codec.encode(payload);
        let epoch = self.cancel_epoch.load(Ordering::Acquire);

        loop {
            let notified = self.bridge.notified();
            if self.push_data(payload.len(), &encoded)? {
                return Ok(());
            }
            self.check_sendable(payload.len())?;
            self.check_cancelled(epoch)?;
            notified.await;
        }
    }

    /// Send without suspending. Returns `Ok(false)` if the ring is full.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::send`], minus cancellation.
    pub fn try_send(&self, payload: &[u8]) -> Result<bool> {
        self.check_sendable(payload.len())?;
        let encoded = self.codec.encode(payload);
        self.push_data(payload.len(), &encoded)
    }

    /// Receive the next payload, suspending while the inbound ring is empty.
    ///
    /// Frames already queued when the peer closes are still delivered; after
    /// that `receive` fails with [`Error::Closed`].
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] after the peer closed and its frames were drained
    /// - [`Error::CorruptFrame`] for malformed frames (fatal)
    /// - [`Error::PeerUnresponsive`] if the peer dies while we wait
    /// - [`Error::Cancelled`] if a [`Canceller`] fires while we wait
    pub async fn receive(&self) -> Result<Vec<u8>> {
        let epoch = self.cancel_epoch.load(Ordering::Acquire);

        loop {
            let notified = self.bridge.notified();
            if let Some(payload) = self.try_receive()? {
                return Ok(payload);
            }
            self.check_receivable()?;
            self.check_cancelled(epoch)?;
            notified.await;
        }
    }

    /// Receive without suspending. Returns `Ok(None)` if nothing is queued.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::receive`], minus cancellation and liveness.
    pub fn try_receive(&self) -> Result<Option<Vec<u8>>> {
        match self.state() {
            SessionState::Established | SessionState::Draining => {}
            SessionState::Error => return Err(self.failure_error()),
            SessionState::Connecting | SessionState::Closed => return Err(Error::Closed),
        }

        loop {
            let popped = {
                let mut guard = self.consumer.lock();
                let consumer = guard.as_mut().ok_or(Error::Closed)?;
                consumer.pop()
            };
            let frame = match popped {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.fatal(e)),
            };
            self.bridge.notify_peer();

            match frame.kind() {
                FrameKind::Data => {
                    let compressed = frame.is_compressed();
                    let payload = self
                        .codec
                        .decode(compressed, frame.into_payload())
                        .map_err(|e| self.fatal(e))?;
                    self.session
                        .lock()
                        .record_received(payload.len(), compressed);
                    return Ok(Some(payload));
                }
                FrameKind::Close => {
                    let mut session = self.session.lock();
                    if session.state() == SessionState::Established {
                        let _ = session.transition_to(SessionState::Draining);
                    }
                    tracing::debug!("Peer of {} sent Close", self.name);
                }
                kind => {
                    return Err(self.fatal(Error::CorruptFrame(format!(
                        "unexpected {kind:?} frame on an established session"
                    ))));
                }
            }
        }
    }

    /// [`Connection::receive`] bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if nothing arrived in time, otherwise the
    /// errors of [`Connection::receive`].
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| Error::Timeout(format!("receive on {} after {timeout:?}", self.name)))?
    }

    /// Close the connection.
    ///
    /// An established session enqueues a Close frame (waiting up to the
    /// liveness timeout for ring space), then releases the segment. Frames
    /// already sent stay readable by the peer. Idempotent.
    ///
    /// # Errors
    ///
    /// Currently infallible; teardown problems are logged.
    pub async fn close(&self) -> Result<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Ok(());
        }

        let established = {
            let mut session = self.session.lock();
            session.state() == SessionState::Established
                && session.transition_to(SessionState::Draining).is_ok()
        };
        if established {
            let timeout = self.bridge.liveness_timeout();
            match tokio::time::timeout(timeout, self.send_close_frame()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("Close frame on {} not sent: {}", self.name, e),
                Err(_) => tracing::debug!("Close frame on {} timed out", self.name),
            }
        }

        self.teardown();
        Ok(())
    }

    /// Handle that cancels operations currently suspended on this connection
    #[must_use]
    pub fn canceller(&self) -> Canceller {
        Canceller {
            epoch: self.cancel_epoch.clone(),
            waker: self.bridge.waker(),
        }
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.lock().state()
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.session.lock().stats()
    }

    /// Segment name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This side's role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiated codec
    #[must_use]
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Negotiated maximum payload size
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.codec.max_frame_size()
    }

    /// Current peer status
    #[must_use]
    pub fn link_status(&self) -> LinkStatus {
        self.bridge.status()
    }

    fn push_data(&self, original_len: usize, encoded: &Encoded<'_>) -> Result<bool> {
        let flags = FrameFlags::new(FrameKind::Data).with_compressed(encoded.compressed);
        let pushed = {
            let mut guard = self.producer.lock();
            let producer = guard.as_mut().ok_or(Error::Closed)?;
            producer.push_parts(flags, &encoded.bytes)
        };
        match pushed {
            Ok(true) => {
                self.session
                    .lock()
                    .record_sent(original_len, encoded.compressed);
                self.bridge.notify_peer();
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => Err(self.fatal(e)),
        }
    }

    async fn send_close_frame(&self) -> Result<()> {
        loop {
            let notified = self.bridge.notified();
            let pushed = {
                let mut guard = self.producer.lock();
                let producer = guard.as_mut().ok_or(Error::Closed)?;
                producer.push(&Frame::control(FrameKind::Close, Vec::new()))?
            };
            if pushed {
                self.bridge.notify_peer();
                return Ok(());
            }
            if self.bridge.status() != LinkStatus::Alive {
                return Err(Error::Closed);
            }
            notified.await;
        }
    }

    fn check_sendable(&self, len: usize) -> Result<()> {
        let max = self.codec.max_frame_size();
        if len > max {
            return Err(Error::FrameTooLarge { size: len, max });
        }
        match self.state() {
            SessionState::Established => {}
            SessionState::Error => return Err(self.failure_error()),
            _ => return Err(Error::Closed),
        }
        self.check_link()
    }

    fn check_receivable(&self) -> Result<()> {
        match self.state() {
            SessionState::Established => {}
            SessionState::Error => return Err(self.failure_error()),
            _ => return Err(Error::Closed),
        }
        match self.bridge.status() {
            LinkStatus::PeerClosed => {
                // The peer's closed flag is set after its last push; pick up
                // anything that landed after our previous pop.
                if self.consumer_has_data() {
                    return Ok(());
                }
                let mut session = self.session.lock();
                if session.state() == SessionState::Established {
                    let _ = session.transition_to(SessionState::Draining);
                }
                Err(Error::Closed)
            }
            _ => self.check_link(),
        }
    }

    fn check_link(&self) -> Result<()> {
        match self.bridge.status() {
            LinkStatus::Alive => Ok(()),
            LinkStatus::PeerClosed => Err(Error::Closed),
            LinkStatus::PeerUnresponsive => Err(self.fatal(self.bridge.unresponsive_error())),
        }
    }

    fn check_cancelled(&self, epoch: u64) -> Result<()> {
        if self.cancel_epoch.load(Ordering::Acquire) != epoch {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn consumer_has_data(&self) -> bool {
        self.consumer
            .lock()
            .as_ref()
            .is_some_and(|consumer| !consumer.is_empty())
    }

    /// Record a fatal error on the session and hand it back
    fn fatal(&self, error: Error) -> Error {
        if error.is_fatal() {
            let mut session = self.session.lock();
            if !session.state().is_terminal() {
                tracing::warn!("Session on {} failed: {}", self.name, error);
            }
            session.fail(error.kind());
        }
        error
    }

    /// Error reported by calls made after the session failed
    fn failure_error(&self) -> Error {
        match self.session.lock().failure() {
            Some(ErrorKind::PeerUnresponsive) => self.bridge.unresponsive_error(),
            Some(ErrorKind::CorruptFrame) => {
                Error::CorruptFrame("session failed on an earlier frame".into())
            }
            Some(ErrorKind::ProtocolMismatch) => {
                Error::ProtocolMismatch("session failed during handshake".into())
            }
            other => Error::InvalidState(format!("session failed ({other:?})")),
        }
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let status = self.bridge.status();
        self.producer.lock().take();
        self.consumer.lock().take();
        self.bridge.shutdown();

        let released = release_segment(&mut self.segment.lock(), status);
        self.session.lock().finish();
        match released {
            Ok(destroyed) => tracing::info!(
                "Session on {} closed ({}){}",
                self.name,
                self.role,
                if destroyed { ", segment destroyed" } else { "" }
            ),
            Err(e) => tracing::warn!("Releasing segment {} failed: {}", self.name, e),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.torn_down.load(Ordering::Acquire) {
            return;
        }
        if self.session.get_mut().state() == SessionState::Established {
            if let Some(producer) = self.producer.get_mut().as_mut() {
                if let Ok(true) = producer.push(&Frame::control(FrameKind::Close, Vec::new())) {
                    self.bridge.notify_peer();
                }
            }
        }
        self.teardown();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}
