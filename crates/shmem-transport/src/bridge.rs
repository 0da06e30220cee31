//! Reactor bridge: turns shared-memory readiness into tokio wakeups.
//!
//! One pump task per session waits on this side's doorbell, a fallback poll
//! timer and the heartbeat timer. Every time it wakes it notifies all
//! waiters on a [`Notify`]; waiters re-check their ring, so a missed or
//! unavailable doorbell costs at most one poll interval.
//!
//! The pump also refreshes this side's heartbeat stamp and watches the
//! peer's. Peer status is published on a `watch` channel and is sticky:
//! once the peer is closed or unresponsive it stays that way.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use shmem_core::{ConnectionOptions, Error, HeartbeatHandle, PeerLiveness};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::doorbell::{Doorbell, RemoteDoorbell};

/// Peer status as seen by the pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Peer alive (or not attached yet)
    Alive,
    /// Peer set its closed flag
    PeerClosed,
    /// Peer heartbeat expired or its process is gone
    PeerUnresponsive,
}

/// Timing for the pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// How often to refresh our heartbeat and check the peer's
    pub heartbeat_interval: Duration,
    /// Peer heartbeat age that counts as dead
    pub liveness_timeout: Duration,
    /// Fallback poll period
    pub poll_interval: Duration,
}

impl From<&ConnectionOptions> for BridgeConfig {
    fn from(options: &ConnectionOptions) -> Self {
        Self {
            heartbeat_interval: options.heartbeat_interval,
            liveness_timeout: options.liveness_timeout,
            poll_interval: options.poll_interval,
        }
    }
}

struct Shared {
    readiness: Notify,
    remote: Mutex<RemoteDoorbell>,
    liveness_ms: AtomicU64,
    /// Set once the negotiated timeout is in place
    liveness_armed: AtomicBool,
}

/// Wakes every task suspended on a bridge
#[derive(Clone)]
pub struct BridgeWaker {
    shared: Arc<Shared>,
}

impl BridgeWaker {
    /// Wake all current waiters
    pub fn wake(&self) {
        self.shared.readiness.notify_waiters();
    }
}

impl std::fmt::Debug for BridgeWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeWaker").finish_non_exhaustive()
    }
}

/// Per-session bridge between the segment and the tokio reactor
pub struct ReactorBridge {
    shared: Arc<Shared>,
    status: watch::Receiver<LinkStatus>,
    pump: JoinHandle<()>,
}

impl ReactorBridge {
    /// Start the pump on the current tokio runtime.
    ///
    /// `local_bell` is the FIFO this side listens on, `remote_bell` the one
    /// the peer listens on. If the local FIFO cannot be set up the bridge
    /// runs on the poll timer alone.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(
        heartbeat: HeartbeatHandle,
        local_bell: &Path,
        remote_bell: &Path,
        config: BridgeConfig,
    ) -> Self {
        let bell = match Doorbell::listen(local_bell) {
            Ok(bell) => Some(bell),
            Err(e) => {
                tracing::warn!(
                    "Doorbell {} unavailable, polling every {:?}: {}",
                    local_bell.display(),
                    config.poll_interval,
                    e
                );
                None
            }
        };

        let shared = Arc::new(Shared {
            readiness: Notify::new(),
            remote: Mutex::new(RemoteDoorbell::new(remote_bell)),
            liveness_ms: AtomicU64::new(duration_millis(config.liveness_timeout)),
            liveness_armed: AtomicBool::new(false),
        });
        let (status_tx, status_rx) = watch::channel(LinkStatus::Alive);

        heartbeat.touch();
        let pump = tokio::spawn(run_pump(shared.clone(), bell, heartbeat, status_tx, config));

        Self {
            shared,
            status: status_rx,
            pump,
        }
    }

    /// Future resolved on the next wakeup.
    ///
    /// Create it before re-checking the ring: wakeups are delivered to every
    /// `Notified` that exists at the time, polled or not.
    pub fn notified(&self) -> Notified<'_> {
        self.shared.readiness.notified()
    }

    /// Ring the peer's doorbell
    pub fn notify_peer(&self) {
        self.shared.remote.lock().ring();
    }

    /// Current peer status
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Subscribe to peer status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Handle that wakes all waiters
    #[must_use]
    pub fn waker(&self) -> BridgeWaker {
        BridgeWaker {
            shared: self.shared.clone(),
        }
    }

    /// Replace the liveness timeout (after negotiation).
    ///
    /// Until this is called the pump only reports a peer whose process is
    /// gone or that marked itself closed; heartbeat age is not judged.
    pub fn set_liveness_timeout(&self, timeout: Duration) {
        self.shared
            .liveness_ms
            .store(duration_millis(timeout), Ordering::Relaxed);
        self.shared.liveness_armed.store(true, Ordering::Release);
    }

    /// Current liveness timeout
    #[must_use]
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.shared.liveness_ms.load(Ordering::Relaxed))
    }

    /// Error reported when the peer went silent
    #[must_use]
    pub fn unresponsive_error(&self) -> Error {
        Error::PeerUnresponsive {
            timeout_ms: self.shared.liveness_ms.load(Ordering::Relaxed),
        }
    }

    /// Stop the pump and wake all waiters
    pub fn shutdown(&self) {
        self.pump.abort();
        self.shared.readiness.notify_waiters();
    }
}

impl Drop for ReactorBridge {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for ReactorBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorBridge")
            .field("status", &self.status())
            .field("liveness_timeout", &self.liveness_timeout())
            .finish_non_exhaustive()
    }
}

async fn run_pump(
    shared: Arc<Shared>,
    mut bell: Option<Doorbell>,
    heartbeat: HeartbeatHandle,
    status: watch::Sender<LinkStatus>,
    config: BridgeConfig,
) {
    let mut beat = tokio::time::interval(config.heartbeat_interval);
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let mut bell_failed = false;
        tokio::select! {
            result = wait_bell(bell.as_ref()) => {
                if let Err(e) = result {
                    tracing::warn!("Doorbell wait failed, falling back to polling: {}", e);
                    bell_failed = true;
                }
            }
            () = tokio::time::sleep(config.poll_interval) => {}
            _ = beat.tick() => {
                heartbeat.touch();
                let timeout = if shared.liveness_armed.load(Ordering::Acquire) {
                    Duration::from_millis(shared.liveness_ms.load(Ordering::Relaxed))
                } else {
                    Duration::MAX
                };
                publish(&status, heartbeat.peer_liveness(timeout), heartbeat.role());
            }
        }
        if bell_failed {
            bell = None;
        }
        shared.readiness.notify_waiters();
    }
}

async fn wait_bell(bell: Option<&Doorbell>) -> std::io::Result<()> {
    match bell {
        Some(bell) => bell.wait().await,
        None => std::future::pending().await,
    }
}

fn publish(status: &watch::Sender<LinkStatus>, liveness: PeerLiveness, role: shmem_core::Role) {
    let observed = match liveness {
        PeerLiveness::NotAttached | PeerLiveness::Alive => LinkStatus::Alive,
        PeerLiveness::Closed => LinkStatus::PeerClosed,
        PeerLiveness::Unresponsive => LinkStatus::PeerUnresponsive,
    };
    let changed = status.send_if_modified(|current| {
        if *current == LinkStatus::Alive && observed != LinkStatus::Alive {
            *current = observed;
            true
        } else {
            false
        }
    });
    if changed {
        match observed {
            LinkStatus::PeerUnresponsive => {
                tracing::warn!("Peer of {} stopped responding", role);
            }
            _ => tracing::debug!("Peer of {} closed", role),
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmem_core::{Segment, SegmentLayout};
    use tempfile::TempDir;

    fn config() -> BridgeConfig {
        BridgeConfig {
            heartbeat_interval: Duration::from_millis(10),
            liveness_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_peer_ring_wakes_waiter() {
        let dir = TempDir::new().unwrap();
        let layout = SegmentLayout::new(4096, 1024).unwrap();
        let creator = Segment::create("bridge", layout, dir.path()).unwrap();
        let opener = Segment::open("bridge", dir.path()).unwrap();

        let a = ReactorBridge::start(
            creator.heartbeat_handle().unwrap(),
            &creator.bell_path(creator.role()),
            &creator.bell_path(opener.role()),
            config(),
        );
        let b = ReactorBridge::start(
            opener.heartbeat_handle().unwrap(),
            &opener.bell_path(opener.role()),
            &opener.bell_path(creator.role()),
            config(),
        );

        let notified = a.notified();
        b.notify_peer();
        tokio::time::timeout(Duration::from_millis(200), notified)
            .await
            .expect("bridge never woke");
        assert_eq!(a.status(), LinkStatus::Alive);
        assert_eq!(b.status(), LinkStatus::Alive);
    }

    #[tokio::test]
    async fn test_silent_peer_becomes_unresponsive() {
        let dir = TempDir::new().unwrap();
        let layout = SegmentLayout::new(4096, 1024).unwrap();
        let creator = Segment::create("silent", layout, dir.path()).unwrap();
        let _opener = Segment::open("silent", dir.path()).unwrap();

        let bridge = ReactorBridge::start(
            creator.heartbeat_handle().unwrap(),
            &creator.bell_path(creator.role()),
            &creator.bell_path(creator.role().peer()),
            config(),
        );
        bridge.set_liveness_timeout(Duration::from_millis(100));
        let mut status = bridge.subscribe();
        tokio::time::timeout(
            Duration::from_millis(500),
            status.wait_for(|s| *s == LinkStatus::PeerUnresponsive),
        )
        .await
        .expect("liveness never expired")
        .unwrap();
        assert!(matches!(
            bridge.unresponsive_error(),
            Error::PeerUnresponsive { timeout_ms: 100 }
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_age_ignored_until_timeout_is_set() {
        let dir = TempDir::new().unwrap();
        let layout = SegmentLayout::new(4096, 1024).unwrap();
        let creator = Segment::create("unarmed", layout, dir.path()).unwrap();
        let _opener = Segment::open("unarmed", dir.path()).unwrap();

        // The opener never refreshes its stamp, so it ages past 100ms.
        let bridge = ReactorBridge::start(
            creator.heartbeat_handle().unwrap(),
            &creator.bell_path(creator.role()),
            &creator.bell_path(creator.role().peer()),
            config(),
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(bridge.status(), LinkStatus::Alive);

        bridge.set_liveness_timeout(Duration::from_millis(100));
        let mut status = bridge.subscribe();
        tokio::time::timeout(
            Duration::from_millis(500),
            status.wait_for(|s| *s == LinkStatus::PeerUnresponsive),
        )
        .await
        .expect("liveness never expired once set")
        .unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_is_reported() {
        let dir = TempDir::new().unwrap();
        let layout = SegmentLayout::new(4096, 1024).unwrap();
        let creator = Segment::create("closing", layout, dir.path()).unwrap();
        let opener = Segment::open("closing", dir.path()).unwrap();

        let bridge = ReactorBridge::start(
            creator.heartbeat_handle().unwrap(),
            &creator.bell_path(creator.role()),
            &creator.bell_path(creator.role().peer()),
            config(),
        );
        opener.mark_closed();

        let mut status = bridge.subscribe();
        tokio::time::timeout(
            Duration::from_millis(500),
            status.wait_for(|s| *s == LinkStatus::PeerClosed),
        )
        .await
        .expect("close never observed")
        .unwrap();
    }

    #[tokio::test]
    async fn test_poll_only_without_doorbell() {
        let dir = TempDir::new().unwrap();
        let layout = SegmentLayout::new(4096, 1024).unwrap();
        let creator = Segment::create("poll", layout, dir.path()).unwrap();

        let bridge = ReactorBridge::start(
            creator.heartbeat_handle().unwrap(),
            &dir.path().join("missing-dir").join("bell"),
            &dir.path().join("missing-dir").join("peer-bell"),
            config(),
        );
        // the poll timer alone still produces wakeups
        tokio::time::timeout(Duration::from_millis(200), bridge.notified())
            .await
            .expect("poll fallback never fired");
        bridge.notify_peer();
    }
}
