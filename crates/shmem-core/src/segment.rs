//! Named shared-memory segments.
//!
//! A segment is a file under the segment directory (`/dev/shm/shmem-connect`
//! on Linux) mapped into both processes with `memmap2`. The creator makes the
//! file with exclusive-create semantics, sizes it, writes the header and
//! publishes `ready`. An opener maps it, validates the header and claims the
//! single opener slot.
//!
//! Teardown is cooperative: each side calls [`Segment::release`], and the
//! last one out (or an opener that found the creator gone) removes the file.
//! Removal is guarded by a CAS on `destroy_claimed`, so it happens at most
//! once no matter how the two processes interleave.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};

use crate::clock::{current_pid, monotonic_millis, process_alive};
use crate::error::{Error, Result};
use crate::layout::{RING_DATA_OFFSET, Role, SegmentHeader, SegmentLayout};
use crate::ring::{self, RingConsumer, RingProducer};
use crate::{PROTOCOL_VERSION, SEGMENT_MAGIC};

/// Directory name used under `/dev/shm` or the temp dir
pub const SEGMENT_DIR_NAME: &str = "shmem-connect";

/// Half-initialised segments younger than this are never treated as stale
const STALE_GRACE: Duration = Duration::from_secs(1);

/// Default segment directory for this platform
#[must_use]
pub fn default_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if cfg!(target_os = "linux") && shm.is_dir() {
        shm.join(SEGMENT_DIR_NAME)
    } else {
        std::env::temp_dir().join(SEGMENT_DIR_NAME)
    }
}

/// File-system safe form of a segment name
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    name.replace(['/', ':', '\\'], "_")
}

/// Path of the backing file for `name` in `dir`
#[must_use]
pub fn segment_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(sanitize_name(name))
}

/// Path of the doorbell `role` listens on, next to the segment file
#[must_use]
pub fn bell_path(segment: &Path, role: Role) -> PathBuf {
    let mut os = segment.as_os_str().to_owned();
    os.push(format!(".bell.{}", role.tag()));
    PathBuf::from(os)
}

/// A live mapping of a segment file.
///
/// Rings and heartbeat handles hold an `Arc<Mapping>`, so the memory stays
/// mapped until the last of them is dropped.
pub(crate) struct Mapping {
    _mmap: MmapMut,
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; all concurrent access goes
// through atomics in the header and the SPSC ring discipline.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(file: &File, len: usize) -> Result<Self> {
        // SAFETY: the file is owned by this crate's protocol; concurrent
        // modification by the peer is expected and mediated by atomics.
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| Error::Io(io::Error::other("mmap returned a null pointer")))?;
        Ok(Self {
            _mmap: mmap,
            base,
            len,
        })
    }

    pub(crate) fn header(&self) -> &SegmentHeader {
        // SAFETY: every mapping is at least RING_DATA_OFFSET bytes, page
        // aligned, and the header consists of integers and atomics.
        unsafe { &*self.base.as_ptr().cast::<SegmentHeader>() }
    }

    pub(crate) fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.len);
        // SAFETY: callers stay within the mapped length.
        unsafe { self.base.as_ptr().add(offset) }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

/// Peer liveness as observed through the segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLiveness {
    /// The peer has not attached yet
    NotAttached,
    /// The peer refreshed its heartbeat recently
    Alive,
    /// The peer marked itself closed
    Closed,
    /// The peer's heartbeat is older than the liveness timeout, or its process is gone
    Unresponsive,
}

/// Heartbeat access for the liveness pump
#[derive(Clone)]
pub struct HeartbeatHandle {
    mapping: Arc<Mapping>,
    role: Role,
}

impl HeartbeatHandle {
    /// Refresh this side's heartbeat stamp
    pub fn touch(&self) {
        self.mapping.header().heartbeat[self.role.index()]
            .store(monotonic_millis(), Ordering::Release);
    }

    /// Evaluate the peer against `timeout`
    #[must_use]
    pub fn peer_liveness(&self, timeout: Duration) -> PeerLiveness {
        let header = self.mapping.header();
        let peer = self.role.peer();
        if header.closed[peer.index()].load(Ordering::Acquire) != 0 {
            return PeerLiveness::Closed;
        }
        let stamp = header.heartbeat[peer.index()].load(Ordering::Acquire);
        if stamp == 0 {
            return PeerLiveness::NotAttached;
        }

        let pid = match peer {
            Role::Creator => header.creator_pid,
            Role::Opener => header.opener_pid.load(Ordering::Acquire),
        };
        if pid != 0 && !process_alive(pid) {
            return PeerLiveness::Unresponsive;
        }

        let age = monotonic_millis().saturating_sub(stamp);
        if u128::from(age) > timeout.as_millis() {
            PeerLiveness::Unresponsive
        } else {
            PeerLiveness::Alive
        }
    }

    /// Whether the peer set its closed flag
    #[must_use]
    pub fn peer_closed(&self) -> bool {
        self.mapping.header().closed[self.role.peer().index()].load(Ordering::Acquire) != 0
    }

    /// Role this handle stamps for
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }
}

impl std::fmt::Debug for HeartbeatHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatHandle")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Read-only snapshot of a segment header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Segment name
    pub name: String,
    /// Backing file
    pub path: PathBuf,
    /// Header layout version
    pub version: u32,
    /// Geometry
    pub layout: SegmentLayout,
    /// Creator pid
    pub creator_pid: u32,
    /// Whether the creator process still exists
    pub creator_alive: bool,
    /// Opener pid, 0 if unclaimed
    pub opener_pid: u32,
    /// Attached process count
    pub attached: u32,
    /// Whether the creator published the header
    pub ready: bool,
    /// Whether teardown has been claimed
    pub destroy_claimed: bool,
    /// Per-role closed flags (creator, opener)
    pub closed: [bool; 2],
    /// Milliseconds since each side's last heartbeat (creator, opener)
    pub heartbeat_age_ms: [Option<u64>; 2],
    /// Bytes queued in each ring (creator -> opener, opener -> creator)
    pub queued_bytes: [u64; 2],
    /// Frames queued in each ring
    pub queued_frames: [u64; 2],
}

/// A mapped shared-memory segment
pub struct Segment {
    name: String,
    path: PathBuf,
    role: Role,
    layout: SegmentLayout,
    mapping: Option<Arc<Mapping>>,
    rings_taken: bool,
}

impl Segment {
    /// Create a new segment named `name` in `dir`.
    ///
    /// A stale segment of the same name (foreign header, claimed for
    /// destruction, or creator process gone) is removed and creation retried
    /// once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] if a live segment holds the name,
    /// [`Error::InvalidConfig`] for a bad layout, or [`Error::Io`].
    pub fn create(name: &str, layout: SegmentLayout, dir: &Path) -> Result<Self> {
        layout.validate()?;
        fs::create_dir_all(dir)?;
        let path = segment_path(dir, name);

        match Self::create_at(name, &path, layout) {
            Err(Error::AlreadyExists(_)) if is_stale(&path) => {
                tracing::warn!("Removing stale segment {}", path.display());
                remove_segment_files(&path);
                Self::create_at(name, &path, layout)
            }
            other => other,
        }
    }

    fn create_at(name: &str, path: &Path, layout: SegmentLayout) -> Result<Self> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let init = || -> Result<Arc<Mapping>> {
            file.set_len(layout.total_size() as u64)?;
            let mapping = Mapping::map(&file, layout.total_size())?;

            let raw = mapping.base.as_ptr().cast::<SegmentHeader>();
            // SAFETY: the file was just created by us and is zero-filled; no
            // other process reads these fields before `ready` is published.
            unsafe {
                (&raw mut (*raw).magic).write(SEGMENT_MAGIC);
                (&raw mut (*raw).version).write(PROTOCOL_VERSION);
                (&raw mut (*raw).capacity).write(layout.capacity as u64);
                (&raw mut (*raw).max_frame_size).write(layout.max_frame_size as u32);
                (&raw mut (*raw).creator_pid).write(current_pid());
            }

            let header = mapping.header();
            header.attached.store(1, Ordering::Relaxed);
            header.heartbeat[Role::Creator.index()].store(monotonic_millis(), Ordering::Relaxed);
            header.ready.store(1, Ordering::Release);
            Ok(Arc::new(mapping))
        };

        let mapping = match init() {
            Ok(mapping) => mapping,
            Err(e) => {
                let _ = fs::remove_file(path);
                return Err(e);
            }
        };

        tracing::debug!(
            "Created segment {} ({} bytes, capacity {})",
            path.display(),
            layout.total_size(),
            layout.capacity
        );

        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            role: Role::Creator,
            layout,
            mapping: Some(mapping),
            rings_taken: false,
        })
    }

    /// Open the segment named `name` in `dir` and claim the opener slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the segment does not exist, is not
    /// ready yet or is being torn down; [`Error::ProtocolMismatch`] if the
    /// header disagrees with this build; [`Error::InUse`] if another opener
    /// is attached.
    pub fn open(name: &str, dir: &Path) -> Result<Self> {
        let path = segment_path(dir, name);
        let (mapping, layout) = map_existing(name, &path)?;
        let header = mapping.header();

        if header.destroy_claimed.load(Ordering::Acquire) != 0 {
            return Err(Error::NotFound(format!("{name} (being destroyed)")));
        }
        if !process_alive(header.creator_pid) {
            return Err(Error::NotFound(format!("{name} (creator exited)")));
        }

        header
            .opener_pid
            .compare_exchange(0, current_pid(), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|pid| Error::InUse(format!("{name} (opener pid {pid})")))?;
        header.heartbeat[Role::Opener.index()].store(monotonic_millis(), Ordering::Release);
        header.attached.fetch_add(1, Ordering::AcqRel);

        tracing::debug!("Opened segment {}", path.display());

        Ok(Self {
            name: name.to_string(),
            path,
            role: Role::Opener,
            layout,
            mapping: Some(Arc::new(mapping)),
            rings_taken: false,
        })
    }

    /// Snapshot the header of segment `name` without attaching.
    ///
    /// # Errors
    ///
    /// Same as [`Segment::open`], minus [`Error::InUse`].
    pub fn inspect(name: &str, dir: &Path) -> Result<SegmentInfo> {
        let path = segment_path(dir, name);
        let (mapping, layout) = map_existing(name, &path)?;
        let mapping = Arc::new(mapping);
        let header = mapping.header();
        let now = monotonic_millis();

        let age = |role: Role| match header.heartbeat[role.index()].load(Ordering::Acquire) {
            0 => None,
            stamp => Some(now.saturating_sub(stamp)),
        };
        let queued = |ring: usize| ring::occupancy(&mapping, &layout, ring);
        let (bytes0, frames0) = queued(0);
        let (bytes1, frames1) = queued(1);

        Ok(SegmentInfo {
            name: name.to_string(),
            path,
            version: header.version,
            layout,
            creator_pid: header.creator_pid,
            creator_alive: process_alive(header.creator_pid),
            opener_pid: header.opener_pid.load(Ordering::Acquire),
            attached: header.attached.load(Ordering::Acquire),
            ready: header.ready.load(Ordering::Acquire) != 0,
            destroy_claimed: header.destroy_claimed.load(Ordering::Acquire) != 0,
            closed: [
                header.closed[0].load(Ordering::Acquire) != 0,
                header.closed[1].load(Ordering::Acquire) != 0,
            ],
            heartbeat_age_ms: [age(Role::Creator), age(Role::Opener)],
            queued_bytes: [bytes0, bytes1],
            queued_frames: [frames0, frames1],
        })
    }

    /// Split off this side's producer and consumer. Callable once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the rings were already taken or the
    /// segment is unmapped.
    pub fn take_rings(&mut self) -> Result<(RingProducer, RingConsumer)> {
        if self.rings_taken {
            return Err(Error::InvalidState("rings already taken".into()));
        }
        let mapping = self.mapping()?.clone();
        let producer = RingProducer::new(mapping.clone(), self.layout, self.role.outbound_ring());
        let consumer = RingConsumer::new(mapping, self.layout, self.role.inbound_ring());
        self.rings_taken = true;
        Ok((producer, consumer))
    }

    /// Heartbeat handle for this side
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the segment is unmapped.
    pub fn heartbeat_handle(&self) -> Result<HeartbeatHandle> {
        Ok(HeartbeatHandle {
            mapping: self.mapping()?.clone(),
            role: self.role,
        })
    }

    /// Set this side's closed flag
    pub fn mark_closed(&self) {
        if let Some(mapping) = &self.mapping {
            mapping.header().closed[self.role.index()].store(1, Ordering::Release);
        }
    }

    /// Remove the backing file, at most once across both processes.
    ///
    /// Returns `true` if this call performed the removal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file exists but cannot be removed.
    pub fn destroy(&self) -> Result<bool> {
        let Some(mapping) = &self.mapping else {
            return Ok(false);
        };
        if mapping
            .header()
            .destroy_claimed
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        for role in [Role::Creator, Role::Opener] {
            let _ = fs::remove_file(bell_path(&self.path, role));
        }
        tracing::info!("Destroyed segment {}", self.name);
        Ok(true)
    }

    /// Detach from the segment and unmap it.
    ///
    /// The last side to release destroys the segment. So does a side whose
    /// peer is known to be dead. Returns `true` if this call destroyed it.
    ///
    /// # Errors
    ///
    /// Propagates [`Segment::destroy`] failures; the mapping is dropped
    /// regardless.
    pub fn release(&mut self, peer_alive: bool) -> Result<bool> {
        let Some(mapping) = &self.mapping else {
            return Ok(false);
        };
        let header = mapping.header();
        header.closed[self.role.index()].store(1, Ordering::Release);
        let previous = header
            .attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);

        let result = if previous <= 1 || !peer_alive {
            self.destroy()
        } else {
            Ok(false)
        };
        self.unmap();
        result
    }

    /// Drop this handle's mapping. Idempotent.
    pub fn unmap(&mut self) {
        self.mapping = None;
    }

    /// Whether the segment is still mapped by this handle
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Segment name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Doorbell path `role` listens on
    #[must_use]
    pub fn bell_path(&self, role: Role) -> PathBuf {
        bell_path(&self.path, role)
    }

    /// This side's role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Geometry
    #[must_use]
    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    fn mapping(&self) -> Result<&Arc<Mapping>> {
        self.mapping.as_ref().ok_or(Error::Closed)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.mapping.is_some() {
            if let Err(e) = self.release(true) {
                tracing::debug!("Releasing segment {} on drop failed: {}", self.name, e);
            }
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("role", &self.role)
            .field("layout", &self.layout)
            .field("mapped", &self.mapping.is_some())
            .finish()
    }
}

fn map_existing(name: &str, path: &Path) -> Result<(Mapping, SegmentLayout)> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::NotFound(name.to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    let len = usize::try_from(file.metadata()?.len())
        .map_err(|_| Error::mismatch("segment file too large"))?;
    if len < RING_DATA_OFFSET {
        return Err(Error::NotFound(format!("{name} (not initialised)")));
    }

    let mapping = Mapping::map(&file, len)?;
    let header = mapping.header();
    if header.ready.load(Ordering::Acquire) == 0 {
        return Err(Error::NotFound(format!("{name} (not ready)")));
    }
    if header.magic != SEGMENT_MAGIC {
        return Err(Error::mismatch(format!("{name}: bad segment magic")));
    }
    if header.version != PROTOCOL_VERSION {
        return Err(Error::mismatch(format!(
            "{name}: segment version {} != {PROTOCOL_VERSION}",
            header.version
        )));
    }

    let layout = SegmentLayout {
        capacity: usize::try_from(header.capacity)
            .map_err(|_| Error::mismatch("capacity out of range"))?,
        max_frame_size: header.max_frame_size as usize,
    };
    layout
        .validate()
        .map_err(|e| Error::mismatch(format!("{name}: {e}")))?;
    if layout.total_size() != len {
        return Err(Error::mismatch(format!(
            "{name}: file is {len} bytes, header describes {}",
            layout.total_size()
        )));
    }

    Ok((mapping, layout))
}

fn is_stale(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let Ok(meta) = file.metadata() else {
        return false;
    };
    let old_enough = meta
        .modified()
        .ok()
        .and_then(|m| m.elapsed().ok())
        .is_some_and(|age| age >= STALE_GRACE);

    if (meta.len() as usize) < RING_DATA_OFFSET {
        return old_enough;
    }

    // SAFETY: read-only view; we only load integers and atomics.
    let Ok(mmap) = (unsafe { MmapOptions::new().len(RING_DATA_OFFSET).map(&file) }) else {
        return false;
    };
    // SAFETY: the mapping covers the header and is page aligned.
    let header = unsafe { &*mmap.as_ptr().cast::<SegmentHeader>() };

    if header.ready.load(Ordering::Acquire) == 0 || header.magic != SEGMENT_MAGIC {
        return old_enough;
    }
    header.destroy_claimed.load(Ordering::Acquire) != 0 || !process_alive(header.creator_pid)
}

fn remove_segment_files(path: &Path) {
    let _ = fs::remove_file(path);
    for role in [Role::Creator, Role::Opener] {
        let _ = fs::remove_file(bell_path(path, role));
    }
}
