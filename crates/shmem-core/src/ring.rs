//! Single-producer/single-consumer ring buffers over the segment.
//!
//! Each direction has one [`RingProducer`] and one [`RingConsumer`], living
//! in different processes. `head` and `tail` are byte counters that only
//! ever grow; the ring position is the counter masked by the capacity.
//!
//! Publication order for a record:
//! 1. flags and payload bytes are written (payload may wrap),
//! 2. the length word is stored with release ordering,
//! 3. `pushed` and then `head` are advanced with release ordering.
//!
//! The consumer acquires `head` before touching the record, so a frame is
//! either fully visible or not visible at all. Records are padded to eight
//! bytes, so a record header never straddles the end of the ring.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::frame::{Frame, FrameFlags, FrameHeader};
use crate::layout::{RingHeader, SegmentLayout};
use crate::segment::Mapping;
use crate::{RECORD_HEADER_SIZE, record_size};

/// Shared view of one ring inside a mapping
struct RingView {
    mapping: Arc<Mapping>,
    header_offset: usize,
    data_offset: usize,
    capacity: u64,
    max_frame_size: usize,
}

impl RingView {
    fn new(mapping: Arc<Mapping>, layout: SegmentLayout, ring: usize) -> Self {
        debug_assert!(layout.ring_data_offset(ring) + layout.capacity <= mapping.len());
        Self {
            header_offset: layout.ring_header_offset(ring),
            data_offset: layout.ring_data_offset(ring),
            capacity: layout.capacity as u64,
            max_frame_size: layout.max_frame_size,
            mapping,
        }
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: the offset lies inside the mapping, is 64-byte aligned, and
        // RingHeader holds only atomics.
        unsafe { &*self.mapping.ptr_at(self.header_offset).cast::<RingHeader>() }
    }

    fn data(&self) -> *mut u8 {
        self.mapping.ptr_at(self.data_offset)
    }

    fn mask(&self) -> u64 {
        self.capacity - 1
    }

    fn used(&self, head: u64, tail: u64) -> Result<u64> {
        let used = head.wrapping_sub(tail);
        if used > self.capacity {
            return Err(Error::corrupt(format!(
                "ring desync: head {head} tail {tail} capacity {}",
                self.capacity
            )));
        }
        Ok(used)
    }

    /// The 4-byte length word of the record at `pos`
    fn length_word(&self, pos: u64) -> &AtomicU32 {
        let offset = (pos & self.mask()) as usize;
        // SAFETY: record positions are 8-byte aligned and a header never
        // crosses the end of the ring.
        unsafe { &*self.data().add(offset).cast::<AtomicU32>() }
    }

    /// Copy `src` into the ring starting at logical position `pos`.
    ///
    /// # Safety
    ///
    /// The caller must own `[pos, pos + src.len())` as free space.
    unsafe fn write_wrapped(&self, pos: u64, src: &[u8]) {
        let cap = self.capacity as usize;
        let start = (pos & self.mask()) as usize;
        let first = src.len().min(cap - start);
        let data = self.data();
        // SAFETY: both chunks lie inside the ring data region.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), data.add(start), first);
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), data, src.len() - first);
        }
    }

    /// Copy out of the ring starting at logical position `pos`.
    ///
    /// # Safety
    ///
    /// `[pos, pos + dst.len())` must be published and not yet consumed.
    unsafe fn read_wrapped(&self, pos: u64, dst: &mut [u8]) {
        let cap = self.capacity as usize;
        let start = (pos & self.mask()) as usize;
        let first = dst.len().min(cap - start);
        let data = self.data();
        // SAFETY: both chunks lie inside the ring data region.
        unsafe {
            std::ptr::copy_nonoverlapping(data.add(start), dst.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(data, dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }
}

/// Write half of a ring
pub struct RingProducer {
    ring: RingView,
}

impl RingProducer {
    pub(crate) fn new(mapping: Arc<Mapping>, layout: SegmentLayout, ring: usize) -> Self {
        Self {
            ring: RingView::new(mapping, layout, ring),
        }
    }

    /// Push a frame.
    ///
    /// Returns `Ok(false)` without blocking when the ring lacks space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`] for payloads above the maximum frame
    /// size and [`Error::CorruptFrame`] if the shared indices are inconsistent.
    pub fn push(&mut self, frame: &Frame) -> Result<bool> {
        self.push_parts(frame.flags(), frame.payload())
    }

    /// Push a record built from a flags byte and payload.
    ///
    /// # Errors
    ///
    /// See [`RingProducer::push`].
    pub fn push_parts(&mut self, flags: FrameFlags, payload: &[u8]) -> Result<bool> {
        if payload.len() > self.ring.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: payload.len(),
                max: self.ring.max_frame_size,
            });
        }
        let needed = record_size(payload.len()) as u64;
        let header = self.ring.header();
        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        let used = self.ring.used(head, tail)?;
        if self.ring.capacity - used < needed {
            return Ok(false);
        }

        let slot = (head & self.ring.mask()) as usize;
        // SAFETY: `needed` bytes starting at `head` are free and only this
        // producer writes them; the header slot does not wrap.
        unsafe {
            let base = self.ring.data().add(slot);
            base.add(4).write(flags.as_u8());
            std::ptr::write_bytes(base.add(5), 0, 3);
            self.ring
                .write_wrapped(head + RECORD_HEADER_SIZE as u64, payload);
        }
        self.ring
            .length_word(head)
            .store((payload.len() as u32).to_le(), Ordering::Release);

        let pushed = header.pushed.load(Ordering::Relaxed);
        header.pushed.store(pushed + 1, Ordering::Release);
        header.head.store(head + needed, Ordering::Release);
        Ok(true)
    }

    /// Bytes currently free
    #[must_use]
    pub fn free_space(&self) -> usize {
        let header = self.ring.header();
        let used = header
            .head
            .load(Ordering::Relaxed)
            .saturating_sub(header.tail.load(Ordering::Acquire));
        self.ring.capacity.saturating_sub(used) as usize
    }

    /// Whether a payload of `len` bytes would fit right now
    #[must_use]
    pub fn fits(&self, len: usize) -> bool {
        record_size(len) <= self.free_space()
    }

    /// Ring capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity as usize
    }

    /// Check the shared indices from the producer's side.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptFrame`] on a producer/consumer desync.
    pub fn validate(&self) -> Result<()> {
        let header = self.ring.header();
        let head = header.head.load(Ordering::Relaxed);
        let pushed = header.pushed.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        let popped = header.popped.load(Ordering::Acquire);
        self.ring.used(head, tail)?;
        if popped > pushed || (head == tail && popped != pushed) {
            return Err(Error::corrupt(format!(
                "ring desync: pushed {pushed} popped {popped} head {head} tail {tail}"
            )));
        }
        Ok(())
    }
}

/// Read half of a ring
pub struct RingConsumer {
    ring: RingView,
}

impl RingConsumer {
    pub(crate) fn new(mapping: Arc<Mapping>, layout: SegmentLayout, ring: usize) -> Self {
        Self {
            ring: RingView::new(mapping, layout, ring),
        }
    }

    /// Pop the next complete frame, or `None` if the ring is empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptFrame`] for a malformed record or inconsistent
    /// shared indices. Corruption is not recoverable.
    pub fn pop(&mut self) -> Result<Option<Frame>> {
        let header = self.ring.header();
        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        let used = self.ring.used(head, tail)?;
        if used == 0 {
            return Ok(None);
        }

        let popped = header.popped.load(Ordering::Relaxed);
        let pushed = header.pushed.load(Ordering::Acquire);
        if pushed <= popped {
            return Err(Error::corrupt(format!(
                "ring desync: {used} bytes pending but pushed {pushed} popped {popped}"
            )));
        }

        let length = u32::from_le(self.ring.length_word(tail).load(Ordering::Acquire));
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        // SAFETY: the record header at `tail` is published (head acquired)
        // and does not wrap.
        unsafe {
            let base = self.ring.data().add((tail & self.ring.mask()) as usize);
            std::ptr::copy_nonoverlapping(base.add(4), raw.as_mut_ptr().add(4), 4);
        }
        raw[0..4].copy_from_slice(&length.to_le_bytes());
        let record = FrameHeader::decode(&raw, self.ring.max_frame_size)?;

        let needed = record_size(record.length as usize) as u64;
        if needed > used {
            return Err(Error::corrupt(format!(
                "record of {needed} bytes overruns {used} published bytes"
            )));
        }

        let mut payload = vec![0u8; record.length as usize];
        // SAFETY: the payload lies within the published, unconsumed range.
        unsafe {
            self.ring
                .read_wrapped(tail + RECORD_HEADER_SIZE as u64, &mut payload);
        }
        let frame = Frame::from_parts(record.flags, payload)?;

        header.popped.store(popped + 1, Ordering::Release);
        header.tail.store(tail + needed, Ordering::Release);
        Ok(Some(frame))
    }

    /// Bytes waiting to be consumed
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        let header = self.ring.header();
        header
            .head
            .load(Ordering::Acquire)
            .saturating_sub(header.tail.load(Ordering::Relaxed)) as usize
    }

    /// Whether nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len_bytes() == 0
    }

    /// Frames waiting to be consumed
    #[must_use]
    pub fn pending_frames(&self) -> u64 {
        let header = self.ring.header();
        header
            .pushed
            .load(Ordering::Acquire)
            .saturating_sub(header.popped.load(Ordering::Relaxed))
    }

    /// Check the shared indices from the consumer's side.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptFrame`] on a producer/consumer desync.
    pub fn validate(&self) -> Result<()> {
        let header = self.ring.header();
        let tail = header.tail.load(Ordering::Relaxed);
        let popped = header.popped.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        let pushed = header.pushed.load(Ordering::Acquire);
        self.ring.used(head, tail)?;
        if popped > pushed || (head != tail && pushed == popped) {
            return Err(Error::corrupt(format!(
                "ring desync: pushed {pushed} popped {popped} head {head} tail {tail}"
            )));
        }
        Ok(())
    }
}

/// Queued bytes and frames of ring `ring`, for inspection
pub(crate) fn occupancy(mapping: &Arc<Mapping>, layout: &SegmentLayout, ring: usize) -> (u64, u64) {
    let view = RingView::new(mapping.clone(), *layout, ring);
    let header = view.header();
    let bytes = header
        .head
        .load(Ordering::Acquire)
        .saturating_sub(header.tail.load(Ordering::Acquire));
    let frames = header
        .pushed
        .load(Ordering::Acquire)
        .saturating_sub(header.popped.load(Ordering::Acquire));
    (bytes, frames)
}
