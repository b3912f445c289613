// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Segment buffer pool — a fixed array of 64 MiB segments in one
//! contiguous region, with a free list and an LRU standby cache of decoded
//! read-only segments.
//!
//! ## Region layout
//!
//! ```text
//! [0 .. N * SEGMENT_SIZE)                      payload, slot i at i * SEGMENT_SIZE
//! [N * SEGMENT_SIZE .. + N * sizeof(control)]  control elements, slot i adjacent
//! ```
//!
//! The control elements are visible to the writing client and therefore
//! untrusted: every submit validates a keyed murmur3 cookie before the
//! server acts on the element. Server-side bookkeeping (flags, owner,
//! private control copy) lives outside the region.
//!
//! Lock order: a slot lock may be taken before the free-list or standby
//! lock, never the other way around, with one exception: eviction takes the
//! standby lock first and then locks the victim slot. That cannot deadlock
//! because a slot on the standby list is not legally lockable through any
//! other path (freeing or submitting a standby slot is rejected).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Result, SimutraceError};
use crate::hashing::murmur3_32;
use crate::storage::stream::Stream;
use crate::types::{
    now_timestamp, BufferId, SegmentControlElement, SegmentId, StorageLocation, StoreId,
    StoreStreamSegmentLink, StreamAccessFlags, StreamId, StreamSegmentId, StreamSegmentLink,
    INVALID_CYCLE_COUNT, INVALID_STREAM_ID, INVALID_STREAM_SEGMENT_ID,
    INVALID_TIME_STAMP, SEGMENT_SIZE, SERVER_BUFFER_ID,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct SegmentFlags: u32 {
        /// Slot is allocated (owned or cached); clear means free.
        const IN_USE = 1 << 0;
        /// Slot holds decoded data and must not be written to.
        const READ_ONLY = 1 << 1;
        /// Slot is not associated with a stream; never cached.
        const SCRATCH = 1 << 2;
        /// Slot may enter the standby cache when freed.
        const CACHEABLE = 1 << 3;
        /// Slot enters the cache at the LRU tail (scan / random probe).
        const LOW_PRIORITY = 1 << 4;
        /// Slot gets one guaranteed MRU placement before ageing out.
        const PREFETCH = 1 << 5;
    }
}

/// Owner metadata kept privately so a stale client cannot redirect a
/// submitted segment.
struct SlotOwner {
    stream: Weak<Stream>,
    store: StoreId,
    stream_id: StreamId,
    sequence_number: StreamSegmentId,
}

struct SlotState {
    flags: SegmentFlags,
    is_submitted: bool,
    owner: Option<SlotOwner>,
    /// Trusted copy of the control element; authoritative once the slot is
    /// submitted or read-only.
    control: SegmentControlElement,
}

struct Standby {
    /// MRU at the front, LRU eviction victim at the back.
    list: VecDeque<SegmentId>,
    index: HashMap<StoreStreamSegmentLink, SegmentId>,
}

struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
    control_offset: usize,
}

// One writer per segment and the control elements are only raced by design
// (untrusted client memory); the region itself is plain bytes.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Outcome of submitting a slot to the pool.
pub enum SubmitOutcome {
    /// `raw_entry_count == 0`; the slot was silently dropped.
    Dropped,
    /// Read-only slot released back to the pool (possibly cached).
    Freed,
    /// The encoder completed synchronously. `None` means it intentionally
    /// produced no storage location.
    Completed(Option<StorageLocation>),
    /// The encoder owns the slot and completes through the stream later.
    Pending,
}

/// A slot handed out for reading.
pub enum ReadSlot {
    /// Exact standby-cache hit; data and control element are valid.
    CacheHit(SegmentId),
    /// Freshly allocated; the caller must run the decoder.
    Fresh(SegmentId),
}

impl ReadSlot {
    pub fn id(&self) -> SegmentId {
        match self {
            ReadSlot::CacheHit(id) | ReadSlot::Fresh(id) => *id,
        }
    }
}

pub struct BufferPool {
    id: BufferId,
    num_segments: u32,
    cookie_secret: u64,
    cache_enabled: bool,
    retry_count: u32,
    retry_sleep: Duration,

    region: Region,
    slots: Box<[Mutex<SlotState>]>,
    free: Mutex<Vec<SegmentId>>,
    standby: Mutex<Standby>,

    allocation_retries: AtomicU64,
}

impl BufferPool {
    pub fn new(
        id: BufferId,
        num_segments: u32,
        cache_enabled: bool,
        retry_count: u32,
        retry_sleep: Duration,
    ) -> Result<Arc<Self>> {
        if num_segments == 0 {
            return Err(SimutraceError::Argument(
                "num_segments".into(),
                "a buffer pool needs at least one segment".into(),
            ));
        }

        let control_offset = num_segments as usize * SEGMENT_SIZE;
        let total = control_offset
            + num_segments as usize * std::mem::size_of::<SegmentControlElement>();
        let layout = Layout::from_size_align(total, 4096)
            .map_err(|e| SimutraceError::Config(format!("buffer region layout: {e}")))?;

        // Zeroed pages; untouched segments stay uncommitted on most systems.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            SimutraceError::Config(format!(
                "cannot allocate {} MiB buffer region",
                total / 1_048_576
            ))
        })?;

        let slots = (0..num_segments)
            .map(|_| {
                Mutex::new(SlotState {
                    flags: SegmentFlags::empty(),
                    is_submitted: false,
                    owner: None,
                    control: SegmentControlElement::zeroed(),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        // LIFO free list: freshly released slots are reused first, keeping
        // the working set small under low load.
        let free = (0..num_segments).rev().collect::<Vec<_>>();

        debug!(
            buffer = %buffer_id_string(id),
            segments = num_segments,
            region_mib = total / 1_048_576,
            cache = cache_enabled,
            "Stream buffer pool created"
        );

        Ok(Arc::new(BufferPool {
            id,
            num_segments,
            cookie_secret: fastrand::u64(..),
            cache_enabled,
            retry_count,
            retry_sleep,
            region: Region { ptr, layout, control_offset },
            slots,
            free: Mutex::new(free),
            standby: Mutex::new(Standby { list: VecDeque::new(), index: HashMap::new() }),
            allocation_retries: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    pub fn segment_size(&self) -> usize {
        SEGMENT_SIZE
    }

    /// Total allocation retries taken under pool pressure.
    pub fn allocation_retries(&self) -> u64 {
        self.allocation_retries.load(Ordering::Relaxed)
    }

    // ───────────────────────── region access ────────────────────────────

    pub fn segment(&self, id: SegmentId) -> &[u8] {
        assert!(id < self.num_segments);
        unsafe {
            std::slice::from_raw_parts(
                self.region.ptr.as_ptr().add(id as usize * SEGMENT_SIZE),
                SEGMENT_SIZE,
            )
        }
    }

    /// Mutable view of a segment's payload. The segment state machine
    /// guarantees a single writer per slot; concurrent calls for the same
    /// id are a caller bug.
    #[allow(clippy::mut_from_ref)]
    pub fn segment_mut(&self, id: SegmentId) -> &mut [u8] {
        assert!(id < self.num_segments);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.region.ptr.as_ptr().add(id as usize * SEGMENT_SIZE),
                SEGMENT_SIZE,
            )
        }
    }

    /// Raw payload base of a segment; used by composite encoders that
    /// carve disjoint sub-segments out of one slot from multiple threads.
    pub(crate) fn segment_ptr(&self, id: SegmentId) -> *mut u8 {
        assert!(id < self.num_segments);
        unsafe { self.region.ptr.as_ptr().add(id as usize * SEGMENT_SIZE) }
    }

    fn raw_control_ptr(&self, id: SegmentId) -> *mut SegmentControlElement {
        assert!(id < self.num_segments);
        unsafe {
            self.region
                .ptr
                .as_ptr()
                .add(self.region.control_offset)
                .cast::<SegmentControlElement>()
                .add(id as usize)
        }
    }

    /// Copy of the client-visible control element.
    pub fn control(&self, id: SegmentId) -> SegmentControlElement {
        unsafe { *self.raw_control_ptr(id) }
    }

    /// Mutates the client-visible control element. Valid for slots in the
    /// writing state; the server ignores raw edits once a slot is
    /// submitted.
    pub fn update_control<R>(&self, id: SegmentId, f: impl FnOnce(&mut SegmentControlElement) -> R) -> R {
        unsafe { f(&mut *self.raw_control_ptr(id)) }
    }

    /// Server view of the control element: the private trusted copy once
    /// the slot is submitted or read-only, the raw element otherwise.
    pub fn control_snapshot(&self, id: SegmentId) -> SegmentControlElement {
        let slot = self.slots[id as usize].lock();
        if slot.is_submitted || slot.flags.contains(SegmentFlags::READ_ONLY) {
            slot.control
        } else {
            self.control(id)
        }
    }

    // ───────────────────────── cookies ──────────────────────────────────

    fn compute_cookie(
        &self,
        control: &SegmentControlElement,
        slot_id: SegmentId,
        read_only: bool,
    ) -> u64 {
        let mut mix = self.cookie_secret;
        mix ^= ((slot_id as u64) << 32) | slot_id as u64;
        mix ^= (control.link.stream as u64) << 32;
        mix ^= control.link.sequence_number as u64;
        mix ^= control.start_time;

        let low = murmur3_32(&mix.to_le_bytes(), 0);
        let mut cookie = (mix & 0xFFFF_FFFF_0000_0000) | low as u64;

        if read_only {
            // Read-only elements must not be modified at all; fold the
            // whole element (minus the cookie itself) into the hash.
            let body = control.body_bytes();
            let h = murmur3_32(&body, cookie as u32);
            cookie = (cookie & 0xFFFF_FFFF_0000_0000) | h as u64;
        }

        cookie
    }

    fn test_cookie(
        &self,
        control: &SegmentControlElement,
        slot_id: SegmentId,
        read_only: bool,
    ) -> bool {
        control.cookie == self.compute_cookie(control, slot_id, read_only)
    }

    // ───────────────────────── allocation ───────────────────────────────

    fn prepare_segment(&self, id: SegmentId, owner: Option<(&Arc<Stream>, StreamSegmentId)>) {
        let mut slot = self.slots[id as usize].lock();
        debug_assert!(slot.flags.contains(SegmentFlags::IN_USE));
        debug_assert!(!slot.flags.contains(SegmentFlags::READ_ONLY));
        debug_assert!(!slot.is_submitted);

        let mut control = SegmentControlElement::zeroed();
        control.link = match owner {
            Some((stream, sqn)) => StreamSegmentLink::new(stream.id(), sqn),
            None => StreamSegmentLink::new(INVALID_STREAM_ID, INVALID_STREAM_SEGMENT_ID),
        };
        control.start_cycle = INVALID_CYCLE_COUNT;
        control.end_cycle = INVALID_CYCLE_COUNT;
        control.start_time = now_timestamp();
        control.end_time = INVALID_TIME_STAMP;
        control.cookie = self.compute_cookie(&control, id, false);

        unsafe { *self.raw_control_ptr(id) = control };
        slot.control = control;

        slot.owner = owner.map(|(stream, sqn)| SlotOwner {
            stream: Arc::downgrade(stream),
            store: stream.store_id(),
            stream_id: stream.id(),
            sequence_number: sqn,
        });
    }

    fn dequeue_free(&self) -> Option<SegmentId> {
        let id = self.free.lock().pop()?;
        let mut slot = self.slots[id as usize].lock();
        debug_assert!(slot.flags.is_empty());
        slot.flags = SegmentFlags::IN_USE;
        slot.is_submitted = false;
        Some(id)
    }

    fn enqueue_free(&self, id: SegmentId, slot: &mut SlotState) {
        slot.owner = None;
        slot.flags = SegmentFlags::empty();
        slot.is_submitted = false;
        self.free.lock().push(id);
    }

    /// Allocates a slot, evicting from the standby cache when the free list
    /// is exhausted, with configured backoff. Callers with a fallback
    /// (prefetch, scratch) skip the backoff and fail fast.
    fn try_allocate(&self, no_retry: bool) -> Option<SegmentId> {
        let mut try_count = 1u32;
        loop {
            if let Some(id) = self.dequeue_free() {
                trace!(buffer = %buffer_id_string(self.id), slot = id, try_count, "Allocated segment");
                return Some(id);
            }
            if let Some(id) = self.evict_standby() {
                trace!(buffer = %buffer_id_string(self.id), slot = id, try_count, "Reclaimed standby segment");
                return Some(id);
            }

            if no_retry || try_count >= self.retry_count {
                return None;
            }

            warn!(
                buffer = %buffer_id_string(self.id),
                try_count,
                "Delaying segment request, stream buffer exhausted"
            );
            self.allocation_retries.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(self.retry_sleep);
            try_count += 1;
        }
    }

    /// Returns a writable slot for `(stream, sqn)` or `None` when the pool
    /// stays exhausted through all retries.
    pub fn request_segment(&self, stream: &Arc<Stream>, sqn: StreamSegmentId) -> Option<SegmentId> {
        debug_assert!(sqn != INVALID_STREAM_SEGMENT_ID);
        let id = self.try_allocate(false)?;
        self.prepare_segment(id, Some((stream, sqn)));

        if self.cache_enabled {
            // Freshly written segments are cache candidates, but writers
            // work sequentially: they enter at the LRU tail.
            let mut slot = self.slots[id as usize].lock();
            slot.flags.insert(SegmentFlags::CACHEABLE | SegmentFlags::LOW_PRIORITY);
        }
        Some(id)
    }

    /// Returns a slot that is not associated with any stream. Scratch
    /// slots are never cached and must be purged by the caller; users have
    /// a private-memory fallback, so exhaustion fails fast.
    pub fn request_scratch_segment(&self) -> Option<SegmentId> {
        let id = self.try_allocate(true)?;
        self.prepare_segment(id, None);
        self.slots[id as usize].lock().flags.insert(SegmentFlags::SCRATCH);
        Some(id)
    }

    /// Acquire a slot for reading `location`. Checks the standby cache for
    /// an exact hit first; otherwise prepares a fresh slot with the control
    /// element initialised from the location. The caller runs the decoder
    /// for `Fresh` slots.
    pub fn acquire_for_read(
        &self,
        stream: &Arc<Stream>,
        flags: StreamAccessFlags,
        location: &StorageLocation,
        prefetch: bool,
    ) -> Option<ReadSlot> {
        let link = StoreStreamSegmentLink::new(stream.store_id(), location.link);
        if let Some(id) = self.remove_standby(&link) {
            trace!(
                buffer = %buffer_id_string(self.id),
                slot = id,
                stream = location.link.stream,
                sqn = location.link.sequence_number,
                "Standby cache hit"
            );
            return Some(ReadSlot::CacheHit(id));
        }

        let id = self.try_allocate(prefetch)?;
        self.prepare_segment(id, Some((stream, location.link.sequence_number)));

        let mut slot = self.slots[id as usize].lock();
        slot.flags.insert(SegmentFlags::READ_ONLY);
        if self.cache_enabled {
            slot.flags.insert(SegmentFlags::CACHEABLE);
            // Scans and random probes must not displace the whole cache;
            // their slots age out from the LRU tail.
            if flags.intersects(StreamAccessFlags::RANDOM_ACCESS | StreamAccessFlags::SEQUENTIAL_SCAN)
            {
                slot.flags.insert(SegmentFlags::LOW_PRIORITY);
            }
        }

        let mut control = SegmentControlElement::zeroed();
        control.link = location.link;
        control.start_cycle = location.ranges.start_cycle();
        control.end_cycle = location.ranges.end_cycle();
        control.start_time = location.ranges.start_time();
        control.end_time = location.ranges.end_time();
        control.start_index = location.ranges.start_index();
        if location.ranges.start_index() != crate::types::INVALID_ENTRY_INDEX {
            control.entry_count = location.entry_count();
        }
        control.raw_entry_count = location.raw_entry_count;
        control.cookie = self.compute_cookie(&control, id, true);

        unsafe { *self.raw_control_ptr(id) = control };
        slot.control = control;

        trace!(
            buffer = %buffer_id_string(self.id),
            slot = id,
            stream = location.link.stream,
            sqn = location.link.sequence_number,
            prefetch,
            "Loading segment"
        );

        Some(ReadSlot::Fresh(id))
    }

    // ───────────────────────── submit ───────────────────────────────────

    /// Validates and hands a slot to the stream's encoder. Read-only slots
    /// are released; writable slots have their control element fixed up and
    /// are encoded, either synchronously or through the worker pool.
    pub fn submit_segment(&self, id: SegmentId) -> Result<SubmitOutcome> {
        if id >= self.num_segments {
            return Err(SimutraceError::OutOfBounds("segment".into()));
        }

        let mut slot = self.slots[id as usize].lock();
        if !slot.flags.contains(SegmentFlags::IN_USE)
            || slot.flags.contains(SegmentFlags::SCRATCH)
            || slot.is_submitted
        {
            return Err(SimutraceError::InvalidOperation(format!(
                "segment {id} of buffer {} cannot be submitted in its current state",
                buffer_id_string(self.id)
            )));
        }
        let owner = slot.owner.as_ref().ok_or_else(|| {
            SimutraceError::InvalidOperation(format!("segment {id} has no owning stream"))
        })?;
        let (owner_stream, owner_id, owner_sqn) =
            (owner.stream.clone(), owner.stream_id, owner.sequence_number);

        let read_only = slot.flags.contains(SegmentFlags::READ_ONLY);
        if !read_only {
            // Snapshot the client-visible element so the client cannot
            // change it under us, then pin the link to the recorded owner.
            let mut control = self.control(id);
            let cookie_ok = self.test_cookie(&control, id, false);
            control.link = StreamSegmentLink::new(owner_id, owner_sqn);
            slot.control = control;

            if !cookie_ok {
                return Err(SimutraceError::Corruption(format!(
                    "failed submitting segment {id} to buffer {}: invalid control cookie",
                    buffer_id_string(self.id)
                )));
            }
        } else if !self.test_cookie(&self.control(id), id, true) {
            return Err(SimutraceError::Corruption(format!(
                "failed submitting read-only segment {id} to buffer {}: control element modified",
                buffer_id_string(self.id)
            )));
        }

        trace!(
            buffer = %buffer_id_string(self.id),
            slot = id,
            stream = slot.control.link.stream,
            sqn = slot.control.link.sequence_number,
            raw = slot.control.raw_entry_count,
            entries = slot.control.entry_count,
            "Submitting segment"
        );

        slot.is_submitted = true;

        if slot.control.raw_entry_count == 0 {
            warn!(
                buffer = %buffer_id_string(self.id),
                slot = id,
                stream = slot.control.link.stream,
                sqn = slot.control.link.sequence_number,
                "Dropping empty segment; did you forget to submit the entries?"
            );
            self.purge_locked(id, &mut slot);
            return Ok(SubmitOutcome::Dropped);
        }

        if read_only {
            self.free_locked(id, &mut slot, false);
            return Ok(SubmitOutcome::Freed);
        }

        let stream = owner_stream.upgrade().ok_or_else(|| {
            SimutraceError::InvalidOperation(format!("stream {owner_id} is gone"))
        })?;

        match self.finish_writable_control(id, &mut slot, &stream) {
            Ok(()) => {}
            Err(e) => {
                slot.is_submitted = false;
                return Err(e);
            }
        }

        // The encoder may complete synchronously with a storage location,
        // or keep the slot and complete through the stream later. Release
        // the slot lock first: asynchronous completions re-enter the pool.
        drop(slot);

        match stream.encoder().write(self, id) {
            Ok((true, location)) => {
                let mut slot = self.slots[id as usize].lock();
                if location.is_some() {
                    self.free_locked(id, &mut slot, false);
                } else {
                    self.purge_locked(id, &mut slot);
                }
                Ok(SubmitOutcome::Completed(location))
            }
            Ok((false, _)) => Ok(SubmitOutcome::Pending),
            Err(e) => {
                let mut slot = self.slots[id as usize].lock();
                slot.is_submitted = false;
                drop(slot);
                warn!(
                    buffer = %buffer_id_string(self.id),
                    slot = id,
                    stream = owner_id,
                    sqn = owner_sqn,
                    error = %e,
                    "Failed to encode segment"
                );
                Err(e)
            }
        }
    }

    /// Entry-count fix-up and temporal-order validation for a freshly
    /// submitted writable segment.
    fn finish_writable_control(
        &self,
        id: SegmentId,
        slot: &mut SlotState,
        stream: &Arc<Stream>,
    ) -> Result<()> {
        let desc = &stream.descriptor().type_desc;
        let variable = crate::types::is_variable_entry_size(desc.entry_size);

        if !variable {
            slot.control.entry_count = slot.control.raw_entry_count;
        }

        let valid_len =
            crate::types::effective_entry_size(desc.entry_size) * slot.control.raw_entry_count as usize;

        if valid_len > SEGMENT_SIZE
            || (!variable && slot.control.entry_count != slot.control.raw_entry_count)
            || slot.control.entry_count > slot.control.raw_entry_count
        {
            return Err(SimutraceError::Corruption(format!(
                "invalid number of entries in control element for stream {} <sqn: {}, slot: {id}>",
                slot.control.link.stream, slot.control.link.sequence_number
            )));
        }

        slot.control.end_time = now_timestamp();

        if desc.temporal_order() {
            // Cycle counts sit in the low 48 bits of the first quad word of
            // the first and last valid entry; that requires fixed-size
            // entries with at least the metadata word.
            let entry_size = crate::types::effective_entry_size(desc.entry_size);
            if variable || entry_size < 8 {
                return Err(SimutraceError::Corruption(format!(
                    "temporally ordered stream {} has no cycle field in its entries",
                    slot.control.link.stream
                )));
            }
            let payload = self.segment(id);

            let first = u64::from_le_bytes(payload[0..8].try_into().unwrap_or_default());
            let last_off = valid_len - entry_size;
            let last =
                u64::from_le_bytes(payload[last_off..last_off + 8].try_into().unwrap_or_default());

            slot.control.start_cycle = first & crate::types::TEMPORAL_ORDER_CYCLE_COUNT_MASK;
            slot.control.end_cycle = last & crate::types::TEMPORAL_ORDER_CYCLE_COUNT_MASK;

            if slot.control.start_cycle == INVALID_CYCLE_COUNT
                || slot.control.end_cycle == INVALID_CYCLE_COUNT
                || slot.control.start_cycle > slot.control.end_cycle
            {
                return Err(SimutraceError::Corruption(format!(
                    "invalid cycle information in temporally ordered stream {} for segment {id} <sqn: {}>",
                    slot.control.link.stream, slot.control.link.sequence_number
                )));
            }
        } else {
            slot.control.start_cycle = INVALID_CYCLE_COUNT;
            slot.control.end_cycle = INVALID_CYCLE_COUNT;
        }

        slot.control.cookie = self.compute_cookie(&slot.control, id, false);
        Ok(())
    }

    // ───────────────────────── release ──────────────────────────────────

    /// Releases a slot, promoting it to the standby cache when eligible.
    pub fn free_segment(&self, id: SegmentId, prefetch: bool) -> Result<()> {
        if id >= self.num_segments {
            return Err(SimutraceError::OutOfBounds("segment".into()));
        }
        let mut slot = self.slots[id as usize].lock();

        // Freeing free or standby slots is forbidden, as is freeing a
        // writable slot that was never submitted (its control element is
        // not trustworthy yet).
        if !slot.flags.contains(SegmentFlags::IN_USE)
            || self.is_on_standby(id, &slot)
            || (!slot.flags.contains(SegmentFlags::READ_ONLY) && !slot.is_submitted)
        {
            return Err(SimutraceError::InvalidOperation(format!(
                "segment {id} of buffer {} cannot be freed in its current state",
                buffer_id_string(self.id)
            )));
        }

        self.free_locked(id, &mut slot, prefetch);
        Ok(())
    }

    /// Unconditionally returns a slot to the free list.
    pub fn purge_segment(&self, id: SegmentId) -> Result<()> {
        if id >= self.num_segments {
            return Err(SimutraceError::OutOfBounds("segment".into()));
        }
        let mut slot = self.slots[id as usize].lock();
        if !slot.flags.contains(SegmentFlags::IN_USE) || self.is_on_standby(id, &slot) {
            return Err(SimutraceError::InvalidOperation(format!(
                "segment {id} of buffer {} cannot be purged in its current state",
                buffer_id_string(self.id)
            )));
        }

        self.purge_locked(id, &mut slot);
        Ok(())
    }

    fn is_on_standby(&self, id: SegmentId, slot: &SlotState) -> bool {
        if !slot.flags.contains(SegmentFlags::CACHEABLE) {
            return false;
        }
        match &slot.owner {
            Some(owner) => {
                let link = StoreStreamSegmentLink {
                    store: owner.store,
                    stream: owner.stream_id,
                    sequence_number: slot.control.link.sequence_number,
                };
                self.standby.lock().index.get(&link) == Some(&id)
            }
            None => false,
        }
    }

    fn free_locked(&self, id: SegmentId, slot: &mut SlotState, prefetch: bool) {
        // The control element is authoritative from here on.
        slot.is_submitted = true;

        if slot.flags.contains(SegmentFlags::CACHEABLE) && self.cache_enabled {
            if prefetch {
                // Guarantees one MRU placement so the segment survives
                // until the reader that asked for it arrives.
                slot.flags.insert(SegmentFlags::PREFETCH);
            }

            if !slot.flags.contains(SegmentFlags::READ_ONLY) {
                // Only read-only segments live in the cache; rehash with
                // the read-only rule and republish the element.
                slot.flags.insert(SegmentFlags::READ_ONLY);
                slot.control.cookie = self.compute_cookie(&slot.control, id, true);
                unsafe { *self.raw_control_ptr(id) = slot.control };
            }

            self.add_standby(id, slot);
        } else {
            self.purge_locked(id, slot);
        }
    }

    fn purge_locked(&self, id: SegmentId, slot: &mut SlotState) {
        if let Some(owner) = &slot.owner {
            if let Some(stream) = owner.stream.upgrade() {
                stream
                    .encoder()
                    .notify_segment_cache_closed(owner.sequence_number);
            }
        }
        self.enqueue_free(id, slot);
    }

    // ───────────────────────── standby cache ────────────────────────────

    fn standby_link(slot: &SlotState) -> Option<StoreStreamSegmentLink> {
        let owner = slot.owner.as_ref()?;
        Some(StoreStreamSegmentLink {
            store: owner.store,
            stream: owner.stream_id,
            sequence_number: slot.control.link.sequence_number,
        })
    }

    fn add_standby(&self, id: SegmentId, slot: &mut SlotState) {
        let link = match Self::standby_link(slot) {
            Some(link) => link,
            None => {
                self.purge_locked(id, slot);
                return;
            }
        };

        let mut standby = self.standby.lock();
        if standby.index.contains_key(&link) {
            // The same segment was decoded twice concurrently; keep a
            // single cached copy.
            drop(standby);
            self.purge_locked(id, slot);
            return;
        }

        standby.index.insert(link, id);
        if !slot.flags.contains(SegmentFlags::LOW_PRIORITY)
            || slot.flags.contains(SegmentFlags::PREFETCH)
        {
            standby.list.push_front(id);
            slot.flags.remove(SegmentFlags::PREFETCH);
        } else {
            standby.list.push_back(id);
        }
    }

    fn remove_standby(&self, link: &StoreStreamSegmentLink) -> Option<SegmentId> {
        let mut standby = self.standby.lock();
        let id = standby.index.remove(link)?;
        if let Some(pos) = standby.list.iter().position(|&s| s == id) {
            standby.list.remove(pos);
        }
        drop(standby);

        let mut slot = self.slots[id as usize].lock();
        slot.is_submitted = false;
        debug_assert!(slot.flags.contains(SegmentFlags::READ_ONLY));
        Some(id)
    }

    fn evict_standby(&self) -> Option<SegmentId> {
        let mut standby = self.standby.lock();
        let id = *standby.list.back()?;

        let mut slot = self.slots[id as usize].lock();
        if let Some(owner) = &slot.owner {
            if let Some(stream) = owner.stream.upgrade() {
                stream
                    .encoder()
                    .notify_segment_cache_closed(owner.sequence_number);
            }
        }

        if let Some(link) = Self::standby_link(&slot) {
            standby.index.remove(&link);
        }
        standby.list.pop_back();
        drop(standby);

        slot.flags = SegmentFlags::IN_USE;
        slot.is_submitted = false;
        Some(id)
    }

    /// Purges every standby slot belonging to `store`, or all of them.
    pub fn flush_standby(&self, store: Option<StoreId>) {
        loop {
            let victim = {
                let standby = self.standby.lock();
                standby.list.iter().copied().find(|&id| {
                    let slot = self.slots[id as usize].lock();
                    match (&store, &slot.owner) {
                        (None, _) => true,
                        (Some(s), Some(owner)) => owner.store == *s,
                        (Some(_), None) => true,
                    }
                })
            };

            let Some(id) = victim else { break };

            let mut standby = self.standby.lock();
            let mut slot = self.slots[id as usize].lock();
            if let Some(link) = Self::standby_link(&slot) {
                if standby.index.remove(&link).is_none() {
                    continue; // raced with a concurrent removal
                }
            }
            if let Some(pos) = standby.list.iter().position(|&s| s == id) {
                standby.list.remove(pos);
            }
            drop(standby);

            trace!(
                buffer = %buffer_id_string(self.id),
                slot = id,
                "Flushing cached segment"
            );
            self.purge_locked(id, &mut slot);
        }
    }

    /// Number of segments currently held by the standby cache.
    pub fn standby_len(&self) -> usize {
        self.standby.lock().list.len()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.flush_standby(None);
    }
}

pub(crate) fn buffer_id_string(id: BufferId) -> String {
    if id == SERVER_BUFFER_ID {
        "'server'".to_string()
    } else {
        id.to_string()
    }
}
