// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Server-side stream: the per-stream segment directory and the
//! append/open/close operations on top of the buffer pool.
//!
//! Every segment of a stream is tracked by a `SegmentRecord` in a dense
//! vector indexed by sequence number. A record moves through the states of
//! the segment lifecycle: writing (buffer id assigned, no storage
//! location), encoding (side id assigned), persisted (location only),
//! loading (location + side id), mapped (location + buffer id, references
//! held).
//!
//! Lock order: `append_lock` before `state`. `open_lock` serialises opens
//! (and thereby all 0→1 reference transitions) without blocking readers of
//! the directory.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::error::{Result, SimutraceError};
use crate::simtrace::encoder::StreamEncoder;
use crate::storage::buffer::{BufferPool, ReadSlot, SubmitOutcome};
use crate::storage::index::RangeTree;
use crate::storage::store::Store;
use crate::types::{
    QueryIndexType, SegmentId, SessionId, StorageLocation, StoreId, StreamAccessFlags,
    StreamDescriptor, StreamId, StreamQueryInformation, StreamSegmentId, StreamSegmentLink,
    StreamStatistics, INVALID_ENTRY_INDEX, INVALID_LARGE_OBJECT_ID, INVALID_SEGMENT_ID,
    INVALID_STREAM_SEGMENT_ID, QUERY_TREE_COUNT, SERVER_SESSION_ID,
};
use crate::worker::StreamWait;

struct SegmentRecord {
    sequence_number: StreamSegmentId,
    location: Option<StorageLocation>,

    /// Active buffer slot (mapped or writing).
    id: SegmentId,
    /// Slot used by an operation in flight (encode or load).
    side_id: SegmentId,

    cancel: bool,
    prefetched: bool,

    reference_count: u32,
    reference_map: HashMap<SessionId, u32>,
    wait_list: Vec<Arc<StreamWait>>,
}

impl SegmentRecord {
    fn new_writable(sequence_number: StreamSegmentId, session: SessionId, buffer: SegmentId) -> Self {
        let mut reference_map = HashMap::new();
        reference_map.insert(session, 1);
        SegmentRecord {
            sequence_number,
            location: None,
            id: buffer,
            side_id: INVALID_SEGMENT_ID,
            cancel: false,
            prefetched: false,
            reference_count: 1,
            reference_map,
            wait_list: Vec::new(),
        }
    }

    fn new_persisted(sequence_number: StreamSegmentId, location: StorageLocation) -> Self {
        SegmentRecord {
            sequence_number,
            location: Some(location),
            id: INVALID_SEGMENT_ID,
            side_id: INVALID_SEGMENT_ID,
            cancel: false,
            prefetched: false,
            reference_count: 0,
            reference_map: HashMap::new(),
            wait_list: Vec::new(),
        }
    }
}

struct DirectoryState {
    segments: Vec<Option<SegmentRecord>>,
    /// Sequence numbers of segments currently holding references or with
    /// operations in flight.
    open_list: Vec<StreamSegmentId>,
    trees: [RangeTree; QUERY_TREE_COUNT],
    stats: StreamStatistics,
    last_sequence_number: StreamSegmentId,
}

struct AppendState {
    last_append_sequence_number: StreamSegmentId,
    last_append_index: u64,
}

/// Incoming storage location of a completion.
enum LocationArg {
    /// No location: a failed operation, a dropped segment or a read-only
    /// close.
    None,
    /// The location already installed on the record (load paths).
    Existing,
    /// A freshly produced location (successful encode).
    New(StorageLocation),
}

/// Placeholder used only in the window between stream construction and
/// encoder installation; no operation can reach it.
struct UninitEncoder;

impl StreamEncoder for UninitEncoder {
    fn read(
        &self,
        _pool: &BufferPool,
        _segment: SegmentId,
        _flags: StreamAccessFlags,
        _location: &StorageLocation,
        _prefetch: bool,
    ) -> Result<bool> {
        Err(SimutraceError::InvalidOperation("stream encoder not installed".into()))
    }

    fn write(&self, _pool: &BufferPool, _segment: SegmentId) -> Result<(bool, Option<StorageLocation>)> {
        Err(SimutraceError::InvalidOperation("stream encoder not installed".into()))
    }

    fn encode_frame(
        &self,
        _segment: SegmentId,
        _sqn: StreamSegmentId,
    ) -> Result<crate::simtrace::frame::Frame> {
        Err(SimutraceError::InvalidOperation("stream encoder not installed".into()))
    }

    fn decode_segment(
        &self,
        _location: &StorageLocation,
        _segment: SegmentId,
        _sqn: StreamSegmentId,
    ) -> Result<()> {
        Err(SimutraceError::InvalidOperation("stream encoder not installed".into()))
    }

    fn friendly_name(&self) -> &str {
        "uninitialised"
    }
}

static UNINIT_ENCODER: UninitEncoder = UninitEncoder;

pub struct Stream {
    id: StreamId,
    store_id: StoreId,
    store: Weak<Store>,
    descriptor: StreamDescriptor,
    buffer: Arc<BufferPool>,
    encoder: std::sync::OnceLock<Box<dyn StreamEncoder>>,
    read_ahead: u32,

    append_lock: Mutex<AppendState>,
    open_lock: Mutex<()>,
    state: RwLock<DirectoryState>,
}

impl Stream {
    pub(crate) fn new(
        store: &Arc<Store>,
        id: StreamId,
        descriptor: StreamDescriptor,
        buffer: Arc<BufferPool>,
        read_ahead: u32,
    ) -> Arc<Stream> {
        Arc::new(Stream {
            id,
            store_id: store.id(),
            store: Arc::downgrade(store),
            descriptor,
            buffer,
            encoder: std::sync::OnceLock::new(),
            read_ahead,
            append_lock: Mutex::new(AppendState {
                last_append_sequence_number: INVALID_STREAM_SEGMENT_ID,
                last_append_index: 0,
            }),
            open_lock: Mutex::new(()),
            state: RwLock::new(DirectoryState {
                segments: Vec::new(),
                open_list: Vec::new(),
                trees: [RangeTree::new(), RangeTree::new(), RangeTree::new()],
                stats: StreamStatistics::default(),
                last_sequence_number: INVALID_STREAM_SEGMENT_ID,
            }),
        })
    }

    pub(crate) fn install_encoder(&self, encoder: Box<dyn StreamEncoder>) {
        let _ = self.encoder.set(encoder);
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn store(&self) -> Result<Arc<Store>> {
        self.store
            .upgrade()
            .ok_or_else(|| SimutraceError::InvalidOperation("store is shutting down".into()))
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn buffer(&self) -> &Arc<BufferPool> {
        &self.buffer
    }

    pub fn encoder(&self) -> &dyn StreamEncoder {
        match self.encoder.get() {
            Some(encoder) => encoder.as_ref(),
            None => &UNINIT_ENCODER,
        }
    }

    pub fn link(&self, sequence_number: StreamSegmentId) -> StreamSegmentLink {
        StreamSegmentLink::new(self.id, sequence_number)
    }

    // ───────────────────────── directory helpers ────────────────────────

    fn segment_is_allocated(state: &DirectoryState, sqn: StreamSegmentId) -> bool {
        (sqn as usize) < state.segments.len() && state.segments[sqn as usize].is_some()
    }

    fn add_record(state: &mut DirectoryState, record: SegmentRecord) {
        let sqn = record.sequence_number as usize;
        debug_assert!(sqn >= state.segments.len() || state.segments[sqn].is_none());

        // Ensure there is a slot for the sequence number; this may add
        // holes when empty segments were dropped earlier.
        while state.segments.len() <= sqn {
            state.segments.push(None);
        }

        let referenced = record.reference_count > 0;
        let sequence_number = record.sequence_number;
        state.segments[sqn] = Some(record);

        if referenced {
            state.open_list.push(sequence_number);
        }

        if state.last_sequence_number == INVALID_STREAM_SEGMENT_ID
            || sequence_number > state.last_sequence_number
        {
            state.last_sequence_number = sequence_number;
        }
    }

    fn previous_segment(state: &DirectoryState, sqn: StreamSegmentId) -> Option<StreamSegmentId> {
        if state.last_sequence_number == INVALID_STREAM_SEGMENT_ID {
            return None;
        }
        let mut sqn = sqn.min(state.last_sequence_number) as usize;
        loop {
            if sqn == 0 {
                return None;
            }
            sqn -= 1;
            if state.segments.get(sqn).map(Option::is_some) == Some(true) {
                return Some(sqn as StreamSegmentId);
            }
        }
    }

    fn next_segment(state: &DirectoryState, sqn: StreamSegmentId) -> Option<StreamSegmentId> {
        let mut sqn = sqn as usize;
        loop {
            sqn += 1;
            if sqn >= state.segments.len() {
                return None;
            }
            if state.segments[sqn].is_some() {
                return Some(sqn as StreamSegmentId);
            }
        }
    }

    /// Validates the location's ranges against the neighbouring segments
    /// and installs it: directory, index trees, statistics.
    fn install_location(
        &self,
        state: &mut DirectoryState,
        sqn: StreamSegmentId,
        mut location: StorageLocation,
    ) -> Result<()> {
        let prev = Self::previous_segment(state, sqn)
            .and_then(|p| state.segments[p as usize].as_ref())
            .and_then(|r| r.location.clone());
        let next = Self::next_segment(state, sqn)
            .and_then(|n| state.segments[n as usize].as_ref())
            .and_then(|r| r.location.clone());

        for i in 0..QUERY_TREE_COUNT {
            let range = location.ranges.ranges[i];
            let prev_range = prev.as_ref().map(|l| l.ranges.ranges[i]);
            let next_range = next.as_ref().map(|l| l.ranges.ranges[i]);

            if range.is_valid() {
                // A single index value may not span segments: point ranges
                // must not be touched by their neighbours. Wider ranges may
                // share a boundary value (adjacent segments of a
                // cycle-ordered stream can meet in the same cycle).
                let prev_conflict = prev_range
                    .is_some_and(|p| p.is_valid() && p.start == p.end && range.start <= p.end);
                let next_conflict = next_range
                    .is_some_and(|n| n.is_valid() && n.start == n.end && range.end >= n.start);
                if range.start > range.end || prev_conflict || next_conflict {
                    return Err(SimutraceError::Corruption(format!(
                        "the range for index {i} of stream {} violates monotonicity <sqn: {sqn}>",
                        self.id
                    )));
                }
            } else {
                // Normalise half-valid ranges so we never keep one.
                location.ranges.ranges[i] = crate::types::Range::INVALID;

                let prev_conflict = prev_range.is_some_and(|p| p.start != INVALID_LARGE_OBJECT_ID);
                let next_conflict = next_range.is_some_and(|n| n.start != INVALID_LARGE_OBJECT_ID);
                if prev_conflict || next_conflict {
                    return Err(SimutraceError::Corruption(format!(
                        "the range for index {i} of stream {} violates monotonicity <sqn: {sqn}>",
                        self.id
                    )));
                }
            }
        }

        let entry_count = location.entry_count() as u64;
        let raw_entry_count = location.raw_entry_count as u64;
        let compressed_size = location.compressed_size;
        let ranges = location.ranges;

        if !Self::segment_is_allocated(state, sqn) {
            // Replaying an existing segment while loading the store.
            Self::add_record(state, SegmentRecord::new_persisted(sqn, location));
        } else {
            let record = state.segments[sqn as usize]
                .as_mut()
                .filter(|r| r.location.is_none())
                .ok_or_else(|| {
                    SimutraceError::InvalidOperation(format!(
                        "segment {sqn} of stream {} already has a storage location",
                        self.id
                    ))
                })?;
            record.location = Some(location);
        }

        for i in 0..QUERY_TREE_COUNT {
            let range = ranges.ranges[i];
            if range.is_valid() {
                state.trees[i].insert(range, sqn);

                let stat = &mut state.stats.ranges.ranges[i];
                if range.start < stat.start {
                    stat.start = range.start;
                }
                if stat.end == INVALID_LARGE_OBJECT_ID || range.end > stat.end {
                    stat.end = range.end;
                }
            }
        }

        state.stats.compressed_size += compressed_size;
        state.stats.entry_count += entry_count;
        state.stats.raw_entry_count += raw_entry_count;

        trace!(stream = self.id, sqn, "Added segment to stream directory");
        Ok(())
    }

    fn find_sequence_number(
        state: &DirectoryState,
        query: QueryIndexType,
        value: u64,
    ) -> Result<Option<StreamSegmentId>> {
        if let Some(tree) = query.tree_index() {
            return Ok(state.trees[tree].lookup(value));
        }

        match query {
            QueryIndexType::SequenceNumber => Ok(Some(value as StreamSegmentId)),
            QueryIndexType::NextValidSequenceNumber => {
                Ok(Self::next_segment(state, value as StreamSegmentId))
            }
            QueryIndexType::PreviousValidSequenceNumber => {
                Ok(Self::previous_segment(state, value as StreamSegmentId))
            }
            _ => Err(SimutraceError::NotSupported(format!("query type {query:?}"))),
        }
    }

    // ───────────────────────── completion core ──────────────────────────

    /// Applies the outcome of a finished segment operation. `synchronous`
    /// means the buffer pool has already released or purged the side slot
    /// on the success path. Collected waits must be decremented by the
    /// caller after the state lock is dropped.
    fn complete_locked(
        &self,
        state: &mut DirectoryState,
        sqn: StreamSegmentId,
        arg: LocationArg,
        success: bool,
        synchronous: bool,
        waits_out: &mut Vec<Arc<StreamWait>>,
    ) {
        let is_load = match state.segments[sqn as usize].as_ref() {
            Some(record) => {
                debug_assert!(record.id == INVALID_SEGMENT_ID);
                record.location.is_some()
            }
            None => return,
        };

        let mut remove_from_open_list = false;
        let mut sqn_alive = true;
        let mut success = success;

        if is_load {
            // Load completion or read-only close.
            if let Some(record) = state.segments[sqn as usize].as_mut() {
                let closing = matches!(arg, LocationArg::None);
                if closing || record.cancel {
                    if !success {
                        if record.side_id != INVALID_SEGMENT_ID {
                            let _ = self.buffer.purge_segment(record.side_id);
                        }
                        record.prefetched = false;
                    } else if record.cancel {
                        // Fully decoded but no longer wanted; let the cache
                        // have a go at it.
                        let _ = self.buffer.free_segment(record.side_id, record.prefetched);
                    }

                    record.side_id = INVALID_SEGMENT_ID;
                    record.reference_count = 0;
                    record.reference_map.clear();
                    remove_from_open_list = true;
                }

                record.id = record.side_id;
                record.side_id = INVALID_SEGMENT_ID;
                record.cancel = false;
            }
            if remove_from_open_list || matches!(arg, LocationArg::None) {
                self.encoder().notify_segment_closed(sqn);
            }
        } else {
            // Encode completion; the sequence number dies unless a storage
            // location gets installed.
            remove_from_open_list = true;

            match arg {
                LocationArg::New(location) => match self.install_location(state, sqn, location) {
                    Ok(()) => {
                        if let Some(record) = state.segments[sqn as usize].as_mut() {
                            if !synchronous && record.side_id != INVALID_SEGMENT_ID {
                                let _ = self.buffer.free_segment(record.side_id, false);
                            }
                            record.side_id = INVALID_SEGMENT_ID;
                            record.reference_count = 0;
                            record.reference_map.clear();
                            record.cancel = false;
                        }
                    }
                    Err(e) => {
                        error!(
                            stream = self.id,
                            sqn,
                            error = %e,
                            "Failed to install storage location; discarding segment"
                        );
                        success = false;
                        if let Some(record) = state.segments[sqn as usize].as_mut() {
                            if record.side_id != INVALID_SEGMENT_ID {
                                let _ = self.buffer.purge_segment(record.side_id);
                            }
                            record.side_id = INVALID_SEGMENT_ID;
                        }
                        sqn_alive = false;
                    }
                },
                LocationArg::None => {
                    if let Some(record) = state.segments[sqn as usize].as_mut() {
                        if (!synchronous || !success) && record.side_id != INVALID_SEGMENT_ID {
                            let _ = self.buffer.purge_segment(record.side_id);
                        }
                        record.side_id = INVALID_SEGMENT_ID;
                    }
                    // Either the encoder failed or there was nothing to
                    // persist. The sequence number vanishes as if nothing
                    // had ever been appended to it.
                    sqn_alive = false;
                }
                LocationArg::Existing => {
                    debug_assert!(false, "encode completion with existing location");
                }
            }
        }

        if let Some(record) = state.segments[sqn as usize].as_mut() {
            waits_out.append(&mut record.wait_list);
        }
        if !success {
            debug!(stream = self.id, sqn, "Discarding segment after failed operation");
            let link = self.link(sqn);
            for wait in waits_out.iter() {
                wait.push_error(link);
            }
        }
        if remove_from_open_list {
            state.open_list.retain(|&s| s != sqn);
        }
        if !sqn_alive {
            state.segments[sqn as usize] = None;
        }
    }

    /// Completion callback for asynchronous loads.
    pub fn complete_load(&self, sqn: StreamSegmentId, success: bool) {
        let mut waits = Vec::new();
        {
            let mut state = self.state.write();
            if !Self::segment_is_allocated(&state, sqn) {
                warn!(stream = self.id, sqn, "Load completion for unknown segment");
                return;
            }
            let arg = if success { LocationArg::Existing } else { LocationArg::None };
            self.complete_locked(&mut state, sqn, arg, success, false, &mut waits);
        }
        for wait in waits {
            wait.decrement();
        }
    }

    /// Completion callback for asynchronous encodes. `None` discards the
    /// segment (failure or nothing to persist).
    pub fn complete_store(&self, sqn: StreamSegmentId, location: Option<StorageLocation>) {
        let mut waits = Vec::new();
        {
            let mut state = self.state.write();
            if !Self::segment_is_allocated(&state, sqn) {
                warn!(stream = self.id, sqn, "Store completion for unknown segment");
                return;
            }
            if state.segments[sqn as usize]
                .as_ref()
                .is_some_and(|r| r.location.is_some())
            {
                warn!(stream = self.id, sqn, "Store completion for a persisted segment");
                return;
            }
            let success = location.is_some();
            let arg = match location {
                Some(location) => LocationArg::New(location),
                None => LocationArg::None,
            };
            self.complete_locked(&mut state, sqn, arg, success, false, &mut waits);
        }
        for wait in waits {
            wait.decrement();
        }
    }

    // ───────────────────────── append ───────────────────────────────────

    /// Allocates the next segment of the stream for writing, submitting
    /// the previously appended segment of this session first.
    pub fn append(
        self: &Arc<Self>,
        session: SessionId,
        wait: Option<&Arc<StreamWait>>,
    ) -> Result<(StreamSegmentId, SegmentId)> {
        let mut append = self.append_lock.lock();

        if append.last_append_sequence_number != INVALID_STREAM_SEGMENT_ID {
            let sqn = append.last_append_sequence_number;
            let mut state = self.state.write();
            debug_assert!(Self::segment_is_allocated(&state, sqn));
            self.close_record(&mut state, &mut append, sqn, wait, false)?;
        }

        // The first sequence number is 0: the invalid sentinel wraps.
        let sqn = {
            let state = self.state.read();
            state.last_sequence_number.wrapping_add(1)
        };
        if sqn == INVALID_STREAM_SEGMENT_ID {
            return Err(SimutraceError::InvalidOperation(format!(
                "stream {} exhausted its sequence number space",
                self.id
            )));
        }

        let id = self
            .buffer
            .request_segment(self, sqn)
            .ok_or(SimutraceError::OperationInProgress { stream: self.id, sequence_number: sqn })?;

        let mut state = self.state.write();
        self.buffer.update_control(id, |control| {
            control.start_index = append.last_append_index;
        });
        Self::add_record(&mut state, SegmentRecord::new_writable(sqn, session, id));

        append.last_append_sequence_number = sqn;
        Ok((sqn, id))
    }

    /// Allocates a writable segment at a specific sequence number. Used by
    /// composite encoders appending to their hidden streams.
    pub fn add_segment(
        self: &Arc<Self>,
        session: SessionId,
        sqn: StreamSegmentId,
    ) -> Result<SegmentId> {
        if sqn == INVALID_STREAM_SEGMENT_ID {
            return Err(SimutraceError::OutOfBounds("sequence_number".into()));
        }

        let _append = self.append_lock.lock();
        {
            let state = self.state.read();
            if Self::segment_is_allocated(&state, sqn) {
                return Err(SimutraceError::InvalidOperation(format!(
                    "segment {sqn} of stream {} is already allocated",
                    self.id
                )));
            }
        }

        let id = self.buffer.request_segment(self, sqn).ok_or_else(|| {
            SimutraceError::InvalidOperation(format!(
                "out of segment memory <stream: {}, sqn: {sqn}>",
                self.id
            ))
        })?;

        let mut state = self.state.write();
        self.buffer.update_control(id, |control| {
            control.start_index = INVALID_ENTRY_INDEX;
        });
        Self::add_record(&mut state, SegmentRecord::new_writable(sqn, session, id));
        Ok(id)
    }

    /// Installs an already persisted segment, e.g. while loading a store.
    pub fn add_persisted_segment(
        &self,
        sqn: StreamSegmentId,
        location: StorageLocation,
    ) -> Result<()> {
        if sqn == INVALID_STREAM_SEGMENT_ID {
            return Err(SimutraceError::OutOfBounds("sequence_number".into()));
        }

        let mut append = self.append_lock.lock();
        let mut state = self.state.write();
        if Self::segment_is_allocated(&state, sqn) {
            return Err(SimutraceError::InvalidOperation(format!(
                "segment {sqn} of stream {} is already allocated",
                self.id
            )));
        }

        let start_index = location.ranges.start_index();
        self.install_location(&mut state, sqn, location)?;

        if start_index != INVALID_ENTRY_INDEX && start_index > append.last_append_index {
            append.last_append_index = start_index;
        }
        Ok(())
    }

    // ───────────────────────── close ────────────────────────────────────

    /// Closes the last reference of a record: submits writable segments to
    /// the encoder, cancels loads, releases read-only mappings.
    fn close_record(
        &self,
        state: &mut DirectoryState,
        append: &mut AppendState,
        sqn: StreamSegmentId,
        wait: Option<&Arc<StreamWait>>,
        ignore_errors: bool,
    ) -> Result<()> {
        let (id, read_only) = {
            let record = state.segments[sqn as usize].as_mut().ok_or_else(|| {
                SimutraceError::InvalidOperation(format!(
                    "segment {sqn} of stream {} is absent",
                    self.id
                ))
            })?;
            debug_assert!(record.reference_count == 1);

            // An operation is already in flight: register interest and,
            // for a load, request cancellation.
            if record.id == INVALID_SEGMENT_ID {
                debug_assert!(record.side_id != INVALID_SEGMENT_ID);
                if let Some(wait) = wait {
                    wait.increment();
                    record.wait_list.push(wait.clone());
                }
                record.cancel = true;
                return Ok(());
            }

            (record.id, record.location.is_some())
        };

        let outcome = match self.buffer.submit_segment(id) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                if matches!(e, SimutraceError::Corruption(_)) {
                    if let Some(store) = self.store.upgrade() {
                        store.force_read_only();
                    }
                }
                if !ignore_errors && !read_only {
                    return Err(e);
                }
                error!(
                    stream = self.id,
                    sqn,
                    error = %e,
                    "Forced submit failed; purging segment data"
                );
                None
            }
        };

        // Swap the slot into the side position so a repeated close fails.
        let side_id = {
            let record = state.segments[sqn as usize].as_mut().ok_or_else(|| {
                SimutraceError::InvalidOperation(format!("segment {sqn} vanished during close"))
            })?;
            record.side_id = record.id;
            record.id = INVALID_SEGMENT_ID;
            record.side_id
        };

        let mut entry_count = 0u32;
        let mut waits = Vec::new();

        match outcome {
            Some(SubmitOutcome::Pending) => {
                // The encoder owns the slot now; keep the reference and
                // the open-list entry so a session-wide close still finds
                // the segment.
                let control = self.buffer.control_snapshot(side_id);
                entry_count = if control.start_index != INVALID_ENTRY_INDEX {
                    control.entry_count
                } else {
                    0
                };
                if let Some(record) = state.segments[sqn as usize].as_mut() {
                    if let Some(wait) = wait {
                        wait.increment();
                        record.wait_list.push(wait.clone());
                    }
                }
            }
            Some(SubmitOutcome::Completed(location)) => {
                entry_count = location.as_ref().map(|l| l.entry_count()).unwrap_or(0);
                let arg = match location {
                    Some(location) => LocationArg::New(location),
                    None => LocationArg::None,
                };
                self.complete_locked(state, sqn, arg, true, true, &mut waits);
            }
            Some(SubmitOutcome::Dropped) | Some(SubmitOutcome::Freed) => {
                self.complete_locked(state, sqn, LocationArg::None, true, true, &mut waits);
            }
            None => {
                // Forced failure path: the slot was never handed over.
                self.complete_locked(state, sqn, LocationArg::None, false, true, &mut waits);
            }
        }

        for wait in waits {
            wait.decrement();
        }

        // Submitting a written segment through close updates the append
        // bookkeeping.
        if sqn == append.last_append_sequence_number {
            append.last_append_index += entry_count as u64;
            append.last_append_sequence_number = INVALID_STREAM_SEGMENT_ID;
        }
        Ok(())
    }

    /// Releases one reference of `session` on a single segment.
    pub fn close(
        &self,
        session: SessionId,
        sqn: StreamSegmentId,
        wait: Option<&Arc<StreamWait>>,
        ignore_errors: bool,
    ) -> Result<()> {
        let mut append = self.append_lock.lock();
        let mut state = self.state.write();

        let (reference_count, held) = {
            let record = state
                .segments
                .get(sqn as usize)
                .and_then(|s| s.as_ref())
                .ok_or_else(|| {
                    SimutraceError::InvalidOperation(format!(
                        "segment {sqn} of stream {} is not allocated",
                        self.id
                    ))
                })?;
            (
                record.reference_count,
                record.reference_map.get(&session).copied().unwrap_or(0),
            )
        };

        if reference_count == 0 || held == 0 {
            return Err(SimutraceError::InvalidOperation(format!(
                "session {session} does not hold any references to stream segment <sqn: {sqn}>"
            )));
        }

        if reference_count == 1 {
            self.close_record(&mut state, &mut append, sqn, wait, ignore_errors)
        } else {
            if let Some(record) = state.segments[sqn as usize].as_mut() {
                if held == 1 {
                    record.reference_map.remove(&session);
                } else if let Some(count) = record.reference_map.get_mut(&session) {
                    *count -= 1;
                }
                record.reference_count -= 1;
            }
            Ok(())
        }
    }

    /// Releases every reference `session` holds on this stream.
    pub fn close_session(
        &self,
        session: SessionId,
        wait: Option<&Arc<StreamWait>>,
        ignore_errors: bool,
    ) -> Result<()> {
        let mut append = self.append_lock.lock();
        let mut state = self.state.write();

        let open: Vec<StreamSegmentId> = state.open_list.clone();
        for sqn in open {
            let (reference_count, held) = match state
                .segments
                .get(sqn as usize)
                .and_then(|s| s.as_ref())
            {
                Some(record) => (
                    record.reference_count,
                    record.reference_map.get(&session).copied().unwrap_or(0),
                ),
                None => continue,
            };

            if held == 0 {
                continue;
            }

            if reference_count == held {
                self.close_record(&mut state, &mut append, sqn, wait, ignore_errors)?;
            } else if let Some(record) = state.segments[sqn as usize].as_mut() {
                record.reference_map.remove(&session);
                record.reference_count -= held;
            }
        }
        Ok(())
    }

    // ───────────────────────── open ─────────────────────────────────────

    /// Performs the 0→1 reference transition: allocate a slot, start the
    /// decoder, register waiters. Must be called with the open lock held.
    fn open_internal(
        self: &Arc<Self>,
        session: SessionId,
        sqn: StreamSegmentId,
        flags: StreamAccessFlags,
        prefetch: bool,
        wait: Option<&Arc<StreamWait>>,
    ) -> Result<(SegmentId, bool)> {
        let location = {
            let mut state = self.state.write();
            let record = state.segments[sqn as usize].as_mut().ok_or_else(|| {
                SimutraceError::NotFound(format!("segment {sqn} of stream {}", self.id))
            })?;
            debug_assert!(record.reference_count == 0);
            debug_assert!(record.id == INVALID_SEGMENT_ID);
            debug_assert!(record.side_id == INVALID_SEGMENT_ID);

            // Prefetches are not kept open after the load finishes; the
            // prefetch mark also guards against prefetching twice.
            record.prefetched = prefetch;
            record.cancel = prefetch;

            record
                .location
                .clone()
                .ok_or(SimutraceError::OperationInProgress {
                    stream: self.id,
                    sequence_number: sqn,
                })?
        };

        let slot = self.buffer.acquire_for_read(self, flags, &location, prefetch);

        let (slot, completed_by_cache) = match slot {
            None => {
                // Pool exhausted; report and give up on this open.
                let mut state = self.state.write();
                if let Some(record) = state.segments[sqn as usize].as_mut() {
                    record.cancel = false;
                    record.prefetched = false;
                }
                if let Some(wait) = wait {
                    wait.push_error(self.link(sqn));
                }
                return Ok((INVALID_SEGMENT_ID, true));
            }
            Some(ReadSlot::CacheHit(id)) => (id, true),
            Some(ReadSlot::Fresh(id)) => (id, false),
        };

        // Publish the side id before the decoder can complete.
        {
            let mut state = self.state.write();
            if let Some(record) = state.segments[sqn as usize].as_mut() {
                record.side_id = slot;
            }
        }

        let completed = if completed_by_cache {
            true
        } else {
            match self
                .encoder()
                .read(&self.buffer, slot, flags, &location, prefetch)
            {
                Ok(completed) => completed,
                Err(e) => {
                    let _ = self.buffer.purge_segment(slot);
                    let mut state = self.state.write();
                    if let Some(record) = state.segments[sqn as usize].as_mut() {
                        record.side_id = INVALID_SEGMENT_ID;
                    }
                    error!(
                        stream = self.id,
                        sqn,
                        slot,
                        error = %e,
                        "Failed to start decoding segment"
                    );
                    return Err(e);
                }
            }
        };

        let mut waits = Vec::new();
        let segment_id;
        {
            let mut state = self.state.write();
            {
                let record = state.segments[sqn as usize].as_mut().ok_or_else(|| {
                    SimutraceError::NotFound(format!("segment {sqn} of stream {}", self.id))
                })?;

                if record.id == INVALID_SEGMENT_ID {
                    segment_id = record.side_id;

                    if record.side_id == INVALID_SEGMENT_ID {
                        // The asynchronous operation already finished and
                        // failed; the supplied wait is the only party to
                        // inform since the open lock blocks everyone else.
                        record.cancel = false;
                        record.prefetched = false;
                        if let Some(wait) = wait {
                            wait.push_error(self.link(sqn));
                        }
                        return Ok((INVALID_SEGMENT_ID, true));
                    }

                    if !completed {
                        if let Some(wait) = wait {
                            wait.increment();
                            record.wait_list.push(wait.clone());
                        }
                    }
                } else {
                    // The load completed asynchronously before we got here.
                    segment_id = record.id;
                }

                record.reference_count += 1;
                *record.reference_map.entry(session).or_insert(0) += 1;
            }
            state.open_list.push(sqn);

            if completed {
                self.complete_locked(&mut state, sqn, LocationArg::Existing, true, true, &mut waits);
            }
        }
        for wait in waits {
            wait.decrement();
        }

        Ok((segment_id, completed))
    }

    /// Opens a segment by query. Returns the resolved sequence number
    /// (`None` while the load is still in progress) and the buffer slot.
    pub fn open(
        self: &Arc<Self>,
        session: SessionId,
        query: QueryIndexType,
        value: u64,
        flags: StreamAccessFlags,
        wait: Option<&Arc<StreamWait>>,
    ) -> Result<(Option<StreamSegmentId>, SegmentId)> {
        let _open_guard = self.open_lock.lock();

        let mut handled = false;
        let mut completed = false;
        let mut id = INVALID_SEGMENT_ID;
        let sqn;
        let mut read_ahead_list: Vec<StreamSegmentId> = Vec::new();

        {
            let mut state = self.state.write();
            sqn = Self::find_sequence_number(&state, query, value)?
                .filter(|&s| Self::segment_is_allocated(&state, s))
                .ok_or_else(|| {
                    SimutraceError::NotFound(format!("index value {value} in stream {}", self.id))
                })?;

            {
                let record = state.segments[sqn as usize].as_mut().ok_or_else(|| {
                    SimutraceError::NotFound(format!("segment {sqn} of stream {}", self.id))
                })?;

                if record.reference_count > 0 {
                    // Only the server session may open a segment that is
                    // still being written, and never one in the encoder's
                    // hands.
                    if session == SERVER_SESSION_ID {
                        if record.location.is_none() && record.id == INVALID_SEGMENT_ID {
                            return Err(SimutraceError::OperationInProgress {
                                stream: self.id,
                                sequence_number: sqn,
                            });
                        }
                    } else if record.location.is_none() {
                        return Err(SimutraceError::OperationInProgress {
                            stream: self.id,
                            sequence_number: sqn,
                        });
                    }

                    if !record.prefetched {
                        record.reference_count += 1;
                    } else {
                        // Take over the prefetch reference, rebuilding the
                        // map in case another session started the read
                        // ahead.
                        debug_assert!(record.reference_count == 1);
                        record.reference_map.clear();
                        record.prefetched = false;
                    }
                    *record.reference_map.entry(session).or_insert(0) += 1;
                    record.cancel = false;

                    if record.id == INVALID_SEGMENT_ID {
                        if let Some(wait) = wait {
                            wait.increment();
                            record.wait_list.push(wait.clone());
                        }
                        id = record.side_id;
                        completed = false;
                    } else {
                        id = record.id;
                        completed = true;
                    }
                    handled = true;
                } else if record.location.is_none() {
                    return Err(SimutraceError::OperationInProgress {
                        stream: self.id,
                        sequence_number: sqn,
                    });
                }
            }

            // Collect the read-ahead window while we hold the lock; the
            // actual opens run outside it and never stall this open.
            if flags.contains(StreamAccessFlags::SEQUENTIAL_SCAN) && self.read_ahead > 0 {
                let mut ra_sqn = sqn;
                for _ in 0..self.read_ahead {
                    match Self::next_segment(&state, ra_sqn) {
                        Some(next) => {
                            read_ahead_list.push(next);
                            ra_sqn = next;
                        }
                        None => break,
                    }
                }
            }
        }

        for ra_sqn in read_ahead_list {
            let eligible = {
                let state = self.state.read();
                state.segments[ra_sqn as usize].as_ref().is_some_and(|r| {
                    r.location.is_some() && r.reference_count == 0 && !r.prefetched
                })
            };
            if !eligible {
                continue;
            }
            let ra_flags = flags & !StreamAccessFlags::SYNCHRONOUS;
            match self.open_internal(session, ra_sqn, ra_flags, true, None) {
                Ok((id, _)) if id != INVALID_SEGMENT_ID => {}
                _ => break, // best effort; abort read ahead
            }
        }

        if !handled {
            let (open_id, open_completed) = self.open_internal(session, sqn, flags, false, wait)?;
            id = open_id;
            completed = open_completed;
        }

        if completed && id != INVALID_SEGMENT_ID {
            Ok((Some(sqn), id))
        } else {
            Ok((None, id))
        }
    }

    // ───────────────────────── queries ──────────────────────────────────

    pub fn query_information(&self) -> StreamQueryInformation {
        let stats = self.state.read().stats;
        let mut info = StreamQueryInformation { descriptor: self.descriptor.clone(), stats };
        self.encoder().query_stream_info(&mut info);
        info
    }

    /// Buffer slot currently mapping the segment, if any.
    pub fn buffer_mapping(&self, sqn: StreamSegmentId) -> SegmentId {
        let state = self.state.read();
        state
            .segments
            .get(sqn as usize)
            .and_then(|s| s.as_ref())
            .map(|r| r.id)
            .unwrap_or(INVALID_SEGMENT_ID)
    }

    pub fn storage_location(&self, sqn: StreamSegmentId) -> Result<StorageLocation> {
        let state = self.state.read();
        state
            .segments
            .get(sqn as usize)
            .and_then(|s| s.as_ref())
            .and_then(|r| r.location.clone())
            .ok_or_else(|| SimutraceError::NotFound(format!("segment {sqn} of stream {}", self.id)))
    }

    pub fn last_sequence_number(&self) -> StreamSegmentId {
        self.state.read().last_sequence_number
    }

    /// True when no segment of this stream is referenced or in flight.
    pub fn is_idle(&self) -> bool {
        self.state.read().open_list.is_empty()
    }
}
