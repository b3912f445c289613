// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! VPC4 memory-trace encoder.
//!
//! Each memory-access entry is decomposed into hidden byte streams: a
//! 16-bit metadata word, one 4-bit predictor id per predicted field
//! (half-byte packed) and a literal stream per field for mispredictions.
//! The hidden streams live on the same store, marked hidden, and are
//! recorded in an `AssociatedStreams` attribute on the public stream so
//! the association survives a reopen.
//!
//! One public segment maps to one sub-segment in every hidden stream; a
//! hidden segment holds as many sub-segments as the element-size ratio
//! allows. Whoever completes the last missing sub-segment submits the
//! hidden segment (atomic counter); partially-filled hidden segments are
//! flushed when the encoder closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::entries::{
    DataMemoryAccess32, DataMemoryAccess64, MemoryAccess32, MemoryAccess64, MemoryAccessMetaData,
};
use crate::error::{Result, SimutraceError};
use crate::simtrace::encoder::{
    submit_read_job, submit_write_job, EncoderContext, StreamEncoder,
};
use crate::simtrace::format::{
    parse_associated_streams, serialize_associated_streams, SAT_ASSOCIATED_STREAMS,
};
use crate::simtrace::frame::Frame;
use crate::simtrace::vpc4::{
    CyclePredictor, DataReader, DataWriter, IdReader, IdWriter, IpPredictor, ValuePredictor,
    VpcValue,
};
use crate::storage::buffer::BufferPool;
use crate::storage::store::Store;
use crate::storage::stream::Stream;
use crate::types::{
    SegmentId, StorageLocation, StreamAccessFlags, StreamDescriptor, StreamId,
    StreamQueryInformation, StreamSegmentId, StreamTypeDescriptor, StreamTypeFlags, TypeGuid,
    INVALID_SEGMENT_ID, SEGMENT_SIZE, SERVER_BUFFER_ID, SERVER_SESSION_ID,
};
use crate::worker::StreamWait;

/// Fill for unused data and cycle sub-segment space; runs of a single
/// byte cost the second-stage compressor almost nothing.
const FILL_CHAR: u8 = 0xFF;

// ─────────────────────────────── entry layout ────────────────────────────────

/// Field layout of one memory-access entry type.
pub trait MemoryEntry: bytemuck::Pod + Default + Send + Sync + 'static {
    /// Width of the ip/address/data fields.
    type Value: VpcValue;

    const ARCH32: bool;
    const DATA_FIELD_COUNT: usize;

    fn ip(&self) -> Self::Value;
    fn set_ip(&mut self, value: Self::Value);
    fn data_field(&self, index: usize) -> Self::Value;
    fn set_data_field(&mut self, index: usize, value: Self::Value);
    fn metadata(&self) -> MemoryAccessMetaData;
    fn set_metadata(&mut self, metadata: MemoryAccessMetaData);
}

impl MemoryEntry for MemoryAccess32 {
    type Value = u32;
    const ARCH32: bool = true;
    const DATA_FIELD_COUNT: usize = 1;

    fn ip(&self) -> u32 {
        self.ip
    }
    fn set_ip(&mut self, value: u32) {
        self.ip = value;
    }
    fn data_field(&self, _index: usize) -> u32 {
        self.address
    }
    fn set_data_field(&mut self, _index: usize, value: u32) {
        self.address = value;
    }
    fn metadata(&self) -> MemoryAccessMetaData {
        self.metadata
    }
    fn set_metadata(&mut self, metadata: MemoryAccessMetaData) {
        self.metadata = metadata;
    }
}

impl MemoryEntry for DataMemoryAccess32 {
    type Value = u32;
    const ARCH32: bool = true;
    const DATA_FIELD_COUNT: usize = 2;

    fn ip(&self) -> u32 {
        self.ip
    }
    fn set_ip(&mut self, value: u32) {
        self.ip = value;
    }
    fn data_field(&self, index: usize) -> u32 {
        if index == 0 {
            self.address
        } else {
            self.data
        }
    }
    fn set_data_field(&mut self, index: usize, value: u32) {
        if index == 0 {
            self.address = value;
        } else {
            self.data = value;
        }
    }
    fn metadata(&self) -> MemoryAccessMetaData {
        self.metadata
    }
    fn set_metadata(&mut self, metadata: MemoryAccessMetaData) {
        self.metadata = metadata;
    }
}

impl MemoryEntry for MemoryAccess64 {
    type Value = u64;
    const ARCH32: bool = false;
    const DATA_FIELD_COUNT: usize = 1;

    fn ip(&self) -> u64 {
        self.ip
    }
    fn set_ip(&mut self, value: u64) {
        self.ip = value;
    }
    fn data_field(&self, _index: usize) -> u64 {
        self.address
    }
    fn set_data_field(&mut self, _index: usize, value: u64) {
        self.address = value;
    }
    fn metadata(&self) -> MemoryAccessMetaData {
        self.metadata
    }
    fn set_metadata(&mut self, metadata: MemoryAccessMetaData) {
        self.metadata = metadata;
    }
}

impl MemoryEntry for DataMemoryAccess64 {
    type Value = u64;
    const ARCH32: bool = false;
    const DATA_FIELD_COUNT: usize = 2;

    fn ip(&self) -> u64 {
        self.ip
    }
    fn set_ip(&mut self, value: u64) {
        self.ip = value;
    }
    fn data_field(&self, index: usize) -> u64 {
        if index == 0 {
            self.address
        } else {
            self.data
        }
    }
    fn set_data_field(&mut self, index: usize, value: u64) {
        if index == 0 {
            self.address = value;
        } else {
            self.data = value;
        }
    }
    fn metadata(&self) -> MemoryAccessMetaData {
        self.metadata
    }
    fn set_metadata(&mut self, metadata: MemoryAccessMetaData) {
        self.metadata = metadata;
    }
}

// ─────────────────────────────── sub-segment layout ──────────────────────────

#[derive(Debug, Clone, Copy)]
struct LineConfig {
    prefix: &'static str,
    stream_count: usize,
    sub_segment_count: u32,
}

#[derive(Debug, Clone)]
struct MemoryLayout {
    id_stream_count: usize,
    data_stream_count: usize,
    lines: Vec<LineConfig>,
    total_stream_count: usize,
}

impl MemoryLayout {
    fn for_entry<E: MemoryEntry>() -> MemoryLayout {
        let entry_size = std::mem::size_of::<E>();
        let max_entry_count = SEGMENT_SIZE / entry_size;

        // Per entry, each hidden stream stores at most one element; the
        // element-size ratio determines how many public segments fit into
        // one hidden segment.
        let data_sub_size = max_entry_count * E::Value::BYTES;
        let cycle_sub_size = max_entry_count * 8;
        let meta_sub_size = max_entry_count * 2;
        let id_sub_size = max_entry_count.div_ceil(2);

        let data_count = (SEGMENT_SIZE / data_sub_size) as u32;
        let cycle_count = (SEGMENT_SIZE / cycle_sub_size) as u32;
        let meta_count = (SEGMENT_SIZE / meta_sub_size) as u32;
        let id_count = (SEGMENT_SIZE / id_sub_size) as u32;

        // Ids: ip, one per data field, cycle. Literals: ip, one per data
        // field; the 64-bit layouts co-locate the cycle literals with the
        // field literals, the 32-bit layouts give them their own line
        // (cycle literals stay 64 bits wide).
        let id_stream_count = 2 + E::DATA_FIELD_COUNT;
        let data_stream_count = 1 + E::DATA_FIELD_COUNT;

        let mut lines = vec![
            LineConfig { prefix: "meta", stream_count: 1, sub_segment_count: meta_count },
            LineConfig { prefix: "ids", stream_count: id_stream_count, sub_segment_count: id_count },
        ];
        if E::ARCH32 {
            lines.push(LineConfig {
                prefix: "data",
                stream_count: data_stream_count,
                sub_segment_count: data_count,
            });
            lines.push(LineConfig { prefix: "cycle", stream_count: 1, sub_segment_count: cycle_count });
        } else {
            lines.push(LineConfig {
                prefix: "data",
                stream_count: data_stream_count + 1,
                sub_segment_count: data_count,
            });
        }

        let total_stream_count = lines.iter().map(|l| l.stream_count).sum();
        MemoryLayout { id_stream_count, data_stream_count, lines, total_stream_count }
    }
}

// ─────────────────────────────── buffer context ──────────────────────────────

struct ContextInit {
    initialized: bool,
    is_load: bool,
    closed: bool,
    segment_ids: Vec<SegmentId>,
}

/// One hidden-stream segment group: the segments at one hidden sequence
/// number across all streams of a line.
struct BufferContext {
    sequence_number: StreamSegmentId,
    sub_segment_count: u32,
    sub_segment_size: usize,
    streams: Vec<Arc<Stream>>,

    init: Mutex<ContextInit>,
    open_wait: Arc<StreamWait>,
    /// Completed sub-segments; the completer observing the last one closes
    /// the group.
    used: AtomicU32,
    /// Highest completed sub-segment index + 1. Sequence-number holes from
    /// dropped empty segments leave gaps, so the completion count alone
    /// undercounts the occupied space.
    high_water: AtomicU32,
}

impl BufferContext {
    fn new(
        sequence_number: StreamSegmentId,
        streams: Vec<Arc<Stream>>,
        sub_segment_count: u32,
    ) -> Arc<BufferContext> {
        let count = streams.len();
        Arc::new(BufferContext {
            sequence_number,
            sub_segment_count,
            sub_segment_size: SEGMENT_SIZE / sub_segment_count as usize,
            streams,
            init: Mutex::new(ContextInit {
                initialized: false,
                is_load: false,
                closed: false,
                segment_ids: vec![INVALID_SEGMENT_ID; count],
            }),
            open_wait: Arc::new(StreamWait::new()),
            used: AtomicU32::new(0),
            high_water: AtomicU32::new(0),
        })
    }

    fn ensure(&self, is_load: bool) -> Result<()> {
        let mut init = self.init.lock();
        if init.initialized {
            if init.is_load != is_load {
                return Err(SimutraceError::InvalidOperation(
                    "hidden segment group is in the opposite transfer direction".into(),
                ));
            }
            return Ok(());
        }

        for (i, stream) in self.streams.iter().enumerate() {
            let id = if is_load {
                let (_, id) = stream.open(
                    SERVER_SESSION_ID,
                    crate::types::QueryIndexType::SequenceNumber,
                    self.sequence_number as u64,
                    StreamAccessFlags::empty(),
                    Some(&self.open_wait),
                )?;
                id
            } else {
                stream.add_segment(SERVER_SESSION_ID, self.sequence_number)?
            };

            if id == INVALID_SEGMENT_ID {
                return Err(SimutraceError::InvalidOperation(format!(
                    "out of segment memory <stream: {}, sqn: {}>",
                    stream.id(),
                    self.sequence_number
                )));
            }
            init.segment_ids[i] = id;
        }

        init.is_load = is_load;
        init.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.init.lock().initialized
    }

    /// Blocks until all loads of this group finished; `false` on errors.
    fn wait_for_load(&self) -> bool {
        self.open_wait.wait()
    }

    /// Base pointer and length of one sub-segment. The caller guarantees
    /// disjoint public sequence numbers, so the carved slices never alias.
    fn sub_segment(&self, buffer: usize, public_sqn: StreamSegmentId) -> (*mut u8, usize) {
        let init = self.init.lock();
        debug_assert!(init.initialized);
        debug_assert_eq!(public_sqn / self.sub_segment_count, self.sequence_number);

        let index = (public_sqn % self.sub_segment_count) as usize;
        let pool = self.streams[buffer].buffer();
        let base = pool.segment_ptr(init.segment_ids[buffer]);
        (unsafe { base.add(index * self.sub_segment_size) }, self.sub_segment_size)
    }

    /// Records the completion of one sub-segment; closes the group when it
    /// was the last one. Returns true when the group closed.
    fn complete_sub_segment(&self, public_sqn: StreamSegmentId, wait: &Arc<StreamWait>) -> bool {
        let index = public_sqn % self.sub_segment_count;
        self.high_water.fetch_max(index + 1, Ordering::SeqCst);

        if self.used.fetch_add(1, Ordering::SeqCst) == self.sub_segment_count - 1 {
            self.close(wait);
            return true;
        }
        false
    }

    /// Submits (or releases) the hidden segments of this group.
    fn close(&self, wait: &Arc<StreamWait>) {
        let mut init = self.init.lock();
        if !init.initialized || init.closed {
            return;
        }
        init.closed = true;

        let high_water = self.high_water.load(Ordering::SeqCst);
        for (i, stream) in self.streams.iter().enumerate() {
            let id = init.segment_ids[i];
            if id == INVALID_SEGMENT_ID {
                continue;
            }

            if !init.is_load {
                let raw = (self.sub_segment_size as u64 * high_water as u64) as u32;
                stream.buffer().update_control(id, |control| {
                    control.raw_entry_count = raw;
                });
            }

            if let Err(e) = stream.close(SERVER_SESSION_ID, self.sequence_number, Some(wait), true) {
                error!(
                    stream = stream.id(),
                    sqn = self.sequence_number,
                    error = %e,
                    "Failed to close hidden stream segment; its data is lost"
                );
            }
            init.segment_ids[i] = INVALID_SEGMENT_ID;
        }
    }
}

// ─────────────────────────────── sub-segment view ────────────────────────────

/// Cursors over the sub-segments one public segment maps to.
struct SubSegmentView {
    contexts: Vec<Arc<BufferContext>>,
    public_sqn: StreamSegmentId,
}

impl SubSegmentView {
    fn slice(&self, line: usize, buffer: usize) -> &'static mut [u8] {
        let (ptr, len) = self.contexts[line].sub_segment(buffer, self.public_sqn);
        // Disjoint regions per public sequence number; the buffer slot is
        // pinned by the open segment reference for the view's lifetime.
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }
}

// ─────────────────────────────── the encoder ─────────────────────────────────

struct LineState {
    config: LineConfig,
    streams: Vec<Arc<Stream>>,
    contexts: HashMap<StreamSegmentId, Arc<BufferContext>>,
}

pub struct MemoryEncoder<E: MemoryEntry> {
    ctx: EncoderContext,
    layout: MemoryLayout,
    lines: Mutex<Vec<LineState>>,
    global_wait: Arc<StreamWait>,
    _marker: std::marker::PhantomData<E>,
}

impl<E: MemoryEntry> MemoryEncoder<E> {
    pub fn factory(store: &Arc<Store>, stream: &Arc<Stream>) -> Result<Box<dyn StreamEncoder>> {
        let desc = &stream.descriptor().type_desc;
        if desc.entry_size as usize != std::mem::size_of::<E>() {
            return Err(SimutraceError::Argument(
                "descriptor".into(),
                format!(
                    "entry size {} does not match the memory access type ({} bytes)",
                    desc.entry_size,
                    std::mem::size_of::<E>()
                ),
            ));
        }
        if desc.big_endian() {
            return Err(SimutraceError::NotSupported("byte-swapped memory streams".into()));
        }
        if !desc.temporal_order() {
            return Err(SimutraceError::NotSupported(
                "memory streams without temporal order".into(),
            ));
        }

        Ok(Box::new(MemoryEncoder::<E> {
            ctx: EncoderContext::new(store, stream),
            layout: MemoryLayout::for_entry::<E>(),
            lines: Mutex::new(Vec::new()),
            global_wait: Arc::new(StreamWait::new()),
            _marker: std::marker::PhantomData,
        }))
    }

    /// Registers the hidden streams (or resolves them from a replayed
    /// association) and records the association on the store.
    fn initialize_lines(&self, association: Option<&[StreamId]>) -> Result<()> {
        let store = self.ctx.store()?;
        let public = self.ctx.stream()?;

        let mut lines = self.lines.lock();
        if !lines.is_empty() {
            return Ok(());
        }

        if let Some(ids) = association {
            if ids.len() != self.layout.total_stream_count {
                return Err(SimutraceError::Corruption(format!(
                    "corrupted or incompatible stream association for stream {}: expected {} streams, found {}",
                    public.id(),
                    self.layout.total_stream_count,
                    ids.len()
                )));
            }
        }

        let mut assoc_ids = Vec::with_capacity(self.layout.total_stream_count);
        let mut cursor = 0usize;
        let mut new_lines = Vec::with_capacity(self.layout.lines.len());

        for config in &self.layout.lines {
            let mut streams = Vec::with_capacity(config.stream_count);
            for i in 0..config.stream_count {
                let stream = match association {
                    Some(ids) => {
                        let id = ids[cursor];
                        store.find_stream(id).ok_or_else(|| {
                            SimutraceError::Corruption(format!(
                                "failed to initialize memory encoder for stream {}: \
                                 could not find associated stream 'stream{}:{}{}' ({id})",
                                public.id(),
                                public.id(),
                                config.prefix,
                                i
                            ))
                        })?
                    }
                    None => {
                        let descriptor = StreamDescriptor {
                            name: format!("stream{}:{}{}", public.id(), config.prefix, i),
                            hidden: true,
                            type_desc: StreamTypeDescriptor {
                                id: TypeGuid::ZERO,
                                flags: StreamTypeFlags::empty(),
                                entry_size: 1,
                            },
                        };
                        let id = store.register_stream(descriptor, SERVER_BUFFER_ID)?;
                        store.find_stream(id).ok_or_else(|| {
                            SimutraceError::NotFound(format!("hidden stream {id}"))
                        })?
                    }
                };
                cursor += 1;
                assoc_ids.push(stream.id());
                streams.push(stream);
            }
            new_lines.push(LineState {
                config: *config,
                streams,
                contexts: HashMap::new(),
            });
        }

        if association.is_none() {
            // Record which hidden streams back this memory stream so the
            // same split can be restored after a reopen.
            let mut frame =
                Frame::new(public.id(), public.descriptor().type_desc.id, None);
            frame.add_attribute(
                SAT_ASSOCIATED_STREAMS,
                Bytes::from(serialize_associated_streams(&assoc_ids)),
            )?;
            store.container().commit_frame(&mut frame)?;
        }

        *lines = new_lines;
        debug!(
            stream = public.id(),
            hidden_streams = assoc_ids.len(),
            "Memory encoder lines initialised"
        );
        Ok(())
    }

    /// Gets or creates the per-line buffer contexts for a public sequence
    /// number and brings them into the requested transfer direction.
    fn setup_view(&self, public_sqn: StreamSegmentId, is_load: bool) -> Result<SubSegmentView> {
        let mut contexts: Vec<Arc<BufferContext>> = Vec::with_capacity(self.layout.lines.len());
        let mut created: Vec<bool> = Vec::with_capacity(self.layout.lines.len());

        {
            let mut lines = self.lines.lock();
            if lines.is_empty() {
                return Err(SimutraceError::InvalidOperation(
                    "memory encoder used before initialisation".into(),
                ));
            }
            for line in lines.iter_mut() {
                let hidden_sqn = public_sqn / line.config.sub_segment_count;
                let mut was_created = false;
                let context = line
                    .contexts
                    .entry(hidden_sqn)
                    .or_insert_with(|| {
                        was_created = true;
                        BufferContext::new(
                            hidden_sqn,
                            line.streams.clone(),
                            line.config.sub_segment_count,
                        )
                    })
                    .clone();
                contexts.push(context);
                created.push(was_created);
            }
        }

        let mut failure = None;
        for context in &contexts {
            if let Err(e) = context.ensure(is_load) {
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            // Throw away contexts this call created and never initialised;
            // initialised ones keep accumulating completions as usual.
            let mut lines = self.lines.lock();
            for (i, line) in lines.iter_mut().enumerate() {
                if created[i] && !contexts[i].is_initialized() {
                    line.contexts.remove(&contexts[i].sequence_number);
                }
            }
            return Err(e);
        }

        if is_load {
            for context in &contexts {
                if !context.wait_for_load() {
                    let mut message =
                        String::from("could not establish load context; failed segments:");
                    while let Some(link) = context.open_wait.pop_error() {
                        message.push_str(&format!(
                            " <stream: {}, sqn: {}>",
                            link.stream, link.sequence_number
                        ));
                    }
                    self.finish_view(&SubSegmentView {
                        contexts: contexts.clone(),
                        public_sqn,
                    });
                    return Err(SimutraceError::Corruption(message));
                }
            }
        }

        Ok(SubSegmentView { contexts, public_sqn })
    }

    /// Counts the view's sub-segments as completed, closing and unhooking
    /// finished groups.
    fn finish_view(&self, view: &SubSegmentView) {
        for (i, context) in view.contexts.iter().enumerate() {
            if context.complete_sub_segment(view.public_sqn, &self.global_wait) {
                let mut lines = self.lines.lock();
                if let Some(line) = lines.get_mut(i) {
                    line.contexts.remove(&context.sequence_number);
                }
            }
        }
    }

    fn encode_entries(&self, view: &SubSegmentView, entries: &[E], start_cycle: u64) -> Result<()> {
        let mut ip_predictor: IpPredictor<E::Value> = IpPredictor::new();
        let mut cycle_predictor = CyclePredictor::new(start_cycle);
        let mut value_predictors: Vec<ValuePredictor<E::Value>> =
            (0..E::DATA_FIELD_COUNT).map(|_| ValuePredictor::new()).collect();

        let meta = view.slice(0, 0);
        let mut id_writers: Vec<IdWriter<'_>> = (0..self.layout.id_stream_count)
            .map(|i| IdWriter::new(view.slice(1, i)))
            .collect();
        let mut data_writers: Vec<DataWriter<'_, E::Value>> = (0..self.layout.data_stream_count)
            .map(|i| DataWriter::new(view.slice(2, i)))
            .collect();
        let mut cycle_writer: DataWriter<'_, u64> = if E::ARCH32 {
            DataWriter::new(view.slice(3, 0))
        } else {
            DataWriter::new(view.slice(2, self.layout.data_stream_count))
        };

        let cycle_id_index = 1 + E::DATA_FIELD_COUNT;
        let mut meta_pos = 0usize;

        for entry in entries {
            let ip = entry.ip();
            ip_predictor.encode(&mut id_writers[0], &mut data_writers[0], ip);

            for (i, predictor) in value_predictors.iter_mut().enumerate() {
                predictor.encode(
                    &mut id_writers[i + 1],
                    &mut data_writers[i + 1],
                    entry.data_field(i),
                    ip.to_u64(),
                );
            }

            let metadata = entry.metadata();
            cycle_predictor.encode(
                &mut id_writers[cycle_id_index],
                &mut cycle_writer,
                metadata.cycle_count(),
                ip.to_u64(),
            );

            meta[meta_pos..meta_pos + 2].copy_from_slice(&metadata.upper_bits().to_le_bytes());
            meta_pos += 2;
        }

        // Successful predictions leave the literal space untouched and
        // full of stale data from the slot's previous use; flatten it for
        // the second-stage compressor. Id and meta streams are always
        // densely written, only their final sub-segment stays short.
        for writer in data_writers.iter_mut() {
            writer.fill_remaining(FILL_CHAR);
        }
        cycle_writer.fill_remaining(FILL_CHAR);

        Ok(())
    }

    fn decode_entries(&self, view: &SubSegmentView, entries: &mut [E], start_cycle: u64) -> Result<()> {
        let mut ip_predictor: IpPredictor<E::Value> = IpPredictor::new();
        let mut cycle_predictor = CyclePredictor::new(start_cycle);
        let mut value_predictors: Vec<ValuePredictor<E::Value>> =
            (0..E::DATA_FIELD_COUNT).map(|_| ValuePredictor::new()).collect();

        let meta: &[u8] = view.slice(0, 0);
        let mut id_readers: Vec<IdReader<'_>> = (0..self.layout.id_stream_count)
            .map(|i| IdReader::new(view.slice(1, i)))
            .collect();
        let mut data_readers: Vec<DataReader<'_, E::Value>> = (0..self.layout.data_stream_count)
            .map(|i| DataReader::new(view.slice(2, i)))
            .collect();
        let mut cycle_reader: DataReader<'_, u64> = if E::ARCH32 {
            DataReader::new(view.slice(3, 0))
        } else {
            DataReader::new(view.slice(2, self.layout.data_stream_count))
        };

        let cycle_id_index = 1 + E::DATA_FIELD_COUNT;
        let mut meta_pos = 0usize;

        for entry in entries.iter_mut() {
            let ip = ip_predictor.decode(&mut id_readers[0], &mut data_readers[0])?;
            entry.set_ip(ip);

            for (i, predictor) in value_predictors.iter_mut().enumerate() {
                let value =
                    predictor.decode(&mut id_readers[i + 1], &mut data_readers[i + 1], ip.to_u64())?;
                entry.set_data_field(i, value);
            }

            let upper = u16::from_le_bytes([meta[meta_pos], meta[meta_pos + 1]]);
            meta_pos += 2;

            let cycle =
                cycle_predictor.decode(&mut id_readers[cycle_id_index], &mut cycle_reader, ip.to_u64())?;
            entry.set_metadata(MemoryAccessMetaData::from_parts(upper, cycle));
        }

        Ok(())
    }
}

impl<E: MemoryEntry> StreamEncoder for MemoryEncoder<E> {
    fn read(
        &self,
        _pool: &BufferPool,
        segment: SegmentId,
        flags: StreamAccessFlags,
        location: &StorageLocation,
        prefetch: bool,
    ) -> Result<bool> {
        submit_read_job(&self.ctx, self, segment, flags, location, prefetch)
    }

    fn write(&self, _pool: &BufferPool, segment: SegmentId) -> Result<(bool, Option<StorageLocation>)> {
        // Hidden streams are created lazily on the first write so stream
        // registration cannot recurse into itself.
        if self.lines.lock().is_empty() {
            self.initialize_lines(None)?;
        }
        submit_write_job(&self.ctx, segment)
    }

    fn initialize(&self, frame: &Frame, is_open: bool) -> Result<()> {
        if !is_open {
            return Ok(());
        }
        let Some(attribute) = frame.find_attribute(SAT_ASSOCIATED_STREAMS) else {
            return Ok(());
        };
        let ids = parse_associated_streams(&attribute.data)?;
        self.initialize_lines(Some(&ids))
    }

    fn close(&self, wait: &Arc<StreamWait>) -> Result<()> {
        // Flush any partially-filled hidden segment groups; the supplied
        // wait lets the caller signal all encoders before blocking.
        {
            let mut lines = self.lines.lock();
            for line in lines.iter_mut() {
                for (_, context) in line.contexts.drain() {
                    context.close(wait);
                }
            }
        }

        // Implicit completes run against the encoder-private wait; they
        // are already in flight and cannot use the caller's context.
        self.global_wait.wait();
        Ok(())
    }

    fn query_stream_info(&self, info: &mut StreamQueryInformation) {
        // The public stream does not account the hidden streams backing
        // it; fold their compressed size into the report.
        let lines = self.lines.lock();
        for line in lines.iter() {
            for stream in &line.streams {
                let hidden = stream.query_information();
                info.stats.compressed_size += hidden.stats.compressed_size;
            }
        }
    }

    fn encode_frame(&self, segment: SegmentId, sqn: StreamSegmentId) -> Result<Frame> {
        let stream = self.ctx.stream()?;
        let pool = stream.buffer();
        let control = pool.control_snapshot(segment);

        let view = self.setup_view(sqn, false)?;

        let entry_count = control.raw_entry_count as usize;
        let payload = &pool.segment(segment)[..entry_count * std::mem::size_of::<E>()];
        let entries: &[E] = bytemuck::cast_slice(payload);

        let result = self.encode_entries(&view, entries, control.start_cycle);
        self.finish_view(&view);
        result?;

        Ok(Frame::new(stream.id(), stream.descriptor().type_desc.id, Some(&control)))
    }

    fn decode_segment(
        &self,
        _location: &StorageLocation,
        segment: SegmentId,
        sqn: StreamSegmentId,
    ) -> Result<()> {
        let stream = self.ctx.stream()?;
        let pool = stream.buffer();
        let control = pool.control_snapshot(segment);

        let view = self.setup_view(sqn, true)?;

        let entry_count = control.raw_entry_count as usize;
        let payload = &mut pool.segment_mut(segment)[..entry_count * std::mem::size_of::<E>()];
        let entries: &mut [E] = bytemuck::cast_slice_mut(payload);

        let result = self.decode_entries(&view, entries, control.start_cycle);
        self.finish_view(&view);
        result
    }

    fn friendly_name(&self) -> &str {
        "simtrace3 memory encoder"
    }
}
