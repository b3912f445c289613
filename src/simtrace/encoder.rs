// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Encoder framework: the trait every segment codec implements, the
//! worker-pool plumbing shared by the simtrace encoders, and the default
//! generic encoder (zstd-compressed data attribute).
//!
//! An encoder method that completes synchronously must NOT call back into
//! the stream's `complete_*`; it signals completion through its return
//! value. Asynchronous completion goes through `complete_load` /
//! `complete_store` from the worker thread.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::{error, warn};

use crate::error::{Result, SimutraceError};
use crate::simtrace::frame::{storage_location_from_frame, Frame};
use crate::storage::buffer::BufferPool;
use crate::storage::store::Store;
use crate::storage::stream::Stream;
use crate::types::{
    SegmentId, StorageLocation, StreamAccessFlags, StreamQueryInformation, StreamSegmentId,
    INVALID_SEGMENT_ID, SEGMENT_SIZE,
};
use crate::worker::{Priority, StreamWait};

/// zstd level for the generic second-stage compression.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Factory registered per stream type GUID.
pub type EncoderFactory =
    fn(&Arc<Store>, &Arc<Stream>) -> Result<Box<dyn StreamEncoder>>;

pub trait StreamEncoder: Send + Sync {
    /// Fills `segment` from `location`. Returns `Ok(true)` when the data is
    /// ready on return; `Ok(false)` when the encoder owns the slot until it
    /// calls `complete_load`.
    fn read(
        &self,
        pool: &BufferPool,
        segment: SegmentId,
        flags: StreamAccessFlags,
        location: &StorageLocation,
        prefetch: bool,
    ) -> Result<bool>;

    /// Persists `segment`. Returns `(true, Some(location))` for synchronous
    /// completion, `(false, None)` when the encoder owns the slot until it
    /// calls `complete_store`.
    fn write(&self, pool: &BufferPool, segment: SegmentId) -> Result<(bool, Option<StorageLocation>)>;

    /// Flush any encoder-private state. Called once at store teardown; the
    /// supplied wait aggregates pending segment operations.
    fn close(&self, _wait: &Arc<StreamWait>) -> Result<()> {
        Ok(())
    }

    /// Replays a zero frame of the stream. `is_open` distinguishes store
    /// open (restore state from attributes) from stream registration.
    fn initialize(&self, _frame: &Frame, _is_open: bool) -> Result<()> {
        Ok(())
    }

    /// Called when a segment leaves the directory's open set.
    fn notify_segment_closed(&self, _sqn: StreamSegmentId) {}

    /// Standby-cache eviction hook.
    fn notify_segment_cache_closed(&self, _sqn: StreamSegmentId) {}

    /// Contributes encoder-private numbers to an information query.
    fn query_stream_info(&self, _info: &mut StreamQueryInformation) {}

    /// Produces the frame for a submitted segment. Runs on a worker
    /// thread; the committed frame becomes the segment's storage location.
    fn encode_frame(&self, segment: SegmentId, sqn: StreamSegmentId) -> Result<Frame>;

    /// Fills a buffer segment from its persisted frame.
    fn decode_segment(
        &self,
        location: &StorageLocation,
        segment: SegmentId,
        sqn: StreamSegmentId,
    ) -> Result<()>;

    fn friendly_name(&self) -> &str;
}

// ───────────────────────── shared job plumbing ───────────────────────────────

/// Weak back-references every simtrace encoder carries.
pub(crate) struct EncoderContext {
    store: Weak<Store>,
    stream: Weak<Stream>,
}

impl EncoderContext {
    pub fn new(store: &Arc<Store>, stream: &Arc<Stream>) -> Self {
        EncoderContext { store: Arc::downgrade(store), stream: Arc::downgrade(stream) }
    }

    pub fn store(&self) -> Result<Arc<Store>> {
        self.store
            .upgrade()
            .ok_or_else(|| SimutraceError::InvalidOperation("store is shutting down".into()))
    }

    pub fn stream(&self) -> Result<Arc<Stream>> {
        self.stream
            .upgrade()
            .ok_or_else(|| SimutraceError::InvalidOperation("stream is gone".into()))
    }
}

/// Runs on a worker thread: encode, commit, complete.
pub(crate) fn writer_main(stream: Arc<Stream>, segment: SegmentId) {
    let control = stream.buffer().control_snapshot(segment);
    let sqn = control.link.sequence_number;

    let result = (|| -> Result<StorageLocation> {
        let store = stream.store()?;
        let mut frame = stream.encoder().encode_frame(segment, sqn)?;
        let offset = store.container().commit_frame(&mut frame)?;
        Ok(storage_location_from_frame(frame.header(), offset))
    })();

    match result {
        Ok(location) => stream.complete_store(sqn, Some(location)),
        Err(e) => {
            error!(
                encoder = stream.encoder().friendly_name(),
                stream = stream.id(),
                sqn,
                segment,
                error = %e,
                "Encoding failed; the data will be discarded"
            );
            stream.complete_store(sqn, None);
        }
    }
}

/// Runs on a worker thread: decode and complete.
pub(crate) fn reader_main(stream: Arc<Stream>, segment: SegmentId, location: StorageLocation) {
    let sqn = location.link.sequence_number;
    match stream.encoder().decode_segment(&location, segment, sqn) {
        Ok(()) => stream.complete_load(sqn, true),
        Err(e) => {
            error!(
                encoder = stream.encoder().friendly_name(),
                stream = stream.id(),
                sqn,
                segment,
                error = %e,
                "Decoding failed"
            );
            stream.complete_load(sqn, false);
        }
    }
}

/// Queues an encode job. Hidden streams run at high priority: they are the
/// backbone of composite encoders and must not starve behind client work.
pub(crate) fn submit_write_job(ctx: &EncoderContext, segment: SegmentId) -> Result<(bool, Option<StorageLocation>)> {
    let stream = ctx.stream()?;
    let store = ctx.store()?;

    let priority = if stream.descriptor().hidden { Priority::High } else { Priority::Normal };
    store.worker_pool().submit(priority, move || writer_main(stream, segment));
    Ok((false, None))
}

/// Runs or queues a decode depending on the synchronous flag.
pub(crate) fn submit_read_job(
    ctx: &EncoderContext,
    encoder: &dyn StreamEncoder,
    segment: SegmentId,
    flags: StreamAccessFlags,
    location: &StorageLocation,
    prefetch: bool,
) -> Result<bool> {
    if flags.contains(StreamAccessFlags::SYNCHRONOUS) {
        encoder.decode_segment(location, segment, location.link.sequence_number)?;
        return Ok(true);
    }

    let stream = ctx.stream()?;
    let store = ctx.store()?;
    let priority = if stream.descriptor().hidden {
        Priority::High
    } else if prefetch {
        Priority::Low
    } else {
        Priority::Normal
    };

    let location = location.clone();
    store
        .worker_pool()
        .submit(priority, move || reader_main(stream, segment, location));
    Ok(false)
}

// ───────────────────────── scratch segments ──────────────────────────────────

/// Temporary segment-sized buffer, taken from the server pool when
/// possible and falling back to private heap memory under pressure.
pub(crate) struct ScratchSegment {
    pool: Option<(Arc<BufferPool>, SegmentId)>,
    fallback: Option<Vec<u8>>,
}

impl ScratchSegment {
    pub fn new(pool: &Arc<BufferPool>) -> ScratchSegment {
        match pool.request_scratch_segment() {
            Some(id) => ScratchSegment { pool: Some((pool.clone(), id)), fallback: None },
            None => {
                warn!("Falling back to private scratch memory");
                ScratchSegment { pool: None, fallback: Some(vec![0u8; SEGMENT_SIZE]) }
            }
        }
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        match (&self.pool, &mut self.fallback) {
            (Some((pool, id)), _) => pool.segment_mut(*id),
            (None, Some(fallback)) => fallback.as_mut_slice(),
            (None, None) => &mut [],
        }
    }
}

impl Drop for ScratchSegment {
    fn drop(&mut self) {
        if let Some((pool, id)) = self.pool.take() {
            if id != INVALID_SEGMENT_ID {
                let _ = pool.purge_segment(id);
            }
        }
    }
}

// ───────────────────────── generic encoder ───────────────────────────────────

/// Default encoder: the whole segment payload becomes one zstd-compressed
/// data attribute.
pub struct GenericEncoder {
    ctx: EncoderContext,
}

impl GenericEncoder {
    pub fn factory(store: &Arc<Store>, stream: &Arc<Stream>) -> Result<Box<dyn StreamEncoder>> {
        Ok(Box::new(GenericEncoder { ctx: EncoderContext::new(store, stream) }))
    }
}

impl StreamEncoder for GenericEncoder {
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
        submit_write_job(&self.ctx, segment)
    }

    fn encode_frame(&self, segment: SegmentId, _sqn: StreamSegmentId) -> Result<Frame> {
        let stream = self.ctx.stream()?;
        let store = self.ctx.store()?;
        let pool = stream.buffer();

        let control = pool.control_snapshot(segment);
        let entry_size =
            crate::types::effective_entry_size(stream.descriptor().type_desc.entry_size);
        let source_len = entry_size * control.raw_entry_count as usize;
        let source = &pool.segment(segment)[..source_len];

        let mut frame =
            Frame::new(stream.id(), stream.descriptor().type_desc.id, Some(&control));

        // Compress into a scratch segment; incompressible payloads that
        // exceed it take the slower heap path.
        let mut scratch = ScratchSegment::new(store.server_pool());
        let mut compressor = zstd::bulk::Compressor::new(DEFAULT_COMPRESSION_LEVEL)
            .map_err(SimutraceError::Io)?;

        let data = match compressor.compress_to_buffer(source, scratch.buffer_mut()) {
            Ok(written) => Bytes::copy_from_slice(&scratch.buffer_mut()[..written]),
            Err(_) => Bytes::from(compressor.compress(source).map_err(SimutraceError::Io)?),
        };

        frame.add_compressed_attribute(
            crate::simtrace::format::SAT_DATA,
            source_len as u64,
            data,
        )?;
        Ok(frame)
    }

    fn decode_segment(
        &self,
        location: &StorageLocation,
        segment: SegmentId,
        _sqn: StreamSegmentId,
    ) -> Result<()> {
        let stream = self.ctx.stream()?;
        let store = self.ctx.store()?;
        let pool = stream.buffer();

        let frame = store.container().read_frame(location)?;
        let data = frame
            .find_attribute(crate::simtrace::format::SAT_DATA)
            .ok_or_else(|| SimutraceError::Corruption("frame has no data attribute".into()))?;

        let uncompressed = data.header.uncompressed_size as usize;
        if uncompressed > SEGMENT_SIZE {
            return Err(SimutraceError::NotSupported(format!(
                "the segment size used to create the trace ({uncompressed} bytes) exceeds \
                 the current maximum segment size ({SEGMENT_SIZE} bytes)"
            )));
        }

        let target = &mut pool.segment_mut(segment)[..uncompressed];
        let mut decompressor = zstd::bulk::Decompressor::new().map_err(SimutraceError::Io)?;
        let written = decompressor
            .decompress_to_buffer(&data.data, target)
            .map_err(SimutraceError::Io)?;

        if written != uncompressed {
            warn!(
                stream = location.link.stream,
                sqn = location.link.sequence_number,
                expected = uncompressed,
                actual = written,
                "Size mismatch after decompression"
            );
        }
        Ok(())
    }

    fn friendly_name(&self) -> &str {
        "simtrace3 zstd encoder"
    }
}
