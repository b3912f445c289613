// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! A store: the container file, the arena of streams inside it, the
//! encoder registry and the session reference counting that drives store
//! teardown.
//!
//! The store owns every `Stream`; everything else refers to streams by id
//! or through weak references, so dropping the store tears the object
//! graph down without cycles.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::entries::MEMORY_TYPE_TABLE;
use crate::error::{Result, SimutraceError};
use crate::simtrace::container::Simtrace3File;
use crate::simtrace::encoder::{EncoderFactory, GenericEncoder};
use crate::simtrace::format::{
    parse_stream_descriptor, serialize_stream_descriptor, SAT_STREAM_DESCRIPTION,
};
use crate::simtrace::frame::{storage_location_from_frame, Frame};
use crate::simtrace::memory::MemoryEncoder;
use crate::storage::buffer::BufferPool;
use crate::storage::stream::Stream;
use crate::types::{
    BufferId, IdAllocator, SessionId, StoreId, StreamDescriptor, StreamId, TypeGuid,
    INVALID_STREAM_SEGMENT_ID, MAX_STREAM_NAME_LENGTH, SERVER_BUFFER_ID,
};
use crate::worker::{StreamWait, WorkerPool};

struct StreamTable {
    by_id: BTreeMap<StreamId, Arc<Stream>>,
    allocator: IdAllocator,
}

struct RefState {
    sessions: Vec<SessionId>,
    count: u32,
}

pub struct Store {
    id: StoreId,
    name: String,
    container: Arc<Simtrace3File>,
    server_pool: Arc<BufferPool>,
    worker_pool: Arc<WorkerPool>,

    buffers: RwLock<Vec<Arc<BufferPool>>>,
    streams: RwLock<StreamTable>,
    encoder_map: HashMap<TypeGuid, EncoderFactory>,
    references: Mutex<RefState>,

    read_ahead: u32,
    close_timeout: Duration,
    log_stream_stats: bool,
    loading: std::sync::atomic::AtomicBool,
}

fn builtin_encoder_map() -> HashMap<TypeGuid, EncoderFactory> {
    let mut map: HashMap<TypeGuid, EncoderFactory> = HashMap::new();

    // The all-zero GUID is the default: generic compression for any type
    // without a specialised codec.
    map.insert(TypeGuid::ZERO, GenericEncoder::factory);

    for mstype in MEMORY_TYPE_TABLE.iter() {
        let factory: EncoderFactory = match (mstype.arch32_bit, mstype.with_data) {
            (true, false) => MemoryEncoder::<crate::entries::MemoryAccess32>::factory,
            (false, false) => MemoryEncoder::<crate::entries::MemoryAccess64>::factory,
            (true, true) => MemoryEncoder::<crate::entries::DataMemoryAccess32>::factory,
            (false, true) => MemoryEncoder::<crate::entries::DataMemoryAccess64>::factory,
        };
        map.insert(mstype.id, factory);
    }
    map
}

impl Store {
    fn build(
        id: StoreId,
        name: String,
        container: Simtrace3File,
        config: &Config,
        worker_pool: Arc<WorkerPool>,
        server_pool: Arc<BufferPool>,
    ) -> Result<Arc<Store>> {
        // Every store carries one client-visible buffer pool that clients
        // map; additional pools can be registered per session request.
        let client_pool = BufferPool::new(
            0,
            config.client_pool_segments(),
            !config.server.memmgmt.disable_cache,
            config.server.memmgmt.retry_count,
            Duration::from_millis(config.server.memmgmt.retry_sleep_ms),
        )?;

        Ok(Arc::new(Store {
            id,
            name,
            container: Arc::new(container),
            server_pool,
            worker_pool,
            buffers: RwLock::new(vec![client_pool]),
            streams: RwLock::new(StreamTable { by_id: BTreeMap::new(), allocator: IdAllocator::new() }),
            encoder_map: builtin_encoder_map(),
            references: Mutex::new(RefState { sessions: Vec::new(), count: 1 }),
            read_ahead: config.server.memmgmt.read_ahead,
            close_timeout: Duration::from_millis(config.server.session.close_timeout_ms),
            log_stream_stats: config.store.simtrace.log_stream_stats,
            loading: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    pub(crate) fn create(
        id: StoreId,
        name: String,
        path: &Path,
        config: &Config,
        worker_pool: Arc<WorkerPool>,
        server_pool: Arc<BufferPool>,
    ) -> Result<Arc<Store>> {
        let container = Simtrace3File::create(path)?;
        Store::build(id, name, container, config, worker_pool, server_pool)
    }

    pub(crate) fn open(
        id: StoreId,
        name: String,
        path: &Path,
        config: &Config,
        worker_pool: Arc<WorkerPool>,
        server_pool: Arc<BufferPool>,
    ) -> Result<Arc<Store>> {
        let container = Simtrace3File::open(path)?;
        let store = Store::build(id, name, container, config, worker_pool, server_pool)?;
        store.load()?;
        Ok(store)
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container(&self) -> &Arc<Simtrace3File> {
        &self.container
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.worker_pool
    }

    pub fn server_pool(&self) -> &Arc<BufferPool> {
        &self.server_pool
    }

    pub fn is_read_only(&self) -> bool {
        self.container.is_read_mode()
    }

    /// Stops all further commits, e.g. after detected corruption.
    pub fn force_read_only(&self) {
        warn!(store = %self.name, "Store forced into read-only mode");
        self.container.set_read_mode();
    }

    // ───────────────────────── buffers ──────────────────────────────────

    pub fn buffer(&self, id: BufferId) -> Result<Arc<BufferPool>> {
        if id == SERVER_BUFFER_ID {
            return Ok(self.server_pool.clone());
        }
        self.buffers
            .read()
            .get(id as usize)
            .cloned()
            .ok_or_else(|| SimutraceError::NotFound(format!("stream buffer {id}")))
    }

    /// Registers an additional client buffer pool sized like the first.
    pub fn register_buffer(&self, num_segments: u32, config: &Config) -> Result<BufferId> {
        let mut buffers = self.buffers.write();
        let id = buffers.len() as BufferId;
        let pool = BufferPool::new(
            id,
            num_segments,
            !config.server.memmgmt.disable_cache,
            config.server.memmgmt.retry_count,
            Duration::from_millis(config.server.memmgmt.retry_sleep_ms),
        )?;
        buffers.push(pool);
        Ok(id)
    }

    pub fn enumerate_buffers(&self) -> Vec<Arc<BufferPool>> {
        self.buffers.read().clone()
    }

    // ───────────────────────── streams ──────────────────────────────────

    fn encoder_factory(&self, type_id: &TypeGuid) -> Result<EncoderFactory> {
        if let Some(factory) = self.encoder_map.get(type_id) {
            return Ok(*factory);
        }
        self.encoder_map
            .get(&TypeGuid::ZERO)
            .copied()
            .ok_or_else(|| SimutraceError::NotFound(format!("encoder for type {type_id}")))
    }

    fn create_stream_object(
        self: &Arc<Self>,
        id: StreamId,
        descriptor: StreamDescriptor,
        buffer: BufferId,
    ) -> Result<Arc<Stream>> {
        if descriptor.name.is_empty() || descriptor.name.len() >= MAX_STREAM_NAME_LENGTH {
            return Err(SimutraceError::Argument(
                "descriptor".into(),
                format!("stream name must be 1..{MAX_STREAM_NAME_LENGTH} bytes"),
            ));
        }
        if descriptor.type_desc.big_endian() {
            return Err(SimutraceError::NotSupported("byte-swapped streams".into()));
        }

        let pool = if descriptor.hidden {
            self.server_pool.clone()
        } else {
            self.buffer(buffer)?
        };

        let factory = self.encoder_factory(&descriptor.type_desc.id)?;
        let stream = Stream::new(self, id, descriptor, pool, self.read_ahead);
        let encoder = factory(self, &stream)?;
        stream.install_encoder(encoder);
        Ok(stream)
    }

    /// Registers a new stream and persists its zero frame.
    pub fn register_stream(
        self: &Arc<Self>,
        descriptor: StreamDescriptor,
        buffer: BufferId,
    ) -> Result<StreamId> {
        let loading = self.loading.load(std::sync::atomic::Ordering::Relaxed);
        if self.is_read_only() && !loading {
            return Err(SimutraceError::InvalidOperation(format!(
                "store {} is read-only; streams cannot be registered",
                self.name
            )));
        }

        let id = {
            let mut table = self.streams.write();
            table.allocator.next_id()
        };

        let stream = match self.create_stream_object(id, descriptor, buffer) {
            Ok(stream) => stream,
            Err(e) => {
                self.streams.write().allocator.retire_id(id);
                return Err(e);
            }
        };

        // Frame 0 carries the stream description plus anything the
        // encoder needs to restore itself on a reopen.
        let mut frame =
            Frame::new(id, stream.descriptor().type_desc.id, None);
        frame.add_attribute(
            SAT_STREAM_DESCRIPTION,
            bytes::Bytes::from(serialize_stream_descriptor(stream.descriptor())),
        )?;
        stream.encoder().initialize(&frame, false)?;
        self.container.commit_frame(&mut frame)?;

        self.streams.write().by_id.insert(id, stream);
        Ok(id)
    }

    /// Rebuilds a stream from its zero frame while loading the store.
    fn recover_stream(
        self: &Arc<Self>,
        id: StreamId,
        descriptor: StreamDescriptor,
    ) -> Result<Arc<Stream>> {
        let buffer = if descriptor.hidden { SERVER_BUFFER_ID } else { 0 };
        let stream = self.create_stream_object(id, descriptor, buffer)?;

        let mut table = self.streams.write();
        table.allocator.steal_id(id);
        table.by_id.insert(id, stream.clone());
        Ok(stream)
    }

    pub fn find_stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.streams.read().by_id.get(&id).cloned()
    }

    pub fn get_stream(&self, id: StreamId) -> Result<Arc<Stream>> {
        self.find_stream(id)
            .ok_or_else(|| SimutraceError::NotFound(format!("stream {id}")))
    }

    pub fn enumerate_streams(&self, include_hidden: bool) -> Vec<Arc<Stream>> {
        self.streams
            .read()
            .by_id
            .values()
            .filter(|s| include_hidden || !s.descriptor().hidden)
            .cloned()
            .collect()
    }

    // ───────────────────────── loading ──────────────────────────────────

    /// Replays the directory chain: zero frames rebuild streams and feed
    /// the encoders, data frames become storage locations.
    fn load(self: &Arc<Self>) -> Result<()> {
        self.loading.store(true, std::sync::atomic::Ordering::Relaxed);

        let result = self.container.for_each_frame(|header, offset| {
            if header.sequence_number == INVALID_STREAM_SEGMENT_ID {
                let frame = self.container.read_frame_at(offset, header.total_size)?;

                let stream = match self.find_stream(header.stream_id) {
                    Some(stream) => stream,
                    None => {
                        let attribute =
                            frame.find_attribute(SAT_STREAM_DESCRIPTION).ok_or_else(|| {
                                SimutraceError::Corruption(
                                    "zero frame without stream description".into(),
                                )
                            })?;
                        let descriptor = parse_stream_descriptor(&attribute.data)?;
                        self.recover_stream(header.stream_id, descriptor)?
                    }
                };

                stream.encoder().initialize(&frame, true)
            } else {
                let stream = self.get_stream(header.stream_id)?;
                let location = storage_location_from_frame(&header, offset);
                stream.add_persisted_segment(header.sequence_number, location)
            }
        });

        self.loading.store(false, std::sync::atomic::Ordering::Relaxed);
        result?;

        info!(
            store = %self.name,
            streams = self.streams.read().by_id.len(),
            "Store loaded"
        );
        Ok(())
    }

    // ───────────────────────── references ───────────────────────────────

    pub fn attach(&self, session: SessionId) -> Result<()> {
        let mut refs = self.references.lock();
        if refs.sessions.contains(&session) {
            return Err(SimutraceError::InvalidOperation(format!(
                "session {session} already holds a reference to store {}",
                self.name
            )));
        }
        if refs.count == 0 {
            return Err(SimutraceError::OperationInProgress {
                stream: crate::types::INVALID_STREAM_ID,
                sequence_number: INVALID_STREAM_SEGMENT_ID,
            });
        }
        refs.sessions.push(session);
        refs.count += 1;
        Ok(())
    }

    /// Releases a session's reference, running the session's segment
    /// rundown. The provider reference falls with the last session; the
    /// store is fully closed when this returns `true`.
    pub fn detach(self: &Arc<Self>, session: SessionId) -> Result<bool> {
        let mut refs = self.references.lock();
        if refs.count == 0 {
            return Err(SimutraceError::InvalidOperation(format!(
                "store {} is already closed",
                self.name
            )));
        }

        if refs.count > 1 {
            if !refs.sessions.contains(&session) {
                return Err(SimutraceError::InvalidOperation(format!(
                    "session {session} holds no reference to store {}",
                    self.name
                )));
            }

            // The client leaves shared-memory segment finalisation to the
            // server: submit pending writes, release reads.
            let wait = Arc::new(StreamWait::new());
            for stream in self.enumerate_streams(false) {
                if let Err(e) = stream.close_session(session, Some(&wait), true) {
                    error!(
                        store = %self.name,
                        stream = stream.id(),
                        error = %e,
                        "Session rundown failed for stream"
                    );
                }
            }

            info!(
                store = %self.name,
                session,
                pending = wait.count(),
                "Session rundown"
            );

            if wait.wait_timeout(self.close_timeout).is_none() {
                warn!(
                    store = %self.name,
                    session,
                    "Session rundown timed out; forcing store read-only"
                );
                self.force_read_only();
            }

            refs.sessions.retain(|&s| s != session);
            refs.count -= 1;
        }

        if refs.count == 1 {
            debug_assert!(refs.sessions.is_empty());

            // The provider holds the last reference. Encoders own the
            // remaining server-session segments (hidden streams); they
            // close them in the order only they know.
            let wait = Arc::new(StreamWait::new());
            for stream in self.enumerate_streams(true) {
                if let Err(e) = stream.encoder().close(&wait) {
                    error!(
                        store = %self.name,
                        stream = stream.id(),
                        error = %e,
                        "Encoder close failed"
                    );
                }
            }

            info!(store = %self.name, pending = wait.count(), "Store rundown");

            if wait.wait_timeout(self.close_timeout).is_none() {
                warn!(
                    store = %self.name,
                    "Store rundown timed out; forcing store read-only"
                );
                self.force_read_only();
            }

            refs.count = 0;
            drop(refs);

            self.finalize()?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Flushes caches, finalises the container header and logs the store
    /// statistics.
    fn finalize(&self) -> Result<()> {
        for pool in self.enumerate_buffers() {
            pool.flush_standby(Some(self.id));
        }
        self.server_pool.flush_standby(Some(self.id));

        self.container.finalize()?;
        self.log_store_stats();
        Ok(())
    }

    // ───────────────────────── statistics ───────────────────────────────

    fn format_time(timestamp: u64) -> String {
        match chrono::DateTime::from_timestamp_micros(timestamp as i64) {
            Some(time) => time.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            None => "-".to_string(),
        }
    }

    fn size_string(bytes: u64) -> String {
        if bytes >= 1_073_741_824 {
            format!("{:.2} GiB", bytes as f64 / 1_073_741_824.0)
        } else if bytes >= 1_048_576 {
            format!("{:.2} MiB", bytes as f64 / 1_048_576.0)
        } else if bytes >= 1024 {
            format!("{:.2} KiB", bytes as f64 / 1024.0)
        } else {
            format!("{bytes} B")
        }
    }

    fn log_store_stats(&self) {
        use std::fmt::Write as _;

        let header = self.container.header();
        let streams = self.enumerate_streams(false);

        let mut summary = String::new();
        let _ = write!(
            summary,
            "<store: {}>\n Streams: {}\n Entries: {} (raw: {})\n Size: {}",
            self.name,
            streams.len(),
            header.entry_count,
            header.raw_entry_count,
            Self::size_string(header.file_size),
        );

        if header.raw_entry_count > 0 && header.uncompressed_file_size > 0 {
            let _ = write!(
                summary,
                " (uncomp.: {} ratio: {}%)",
                Self::size_string(header.uncompressed_file_size),
                (header.file_size * 100) / header.uncompressed_file_size
            );
        }

        if header.start_time != crate::types::INVALID_TIME_STAMP {
            let _ = write!(
                summary,
                "\n Wall Time (start: {} end: {})",
                Self::format_time(header.start_time),
                Self::format_time(header.end_time)
            );
        }
        if header.start_cycle != crate::types::INVALID_CYCLE_COUNT {
            let _ = write!(
                summary,
                "\n Cycle Time (start: {} end: {})",
                header.start_cycle, header.end_cycle
            );
        }

        if self.log_stream_stats && streams.len() > 1 {
            for stream in &streams {
                let info = stream.query_information();
                let usize_total = info.stats.raw_entry_count
                    * crate::types::effective_entry_size(info.descriptor.type_desc.entry_size) as u64;
                let _ = write!(
                    summary,
                    "\n---- Stream: {}\n Entries: {} (raw: {})\n Size: {} (uncomp.: {})",
                    stream.name(),
                    info.stats.entry_count,
                    info.stats.raw_entry_count,
                    Self::size_string(info.stats.compressed_size),
                    Self::size_string(usize_total),
                );
            }
        }

        info!("{summary}");
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Standby entries referencing this store must not outlive it.
        self.server_pool.flush_standby(Some(self.id));
    }
}
