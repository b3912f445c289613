// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Core identifier, descriptor and range types shared by the buffer pool,
//! the stream directory and the container format.
//!
//! Identifiers are plain 32-bit integers with an all-ones sentinel. The
//! append path relies on the sentinel wrapping to 0 on increment, so the
//! sentinels must stay at `u32::MAX`.

use bitflags::bitflags;

// ─────────────────────────────── identifiers ─────────────────────────────────

pub type StoreId = u32;
pub type StreamId = u32;
pub type BufferId = u32;
pub type SegmentId = u32;
pub type StreamSegmentId = u32;
pub type SessionId = u32;

pub const INVALID_STORE_ID: StoreId = u32::MAX;
pub const INVALID_STREAM_ID: StreamId = u32::MAX;
pub const INVALID_BUFFER_ID: BufferId = u32::MAX;
pub const INVALID_SEGMENT_ID: SegmentId = u32::MAX;
pub const INVALID_STREAM_SEGMENT_ID: StreamSegmentId = u32::MAX;
pub const INVALID_SESSION_ID: SessionId = u32::MAX;

/// Session id used by the server itself (encoders operating on hidden
/// streams, store rundown).
pub const SERVER_SESSION_ID: SessionId = u32::MAX - 1;

/// Buffer id addressing the server-private memory pool instead of a
/// client-visible stream buffer of the store.
pub const SERVER_BUFFER_ID: BufferId = u32::MAX - 1;

// ───────────────────────────── time and cycles ───────────────────────────────

/// Wall-clock timestamp in microseconds since the Unix epoch.
pub type Timestamp = u64;
pub type CycleCount = u64;

pub const INVALID_TIME_STAMP: Timestamp = u64::MAX;
pub const INVALID_CYCLE_COUNT: CycleCount = u64::MAX;
pub const INVALID_ENTRY_INDEX: u64 = u64::MAX;
pub const INVALID_LARGE_OBJECT_ID: u64 = u64::MAX;

/// Cycle counts in temporally ordered entries occupy the low 48 bits of the
/// leading metadata quad word.
pub const TEMPORAL_ORDER_CYCLE_COUNT_BITS: u32 = 48;
pub const TEMPORAL_ORDER_CYCLE_COUNT_MASK: u64 = (1u64 << TEMPORAL_ORDER_CYCLE_COUNT_BITS) - 1;

pub fn now_timestamp() -> Timestamp {
    chrono::Utc::now().timestamp_micros() as Timestamp
}

// ─────────────────────────────── constants ───────────────────────────────────

/// Size of one stream buffer segment. Fixed at compile time; the container
/// records the uncompressed size per frame so stores written with a
/// different build constant are rejected on decode.
pub const SEGMENT_SIZE: usize = 64 * 1024 * 1024;

pub const MAX_STREAM_NAME_LENGTH: usize = 256;

/// Entry sizes with the MSB set denote variable-sized entries; the low bits
/// carry a size hint only. Variable streams account raw entries in bytes.
pub const VARIABLE_ENTRY_SIZE_FLAG: u32 = 1 << 31;

pub fn make_variable_entry_size(size_hint: u32) -> u32 {
    size_hint | VARIABLE_ENTRY_SIZE_FLAG
}

pub fn is_variable_entry_size(entry_size: u32) -> bool {
    (entry_size & VARIABLE_ENTRY_SIZE_FLAG) != 0
}

/// Bytes occupied by one raw entry in the segment buffer. Variable-sized
/// streams store raw bytes, so their effective element size is 1.
pub fn effective_entry_size(entry_size: u32) -> usize {
    if is_variable_entry_size(entry_size) {
        1
    } else {
        entry_size as usize
    }
}

// ─────────────────────────────── type guids ──────────────────────────────────

/// Stream type identifier. Stored little-endian field-wise on disk, in the
/// classic `(u32, u16, u16, [u8; 8])` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TypeGuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl TypeGuid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        TypeGuid { data1, data2, data3, data4 }
    }

    /// The all-zero GUID selects the default (generic compression) encoder.
    pub const ZERO: TypeGuid = TypeGuid::new(0, 0, 0, [0; 8]);

    pub fn is_zero(&self) -> bool {
        *self == TypeGuid::ZERO
    }
}

impl std::fmt::Display for TypeGuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1], self.data4[2],
            self.data4[3], self.data4[4], self.data4[5], self.data4[6], self.data4[7]
        )
    }
}

// ─────────────────────────────── links ───────────────────────────────────────

/// Identifies one segment of one stream. Embedded in the shared-memory
/// control element, hence the fixed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct StreamSegmentLink {
    pub stream: StreamId,
    pub sequence_number: StreamSegmentId,
}

impl StreamSegmentLink {
    pub fn new(stream: StreamId, sequence_number: StreamSegmentId) -> Self {
        StreamSegmentLink { stream, sequence_number }
    }
}

/// Segment link qualified by store; key of the standby cache index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreStreamSegmentLink {
    pub store: StoreId,
    pub stream: StreamId,
    pub sequence_number: StreamSegmentId,
}

impl StoreStreamSegmentLink {
    pub fn new(store: StoreId, link: StreamSegmentLink) -> Self {
        StoreStreamSegmentLink {
            store,
            stream: link.stream,
            sequence_number: link.sequence_number,
        }
    }
}

// ─────────────────────────────── queries ─────────────────────────────────────

/// Index kinds a reader may open a stream by. The first three are backed by
/// range trees; the rest resolve directly against the segment directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QueryIndexType {
    CycleCount = 0,
    RealTime = 1,
    Index = 2,

    SequenceNumber = 3,
    NextValidSequenceNumber = 4,
    PreviousValidSequenceNumber = 5,
}

/// Number of tree-backed index kinds (`CycleCount`, `RealTime`, `Index`).
pub const QUERY_TREE_COUNT: usize = 3;

impl QueryIndexType {
    pub fn tree_index(&self) -> Option<usize> {
        let v = *self as u32 as usize;
        if v < QUERY_TREE_COUNT {
            Some(v)
        } else {
            None
        }
    }
}

bitflags! {
    /// Access hints a reader passes to `open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamAccessFlags: u32 {
        /// Complete the read on the calling thread.
        const SYNCHRONOUS = 1 << 0;
        /// Random probes; keep the cache clean of this data.
        const RANDOM_ACCESS = 1 << 1;
        /// Forward scan; triggers read-ahead, data is not revisited.
        const SEQUENTIAL_SCAN = 1 << 2;
    }
}

bitflags! {
    /// Static properties of a stream's entry type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamTypeFlags: u32 {
        /// Entries start with a 48-bit cycle count and are cycle-ordered.
        const TEMPORAL_ORDER = 1 << 0;
        /// 32-bit architecture layout.
        const ARCH32_BIT = 1 << 1;
        /// Byte-swapped entries. Not supported by any built-in encoder.
        const BIG_ENDIAN = 1 << 2;
    }
}

// ─────────────────────────────── descriptors ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTypeDescriptor {
    pub id: TypeGuid,
    pub flags: StreamTypeFlags,
    pub entry_size: u32,
}

impl StreamTypeDescriptor {
    pub fn temporal_order(&self) -> bool {
        self.flags.contains(StreamTypeFlags::TEMPORAL_ORDER)
    }

    pub fn arch32_bit(&self) -> bool {
        self.flags.contains(StreamTypeFlags::ARCH32_BIT)
    }

    pub fn big_endian(&self) -> bool {
        self.flags.contains(StreamTypeFlags::BIG_ENDIAN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub name: String,
    pub hidden: bool,
    pub type_desc: StreamTypeDescriptor,
}

impl StreamDescriptor {
    /// Plain data stream with the default encoder.
    pub fn new(name: &str, entry_size: u32, temporal_order: bool) -> Self {
        let mut flags = StreamTypeFlags::empty();
        if temporal_order {
            flags |= StreamTypeFlags::TEMPORAL_ORDER;
        }
        StreamDescriptor {
            name: name.to_string(),
            hidden: false,
            type_desc: StreamTypeDescriptor { id: TypeGuid::ZERO, flags, entry_size },
        }
    }

    pub fn with_type(name: &str, type_desc: StreamTypeDescriptor) -> Self {
        StreamDescriptor { name: name.to_string(), hidden: false, type_desc }
    }
}

// ─────────────────────────────── ranges ──────────────────────────────────────

/// Closed interval over one index dimension. Both endpoints equal to
/// `INVALID_LARGE_OBJECT_ID` means the dimension is absent for the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub const INVALID: Range = Range { start: INVALID_LARGE_OBJECT_ID, end: INVALID_LARGE_OBJECT_ID };

    pub fn is_valid(&self) -> bool {
        self.start != INVALID_LARGE_OBJECT_ID && self.end != INVALID_LARGE_OBJECT_ID
    }
}

/// The per-segment index ranges, ordered as the tree-backed
/// `QueryIndexType` values: cycle, wall time, entry index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageRanges {
    pub ranges: [Range; QUERY_TREE_COUNT],
}

impl StorageRanges {
    pub const INVALID: StorageRanges = StorageRanges { ranges: [Range::INVALID; QUERY_TREE_COUNT] };

    pub fn start_cycle(&self) -> CycleCount {
        self.ranges[QueryIndexType::CycleCount as usize].start
    }

    pub fn end_cycle(&self) -> CycleCount {
        self.ranges[QueryIndexType::CycleCount as usize].end
    }

    pub fn start_time(&self) -> Timestamp {
        self.ranges[QueryIndexType::RealTime as usize].start
    }

    pub fn end_time(&self) -> Timestamp {
        self.ranges[QueryIndexType::RealTime as usize].end
    }

    pub fn start_index(&self) -> u64 {
        self.ranges[QueryIndexType::Index as usize].start
    }

    pub fn end_index(&self) -> u64 {
        self.ranges[QueryIndexType::Index as usize].end
    }
}

// ───────────────────────────── control element ───────────────────────────────

/// Per-segment control data, shared with the writing client. The server
/// treats the whole structure as untrusted until the cookie validates on
/// submit. The cookie must stay the first field: the read-only hash covers
/// everything after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SegmentControlElement {
    pub cookie: u64,
    pub link: StreamSegmentLink,

    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub start_cycle: CycleCount,
    pub end_cycle: CycleCount,

    pub start_index: u64,
    pub entry_count: u32,
    pub raw_entry_count: u32,
}

impl SegmentControlElement {
    pub fn zeroed() -> Self {
        SegmentControlElement {
            cookie: 0,
            link: StreamSegmentLink::new(0, 0),
            start_time: 0,
            end_time: 0,
            start_cycle: 0,
            end_cycle: 0,
            start_index: 0,
            entry_count: 0,
            raw_entry_count: 0,
        }
    }

    /// Serialises every field after the cookie; input of the read-only
    /// cookie hash.
    pub fn body_bytes(&self) -> [u8; 56] {
        let mut out = [0u8; 56];
        out[0..4].copy_from_slice(&self.link.stream.to_le_bytes());
        out[4..8].copy_from_slice(&self.link.sequence_number.to_le_bytes());
        out[8..16].copy_from_slice(&self.start_time.to_le_bytes());
        out[16..24].copy_from_slice(&self.end_time.to_le_bytes());
        out[24..32].copy_from_slice(&self.start_cycle.to_le_bytes());
        out[32..40].copy_from_slice(&self.end_cycle.to_le_bytes());
        out[40..48].copy_from_slice(&self.start_index.to_le_bytes());
        out[48..52].copy_from_slice(&self.entry_count.to_le_bytes());
        out[52..56].copy_from_slice(&self.raw_entry_count.to_le_bytes());
        out
    }
}

// ───────────────────────────── storage location ──────────────────────────────

/// Persisted descriptor of one segment: where its frame lives in the
/// container and which index ranges it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    pub link: StreamSegmentLink,
    pub ranges: StorageRanges,
    pub raw_entry_count: u32,
    pub compressed_size: u64,

    /// Absolute file offset of the frame header.
    pub offset: u64,
    /// Total frame size (header + attributes) in the file.
    pub size: u64,
}

impl StorageLocation {
    pub fn entry_count(&self) -> u32 {
        let idx = &self.ranges.ranges[QueryIndexType::Index as usize];
        if !idx.is_valid() {
            return 0;
        }
        (idx.end - idx.start + 1) as u32
    }
}

// ─────────────────────────────── statistics ──────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct StreamStatistics {
    pub entry_count: u64,
    pub raw_entry_count: u64,
    pub compressed_size: u64,
    pub ranges: StorageRanges,
}

impl Default for StreamStatistics {
    fn default() -> Self {
        StreamStatistics {
            entry_count: 0,
            raw_entry_count: 0,
            compressed_size: 0,
            ranges: StorageRanges::INVALID,
        }
    }
}

/// Full answer to a stream information query.
#[derive(Debug, Clone)]
pub struct StreamQueryInformation {
    pub descriptor: StreamDescriptor,
    pub stats: StreamStatistics,
}

// ─────────────────────────────── id allocation ───────────────────────────────

/// Dense id allocator with reuse of retired ids. Ids handed out never
/// collide with ids stolen for streams recovered from a store file.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u32,
    retired: Vec<u32>,
}

impl IdAllocator {
    pub fn new() -> Self {
        IdAllocator::default()
    }

    pub fn next_id(&mut self) -> u32 {
        if let Some(id) = self.retired.pop() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    /// Reserves a specific id, e.g. when replaying streams from a store.
    pub fn steal_id(&mut self, id: u32) {
        if id >= self.next {
            for free in self.next..id {
                self.retired.push(free);
            }
            self.next = id + 1;
        } else {
            self.retired.retain(|&r| r != id);
        }
    }

    pub fn retire_id(&mut self, id: u32) {
        self.retired.push(id);
    }
}
