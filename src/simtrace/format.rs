// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Simtrace v3 on-disk structures.
//!
//! Everything in this module is part of the compatibility contract: byte
//! offsets, sizes and magic values must not change. All integers are
//! little-endian.
//!
//! ## File layout
//!
//! ```text
//! [0 .. 4096)     master header (16 B) + v3 header (3744 B), rest reserved
//! [4096 .. )      frames and 128 KiB frame directories, freely interleaved
//! ```
//!
//! A frame directory holds 1024 entries of 128 bytes: a full frame header
//! plus the absolute file offset of the frame, or — in the last slot — a
//! link to the next directory. A zeroed entry terminates iteration.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Result, SimutraceError};
use crate::hashing::murmur3_32;
use crate::types::{
    CycleCount, StreamDescriptor, StreamId, StreamSegmentId, StreamTypeDescriptor,
    StreamTypeFlags, Timestamp, TypeGuid, MAX_STREAM_NAME_LENGTH,
};

// ─────────────────────────────── constants ───────────────────────────────────

pub const SIMTRACE_SIGNATURE: &[u8; 8] = b"Simtrace";
pub const SIMTRACE_VERSION3: u16 = 3;
pub const SIMTRACE_VERSION3_MINOR: u16 = 0;

/// Reserved space for master + v3 header at the start of the file.
pub const HEADER_RESERVED_SPACE: u64 = 0x1000;

pub const MASTER_HEADER_SIZE: usize = 16;
pub const V3_HEADER_OFFSET: usize = MASTER_HEADER_SIZE;
pub const V3_HEADER_SIZE: usize = 3744;
/// Bytes of the serialised v3 header covered by the checksum.
pub const V3_HEADER_CHECKSUM_DATA_SIZE: usize = 3736;

pub const DIRECTORY_TABLE_SIZE: usize = 448;
pub const ATTRIBUTE_TABLE_SIZE: usize = 8;

pub const FRAME_MARKER: &[u8; 4] = b"FRME";
pub const DIRECTORY_LINK_MARKER: &[u8; 4] = b"DLNK";
pub const ATTRIBUTE_MARKER: &[u8; 4] = b"ATTR";

pub const FRAME_HEADER_SIZE: usize = 120;
/// Bytes of the serialised frame header covered by the checksum.
pub const FRAME_HEADER_CHECKSUM_DATA_SIZE: usize = 116;
pub const FRAME_ATTRIBUTE_TABLE_SIZE: usize = 2;

pub const ATTRIBUTE_HEADER_SIZE: usize = 32;

pub const DIRECTORY_SIZE: usize = 1024;
pub const DIRECTORY_ENTRY_SIZE: usize = 128;
pub const DIRECTORY_DATA_SIZE: usize = DIRECTORY_SIZE * DIRECTORY_ENTRY_SIZE;

/// Serialised size of a stream descriptor attribute.
pub const STREAM_DESCRIPTOR_SIZE: usize = MAX_STREAM_NAME_LENGTH + 16 + 4 + 4;

// Built-in attribute types.
pub const SAT_DATA: u8 = 0x00;
pub const SAT_STREAM_DESCRIPTION: u8 = 0x01;
pub const SAT_ASSOCIATED_STREAMS: u8 = 0x02;
/// Encoders may use types from this value on.
pub const SAT_ENCODER_SPECIFIC: u8 = 0x20;
/// Set on the last attribute of a frame.
pub const SAT_FLAG_LAST: u8 = 0x80;

// ─────────────────────────────── guid io ─────────────────────────────────────

fn write_guid(out: &mut Vec<u8>, guid: &TypeGuid) {
    out.extend_from_slice(&guid.data1.to_le_bytes());
    out.extend_from_slice(&guid.data2.to_le_bytes());
    out.extend_from_slice(&guid.data3.to_le_bytes());
    out.extend_from_slice(&guid.data4);
}

fn read_guid(cursor: &mut Cursor<&[u8]>) -> Result<TypeGuid> {
    let data1 = cursor.read_u32::<LittleEndian>()?;
    let data2 = cursor.read_u16::<LittleEndian>()?;
    let data3 = cursor.read_u16::<LittleEndian>()?;
    let mut data4 = [0u8; 8];
    std::io::Read::read_exact(cursor, &mut data4)?;
    Ok(TypeGuid { data1, data2, data3, data4 })
}

// ─────────────────────────────── v3 header ───────────────────────────────────

/// Link to an attribute, packed as `type | reserved << 8 | offset << 16`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeLink {
    pub attr_type: u8,
    pub relative_offset: u64,
}

impl AttributeLink {
    fn to_u64(self) -> u64 {
        (self.attr_type as u64) | ((self.relative_offset & 0xFFFF_FFFF_FFFF) << 16)
    }

    fn from_u64(value: u64) -> Self {
        AttributeLink { attr_type: value as u8, relative_offset: value >> 16 }
    }
}

#[derive(Debug, Clone)]
pub struct V3Header {
    pub writer_version: u32,

    pub file_size: u64,
    pub uncompressed_file_size: u64,
    pub frame_count: u64,

    pub entry_count: u64,
    pub raw_entry_count: u64,

    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub start_cycle: CycleCount,
    pub end_cycle: CycleCount,

    pub directory_count: u32,
    pub directory_capacity: u16,
    pub attribute_count: u16,

    pub attributes: [AttributeLink; ATTRIBUTE_TABLE_SIZE],
    pub directories: [u64; DIRECTORY_TABLE_SIZE],

    pub checksum: u32,
    pub dirty: bool,
}

impl V3Header {
    pub fn new(writer_version: u32) -> Self {
        V3Header {
            writer_version,
            file_size: HEADER_RESERVED_SPACE,
            uncompressed_file_size: HEADER_RESERVED_SPACE,
            frame_count: 0,
            entry_count: 0,
            raw_entry_count: 0,
            start_time: crate::types::INVALID_TIME_STAMP,
            end_time: crate::types::INVALID_TIME_STAMP,
            start_cycle: crate::types::INVALID_CYCLE_COUNT,
            end_cycle: crate::types::INVALID_CYCLE_COUNT,
            directory_count: 0,
            directory_capacity: DIRECTORY_SIZE as u16,
            attribute_count: 0,
            attributes: [AttributeLink::default(); ATTRIBUTE_TABLE_SIZE],
            directories: [0u64; DIRECTORY_TABLE_SIZE],
            checksum: 0,
            dirty: true,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(V3_HEADER_SIZE);
        out.extend_from_slice(&self.writer_version.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.extend_from_slice(&self.uncompressed_file_size.to_le_bytes());
        out.extend_from_slice(&self.frame_count.to_le_bytes());
        out.extend_from_slice(&self.entry_count.to_le_bytes());
        out.extend_from_slice(&self.raw_entry_count.to_le_bytes());
        out.extend_from_slice(&self.start_time.to_le_bytes());
        out.extend_from_slice(&self.end_time.to_le_bytes());
        out.extend_from_slice(&self.start_cycle.to_le_bytes());
        out.extend_from_slice(&self.end_cycle.to_le_bytes());
        out.extend_from_slice(&self.directory_count.to_le_bytes());
        out.extend_from_slice(&self.directory_capacity.to_le_bytes());
        out.extend_from_slice(&self.attribute_count.to_le_bytes());
        for link in &self.attributes {
            out.extend_from_slice(&link.to_u64().to_le_bytes());
        }
        for offset in &self.directories {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        debug_assert_eq!(out.len(), V3_HEADER_CHECKSUM_DATA_SIZE);
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.push(if self.dirty { 0xFF } else { 0 });
        out.extend_from_slice(&[0u8; 3]);
        debug_assert_eq!(out.len(), V3_HEADER_SIZE);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < V3_HEADER_SIZE {
            return Err(SimutraceError::Corruption("truncated store header".into()));
        }
        let mut cursor = Cursor::new(data);
        let writer_version = cursor.read_u32::<LittleEndian>()?;
        let _reserved = cursor.read_u32::<LittleEndian>()?;
        let file_size = cursor.read_u64::<LittleEndian>()?;
        let uncompressed_file_size = cursor.read_u64::<LittleEndian>()?;
        let frame_count = cursor.read_u64::<LittleEndian>()?;
        let entry_count = cursor.read_u64::<LittleEndian>()?;
        let raw_entry_count = cursor.read_u64::<LittleEndian>()?;
        let start_time = cursor.read_u64::<LittleEndian>()?;
        let end_time = cursor.read_u64::<LittleEndian>()?;
        let start_cycle = cursor.read_u64::<LittleEndian>()?;
        let end_cycle = cursor.read_u64::<LittleEndian>()?;
        let directory_count = cursor.read_u32::<LittleEndian>()?;
        let directory_capacity = cursor.read_u16::<LittleEndian>()?;
        let attribute_count = cursor.read_u16::<LittleEndian>()?;

        let mut attributes = [AttributeLink::default(); ATTRIBUTE_TABLE_SIZE];
        for link in attributes.iter_mut() {
            *link = AttributeLink::from_u64(cursor.read_u64::<LittleEndian>()?);
        }
        let mut directories = [0u64; DIRECTORY_TABLE_SIZE];
        for offset in directories.iter_mut() {
            *offset = cursor.read_u64::<LittleEndian>()?;
        }

        let checksum = cursor.read_u32::<LittleEndian>()?;
        let dirty = cursor.read_u8()? != 0;

        Ok(V3Header {
            writer_version,
            file_size,
            uncompressed_file_size,
            frame_count,
            entry_count,
            raw_entry_count,
            start_time,
            end_time,
            start_cycle,
            end_cycle,
            directory_count,
            directory_capacity,
            attribute_count,
            attributes,
            directories,
            checksum,
            dirty,
        })
    }

    /// Recomputes the checksum over the serialised prefix. Call before
    /// writing the final header; the header must not change afterwards.
    pub fn update_checksum(&mut self) {
        let bytes = self.serialize();
        self.checksum = murmur3_32(&bytes[..V3_HEADER_CHECKSUM_DATA_SIZE], 0);
    }

    pub fn validate_checksum(&self) -> bool {
        let bytes = self.serialize();
        murmur3_32(&bytes[..V3_HEADER_CHECKSUM_DATA_SIZE], 0) == self.checksum
    }
}

/// Serialises master + v3 header into the reserved 4 KiB block.
pub fn serialize_file_header(v3: &V3Header) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_RESERVED_SPACE as usize];
    out[0..8].copy_from_slice(SIMTRACE_SIGNATURE);
    out[8..10].copy_from_slice(&SIMTRACE_VERSION3.to_le_bytes());
    out[10..12].copy_from_slice(&SIMTRACE_VERSION3_MINOR.to_le_bytes());
    let v3_bytes = v3.serialize();
    out[V3_HEADER_OFFSET..V3_HEADER_OFFSET + V3_HEADER_SIZE].copy_from_slice(&v3_bytes);
    out
}

/// Parses and version-checks the reserved header block.
pub fn parse_file_header(data: &[u8]) -> Result<V3Header> {
    if data.len() < HEADER_RESERVED_SPACE as usize {
        return Err(SimutraceError::Corruption("store file too small for header".into()));
    }
    if &data[0..8] != SIMTRACE_SIGNATURE {
        return Err(SimutraceError::Corruption("not a simtrace store (bad signature)".into()));
    }
    let major = u16::from_le_bytes([data[8], data[9]]);
    if major != SIMTRACE_VERSION3 {
        return Err(SimutraceError::NotSupported(format!("store format version {major}")));
    }
    V3Header::parse(&data[V3_HEADER_OFFSET..])
}

// ─────────────────────────────── frame header ────────────────────────────────

#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub sequence_number: StreamSegmentId,
    pub stream_id: StreamId,
    pub type_id: TypeGuid,

    pub entry_count: u32,
    pub raw_entry_count: u32,

    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub start_cycle: CycleCount,
    pub end_cycle: CycleCount,

    pub start_index: u64,
    pub total_size: u64,

    pub attributes: [AttributeLink; FRAME_ATTRIBUTE_TABLE_SIZE],
    pub attribute_count: u8,

    pub checksum: u32,
}

impl FrameHeader {
    pub fn serialize(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE);
        out.extend_from_slice(FRAME_MARKER);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.sequence_number.to_le_bytes());
        out.extend_from_slice(&self.stream_id.to_le_bytes());
        write_guid(&mut out, &self.type_id);
        out.extend_from_slice(&self.entry_count.to_le_bytes());
        out.extend_from_slice(&self.raw_entry_count.to_le_bytes());
        out.extend_from_slice(&self.start_time.to_le_bytes());
        out.extend_from_slice(&self.end_time.to_le_bytes());
        out.extend_from_slice(&self.start_cycle.to_le_bytes());
        out.extend_from_slice(&self.end_cycle.to_le_bytes());
        out.extend_from_slice(&self.start_index.to_le_bytes());
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        for link in &self.attributes {
            out.extend_from_slice(&link.to_u64().to_le_bytes());
        }
        out.push(self.attribute_count);
        out.extend_from_slice(&[0u8; 3]);
        debug_assert_eq!(out.len(), FRAME_HEADER_CHECKSUM_DATA_SIZE);
        out.extend_from_slice(&self.checksum.to_le_bytes());

        let mut fixed = [0u8; FRAME_HEADER_SIZE];
        fixed.copy_from_slice(&out);
        fixed
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(SimutraceError::Corruption("truncated frame header".into()));
        }
        if &data[0..4] != FRAME_MARKER {
            return Err(SimutraceError::Corruption("bad frame marker".into()));
        }
        let mut cursor = Cursor::new(data);
        cursor.set_position(8);
        let sequence_number = cursor.read_u32::<LittleEndian>()?;
        let stream_id = cursor.read_u32::<LittleEndian>()?;
        let type_id = read_guid(&mut cursor)?;
        let entry_count = cursor.read_u32::<LittleEndian>()?;
        let raw_entry_count = cursor.read_u32::<LittleEndian>()?;
        let start_time = cursor.read_u64::<LittleEndian>()?;
        let end_time = cursor.read_u64::<LittleEndian>()?;
        let start_cycle = cursor.read_u64::<LittleEndian>()?;
        let end_cycle = cursor.read_u64::<LittleEndian>()?;
        let start_index = cursor.read_u64::<LittleEndian>()?;
        let total_size = cursor.read_u64::<LittleEndian>()?;
        let _reserved = cursor.read_u64::<LittleEndian>()?;
        let mut attributes = [AttributeLink::default(); FRAME_ATTRIBUTE_TABLE_SIZE];
        for link in attributes.iter_mut() {
            *link = AttributeLink::from_u64(cursor.read_u64::<LittleEndian>()?);
        }
        let attribute_count = cursor.read_u8()?;
        cursor.set_position(FRAME_HEADER_CHECKSUM_DATA_SIZE as u64);
        let checksum = cursor.read_u32::<LittleEndian>()?;

        Ok(FrameHeader {
            sequence_number,
            stream_id,
            type_id,
            entry_count,
            raw_entry_count,
            start_time,
            end_time,
            start_cycle,
            end_cycle,
            start_index,
            total_size,
            attributes,
            attribute_count,
            checksum,
        })
    }

    pub fn update_checksum(&mut self) {
        let bytes = self.serialize();
        self.checksum = murmur3_32(&bytes[..FRAME_HEADER_CHECKSUM_DATA_SIZE], 0);
    }

    pub fn validate_checksum(&self) -> bool {
        let bytes = self.serialize();
        murmur3_32(&bytes[..FRAME_HEADER_CHECKSUM_DATA_SIZE], 0) == self.checksum
    }
}

// ─────────────────────────────── attributes ──────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct AttributeHeader {
    pub attr_type: u8,
    pub size: u64,
    pub uncompressed_size: u64,
}

impl AttributeHeader {
    pub fn serialize(&self, last: bool) -> [u8; ATTRIBUTE_HEADER_SIZE] {
        let mut out = [0u8; ATTRIBUTE_HEADER_SIZE];
        out[0..4].copy_from_slice(ATTRIBUTE_MARKER);
        out[4] = if last { self.attr_type | SAT_FLAG_LAST } else { self.attr_type };
        out[16..24].copy_from_slice(&self.size.to_le_bytes());
        out[24..32].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < ATTRIBUTE_HEADER_SIZE {
            return Err(SimutraceError::Corruption("truncated attribute header".into()));
        }
        if &data[0..4] != ATTRIBUTE_MARKER {
            return Err(SimutraceError::Corruption("bad attribute marker".into()));
        }
        let attr_type = data[4] & !SAT_FLAG_LAST;
        let size = u64::from_le_bytes(data[16..24].try_into().unwrap_or_default());
        let uncompressed_size = u64::from_le_bytes(data[24..32].try_into().unwrap_or_default());
        Ok(AttributeHeader { attr_type, size, uncompressed_size })
    }
}

// ─────────────────────────────── directory entries ───────────────────────────

#[derive(Debug)]
pub enum DirectoryEntry {
    Frame { header: FrameHeader, offset: u64 },
    Link { next_directory: u64 },
    End,
}

pub fn serialize_frame_entry(header: &FrameHeader, offset: u64) -> [u8; DIRECTORY_ENTRY_SIZE] {
    let mut out = [0u8; DIRECTORY_ENTRY_SIZE];
    out[..FRAME_HEADER_SIZE].copy_from_slice(&header.serialize());
    out[FRAME_HEADER_SIZE..].copy_from_slice(&offset.to_le_bytes());
    out
}

pub fn serialize_link_entry(next_directory: u64) -> [u8; DIRECTORY_ENTRY_SIZE] {
    let mut out = [0u8; DIRECTORY_ENTRY_SIZE];
    out[0..4].copy_from_slice(DIRECTORY_LINK_MARKER);
    out[8..16].copy_from_slice(&next_directory.to_le_bytes());
    out
}

pub fn parse_directory_entry(data: &[u8]) -> Result<DirectoryEntry> {
    if data.len() < DIRECTORY_ENTRY_SIZE {
        return Err(SimutraceError::Corruption("truncated directory entry".into()));
    }
    match &data[0..4] {
        marker if marker == FRAME_MARKER => {
            let header = FrameHeader::parse(&data[..FRAME_HEADER_SIZE])?;
            let offset =
                u64::from_le_bytes(data[FRAME_HEADER_SIZE..DIRECTORY_ENTRY_SIZE].try_into().unwrap_or_default());
            Ok(DirectoryEntry::Frame { header, offset })
        }
        marker if marker == DIRECTORY_LINK_MARKER => {
            let next = u64::from_le_bytes(data[8..16].try_into().unwrap_or_default());
            Ok(DirectoryEntry::Link { next_directory: next })
        }
        [0, 0, 0, 0] => Ok(DirectoryEntry::End),
        _ => Err(SimutraceError::Corruption("unknown directory entry marker".into())),
    }
}

// ─────────────────────────── stream descriptor io ────────────────────────────

const SD_FLAG_TEMPORAL_ORDER: u32 = 1 << 0;
const SD_FLAG_ARCH32: u32 = 1 << 1;
const SD_FLAG_BIG_ENDIAN: u32 = 1 << 2;
const SD_FLAG_HIDDEN: u32 = 1 << 3;

/// Serialises a stream descriptor as the `StreamDescription` attribute
/// body of a zero frame.
pub fn serialize_stream_descriptor(desc: &StreamDescriptor) -> Vec<u8> {
    let mut out = Vec::with_capacity(STREAM_DESCRIPTOR_SIZE);

    let mut name = [0u8; MAX_STREAM_NAME_LENGTH];
    let bytes = desc.name.as_bytes();
    let len = bytes.len().min(MAX_STREAM_NAME_LENGTH - 1);
    name[..len].copy_from_slice(&bytes[..len]);
    out.extend_from_slice(&name);

    write_guid(&mut out, &desc.type_desc.id);

    let mut flags = 0u32;
    if desc.type_desc.temporal_order() {
        flags |= SD_FLAG_TEMPORAL_ORDER;
    }
    if desc.type_desc.arch32_bit() {
        flags |= SD_FLAG_ARCH32;
    }
    if desc.type_desc.big_endian() {
        flags |= SD_FLAG_BIG_ENDIAN;
    }
    if desc.hidden {
        flags |= SD_FLAG_HIDDEN;
    }
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&desc.type_desc.entry_size.to_le_bytes());

    debug_assert_eq!(out.len(), STREAM_DESCRIPTOR_SIZE);
    out
}

pub fn parse_stream_descriptor(data: &[u8]) -> Result<StreamDescriptor> {
    if data.len() < STREAM_DESCRIPTOR_SIZE {
        return Err(SimutraceError::Corruption("truncated stream descriptor".into()));
    }

    let name_end = data[..MAX_STREAM_NAME_LENGTH]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(MAX_STREAM_NAME_LENGTH);
    let name = std::str::from_utf8(&data[..name_end])
        .map_err(|_| SimutraceError::Corruption("stream name is not valid UTF-8".into()))?
        .to_string();

    let mut cursor = Cursor::new(&data[MAX_STREAM_NAME_LENGTH..]);
    let id = read_guid(&mut cursor)?;
    let raw_flags = cursor.read_u32::<LittleEndian>()?;
    let entry_size = cursor.read_u32::<LittleEndian>()?;

    let mut flags = StreamTypeFlags::empty();
    if raw_flags & SD_FLAG_TEMPORAL_ORDER != 0 {
        flags |= StreamTypeFlags::TEMPORAL_ORDER;
    }
    if raw_flags & SD_FLAG_ARCH32 != 0 {
        flags |= StreamTypeFlags::ARCH32_BIT;
    }
    if raw_flags & SD_FLAG_BIG_ENDIAN != 0 {
        flags |= StreamTypeFlags::BIG_ENDIAN;
    }

    Ok(StreamDescriptor {
        name,
        hidden: raw_flags & SD_FLAG_HIDDEN != 0,
        type_desc: StreamTypeDescriptor { id, flags, entry_size },
    })
}

// ───────────────────────── associated streams io ─────────────────────────────

/// Serialises the hidden stream ids of a composite encoder as the
/// `AssociatedStreams` attribute body.
pub fn serialize_associated_streams(streams: &[StreamId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + streams.len() * 4);
    out.extend_from_slice(&(streams.len() as u32).to_le_bytes());
    for id in streams {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

pub fn parse_associated_streams(data: &[u8]) -> Result<Vec<StreamId>> {
    if data.len() < 4 {
        return Err(SimutraceError::Corruption("truncated stream association".into()));
    }
    let count = u32::from_le_bytes(data[..4].try_into().unwrap_or_default()) as usize;
    if data.len() < 4 + count * 4 {
        return Err(SimutraceError::Corruption("truncated stream association".into()));
    }
    let mut streams = Vec::with_capacity(count);
    for i in 0..count {
        let off = 4 + i * 4;
        streams.push(u32::from_le_bytes(data[off..off + 4].try_into().unwrap_or_default()));
    }
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_round_trips_with_checksum() {
        let mut header = FrameHeader {
            sequence_number: 7,
            stream_id: 3,
            type_id: TypeGuid::new(0xdead_beef, 0x12, 0x34, [1, 2, 3, 4, 5, 6, 7, 8]),
            entry_count: 100,
            raw_entry_count: 100,
            start_time: 1111,
            end_time: 2222,
            start_cycle: 10,
            end_cycle: 20,
            start_index: 0,
            total_size: 4096,
            attributes: [AttributeLink::default(); FRAME_ATTRIBUTE_TABLE_SIZE],
            attribute_count: 0,
            checksum: 0,
        };
        header.update_checksum();
        let bytes = header.serialize();
        let parsed = FrameHeader::parse(&bytes).expect("parse");
        assert!(parsed.validate_checksum());
        assert_eq!(parsed.sequence_number, 7);
        assert_eq!(parsed.type_id, header.type_id);
        assert_eq!(parsed.total_size, 4096);
    }

    #[test]
    fn v3_header_serialization_is_stable() {
        let mut header = V3Header::new(0x0003_0000);
        header.frame_count = 5;
        header.directories[0] = 4096;
        header.directory_count = 1;
        header.update_checksum();
        let parsed = V3Header::parse(&header.serialize()).expect("parse");
        assert!(parsed.validate_checksum());
        assert_eq!(parsed.frame_count, 5);
        assert_eq!(parsed.directories[0], 4096);
        assert!(parsed.dirty);
    }

    #[test]
    fn stream_descriptor_round_trips() {
        let desc = StreamDescriptor::new("Memory Stream", 24, true);
        let parsed = parse_stream_descriptor(&serialize_stream_descriptor(&desc)).expect("parse");
        assert_eq!(parsed, desc);
    }

    #[test]
    fn directory_entries_parse_by_marker() {
        let link = serialize_link_entry(0x2_0000);
        match parse_directory_entry(&link).expect("parse link") {
            DirectoryEntry::Link { next_directory } => assert_eq!(next_directory, 0x2_0000),
            _ => panic!("expected link entry"),
        }

        let zero = [0u8; DIRECTORY_ENTRY_SIZE];
        assert!(matches!(parse_directory_entry(&zero).expect("parse end"), DirectoryEntry::End));
    }
}
