// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Frame builder and reader. A frame persists one segment (or, as a zero
//! frame, the metadata of a stream) and consists of a fixed header plus a
//! list of attributes.

use bytes::Bytes;

use crate::error::{Result, SimutraceError};
use crate::simtrace::format::{
    AttributeHeader, AttributeLink, FrameHeader, ATTRIBUTE_HEADER_SIZE, FRAME_ATTRIBUTE_TABLE_SIZE,
    FRAME_HEADER_SIZE,
};
use crate::types::{
    SegmentControlElement, StorageLocation, StorageRanges, StreamId, TypeGuid,
    INVALID_CYCLE_COUNT, INVALID_ENTRY_INDEX, INVALID_STREAM_SEGMENT_ID, INVALID_TIME_STAMP,
    QueryIndexType, Range,
};

#[derive(Debug, Clone)]
pub struct Attribute {
    pub header: AttributeHeader,
    pub data: Bytes,
}

/// An in-memory frame, either under construction for a commit or decoded
/// from the container.
#[derive(Debug)]
pub struct Frame {
    header: FrameHeader,
    attributes: Vec<Attribute>,
}

impl Frame {
    /// Frame for a segment of `stream`. Without a control element this
    /// builds a zero frame carrying stream metadata only.
    pub fn new(
        stream_id: StreamId,
        type_id: TypeGuid,
        control: Option<&SegmentControlElement>,
    ) -> Frame {
        let header = match control {
            Some(control) => FrameHeader {
                sequence_number: control.link.sequence_number,
                stream_id,
                type_id,
                entry_count: control.entry_count,
                raw_entry_count: control.raw_entry_count,
                start_time: control.start_time,
                end_time: control.end_time,
                start_cycle: control.start_cycle,
                end_cycle: control.end_cycle,
                start_index: control.start_index,
                total_size: FRAME_HEADER_SIZE as u64,
                attributes: [AttributeLink::default(); FRAME_ATTRIBUTE_TABLE_SIZE],
                attribute_count: 0,
                checksum: 0,
            },
            None => FrameHeader {
                sequence_number: INVALID_STREAM_SEGMENT_ID,
                stream_id,
                type_id,
                entry_count: 0,
                raw_entry_count: 0,
                start_time: INVALID_TIME_STAMP,
                end_time: INVALID_TIME_STAMP,
                start_cycle: INVALID_CYCLE_COUNT,
                end_cycle: INVALID_CYCLE_COUNT,
                start_index: INVALID_ENTRY_INDEX,
                total_size: FRAME_HEADER_SIZE as u64,
                attributes: [AttributeLink::default(); FRAME_ATTRIBUTE_TABLE_SIZE],
                attribute_count: 0,
                checksum: 0,
            },
        };

        Frame { header, attributes: Vec::new() }
    }

    pub fn from_header(header: FrameHeader) -> Frame {
        Frame { header, attributes: Vec::new() }
    }

    pub fn is_zero_frame(&self) -> bool {
        self.header.sequence_number == INVALID_STREAM_SEGMENT_ID
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut FrameHeader {
        &mut self.header
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Appends an attribute whose stored size equals its payload size.
    pub fn add_attribute(&mut self, attr_type: u8, data: Bytes) -> Result<()> {
        let uncompressed = data.len() as u64;
        self.add_compressed_attribute(attr_type, uncompressed, data)
    }

    /// Appends an attribute with an explicit uncompressed size (the stored
    /// payload is `data`, typically compressed).
    pub fn add_compressed_attribute(
        &mut self,
        attr_type: u8,
        uncompressed_size: u64,
        data: Bytes,
    ) -> Result<()> {
        let index = self.header.attribute_count as usize;
        if index >= FRAME_ATTRIBUTE_TABLE_SIZE {
            return Err(SimutraceError::InvalidOperation(format!(
                "frame attribute table is full (stream {}, sqn {})",
                self.header.stream_id, self.header.sequence_number
            )));
        }

        let header = AttributeHeader {
            attr_type,
            size: data.len() as u64,
            uncompressed_size,
        };

        self.header.attributes[index] =
            AttributeLink { attr_type, relative_offset: self.header.total_size };
        self.header.attribute_count += 1;
        self.header.total_size += (ATTRIBUTE_HEADER_SIZE + data.len()) as u64;

        self.attributes.push(Attribute { header, data });
        Ok(())
    }

    pub(crate) fn push_parsed_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn find_attribute(&self, attr_type: u8) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.header.attr_type == attr_type)
    }

    pub fn update_checksum(&mut self) {
        self.header.update_checksum();
    }

    pub fn validate_checksum(&self) -> bool {
        self.header.validate_checksum()
    }

    /// Total uncompressed payload this frame represents, counted the way
    /// the store-level statistics do.
    pub fn uncompressed_size(&self) -> u64 {
        FRAME_HEADER_SIZE as u64
            + self
                .attributes
                .iter()
                .map(|a| ATTRIBUTE_HEADER_SIZE as u64 + a.header.uncompressed_size)
                .sum::<u64>()
    }
}

/// Builds the in-memory storage descriptor for a committed frame.
pub fn storage_location_from_frame(header: &FrameHeader, offset: u64) -> StorageLocation {
    let mut ranges = StorageRanges::INVALID;

    if header.start_cycle != INVALID_CYCLE_COUNT && header.end_cycle != INVALID_CYCLE_COUNT {
        ranges.ranges[QueryIndexType::CycleCount as usize] =
            Range { start: header.start_cycle, end: header.end_cycle };
    }
    if header.start_time != INVALID_TIME_STAMP && header.end_time != INVALID_TIME_STAMP {
        ranges.ranges[QueryIndexType::RealTime as usize] =
            Range { start: header.start_time, end: header.end_time };
    }
    if header.start_index != INVALID_ENTRY_INDEX && header.entry_count > 0 {
        ranges.ranges[QueryIndexType::Index as usize] = Range {
            start: header.start_index,
            end: header.start_index + header.entry_count as u64 - 1,
        };
    }

    StorageLocation {
        link: crate::types::StreamSegmentLink::new(header.stream_id, header.sequence_number),
        ranges,
        raw_entry_count: header.raw_entry_count,
        compressed_size: header.total_size,
        offset,
        size: header.total_size,
    }
}
