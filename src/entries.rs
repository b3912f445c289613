// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Built-in memory-access entry types and their stream type table.
//!
//! The type GUIDs are format constants: stores written by any compatible
//! implementation identify memory streams by these ids, so they must never
//! change. Entries are packed to 1-byte alignment; `bytemuck` gives the
//! encoder a checked view of segment payloads as entry slices.

use bytemuck::{Pod, Zeroable};

use crate::types::{
    StreamTypeDescriptor, StreamTypeFlags, TypeGuid, TEMPORAL_ORDER_CYCLE_COUNT_BITS,
    TEMPORAL_ORDER_CYCLE_COUNT_MASK,
};

// ─────────────────────────────── metadata ────────────────────────────────────

/// Leading quad word of every memory entry: 48-bit cycle count, a full-size
/// bit and a 15-bit user tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Default)]
#[repr(transparent)]
pub struct MemoryAccessMetaData(pub u64);

impl MemoryAccessMetaData {
    pub fn new(cycle_count: u64, full_size: bool, tag: u16) -> Self {
        let mut value = cycle_count & TEMPORAL_ORDER_CYCLE_COUNT_MASK;
        if full_size {
            value |= 1u64 << TEMPORAL_ORDER_CYCLE_COUNT_BITS;
        }
        value |= ((tag as u64) & 0x7FFF) << (TEMPORAL_ORDER_CYCLE_COUNT_BITS + 1);
        MemoryAccessMetaData(value)
    }

    pub fn cycle_count(&self) -> u64 {
        self.0 & TEMPORAL_ORDER_CYCLE_COUNT_MASK
    }

    pub fn full_size(&self) -> bool {
        (self.0 >> TEMPORAL_ORDER_CYCLE_COUNT_BITS) & 1 != 0
    }

    pub fn tag(&self) -> u16 {
        ((self.0 >> (TEMPORAL_ORDER_CYCLE_COUNT_BITS + 1)) & 0x7FFF) as u16
    }

    /// The 16 bits above the cycle count, as stored in the meta sub-stream.
    pub fn upper_bits(&self) -> u16 {
        (self.0 >> TEMPORAL_ORDER_CYCLE_COUNT_BITS) as u16
    }

    pub fn from_parts(upper_bits: u16, cycle_count: u64) -> Self {
        MemoryAccessMetaData(
            ((upper_bits as u64) << TEMPORAL_ORDER_CYCLE_COUNT_BITS)
                | (cycle_count & TEMPORAL_ORDER_CYCLE_COUNT_MASK),
        )
    }
}

// ─────────────────────────────── entry types ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Default)]
#[repr(C, packed)]
pub struct MemoryAccess32 {
    pub metadata: MemoryAccessMetaData,
    pub ip: u32,
    pub address: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Default)]
#[repr(C, packed)]
pub struct DataMemoryAccess32 {
    pub metadata: MemoryAccessMetaData,
    pub ip: u32,
    pub address: u32,
    pub data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Default)]
#[repr(C, packed)]
pub struct MemoryAccess64 {
    pub metadata: MemoryAccessMetaData,
    pub ip: u64,
    pub address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Default)]
#[repr(C, packed)]
pub struct DataMemoryAccess64 {
    pub metadata: MemoryAccessMetaData,
    pub ip: u64,
    pub address: u64,
    pub data: u64,
}

pub type Read32 = MemoryAccess32;
pub type Write32 = MemoryAccess32;
pub type Read64 = MemoryAccess64;
pub type Write64 = MemoryAccess64;
pub type DataRead32 = DataMemoryAccess32;
pub type DataWrite32 = DataMemoryAccess32;
pub type DataRead64 = DataMemoryAccess64;
pub type DataWrite64 = DataMemoryAccess64;

// ─────────────────────────────── type table ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ArchitectureSize {
    As32Bit = 0,
    As64Bit = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryAccessType {
    Read = 0,
    Write = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryAddressType {
    Physical = 0,
    Virtual = 1,
}

/// One row of the built-in memory stream type table.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStreamType {
    pub name: &'static str,
    pub id: TypeGuid,
    pub arch32_bit: bool,
    pub with_data: bool,
    pub entry_size: u32,
}

impl MemoryStreamType {
    pub fn descriptor(&self) -> StreamTypeDescriptor {
        let mut flags = StreamTypeFlags::TEMPORAL_ORDER;
        if self.arch32_bit {
            flags |= StreamTypeFlags::ARCH32_BIT;
        }
        StreamTypeDescriptor { id: self.id, flags, entry_size: self.entry_size }
    }
}

macro_rules! mstype {
    ($name:literal, $d1:literal, $d2:literal, $d3:literal, $d4:expr, $arch32:literal, $data:literal, $entry:ty) => {
        MemoryStreamType {
            name: $name,
            id: TypeGuid::new($d1, $d2, $d3, $d4),
            arch32_bit: $arch32,
            with_data: $data,
            entry_size: std::mem::size_of::<$entry>() as u32,
        }
    };
}

/// Indexed as `arch | access << 1 | address << 2 | data << 3`.
pub static MEMORY_TYPE_TABLE: [MemoryStreamType; 16] = [
    mstype!("32bit memory read (physical address)",
            0x3f759bfb, 0x2c25, 0x470c, [0x96, 0x46, 0x16, 0x98, 0xcd, 0xf9, 0xd8, 0x35],
            true, false, Read32),
    mstype!("64bit memory read (physical address)",
            0x03cfacb5, 0xd490, 0x4d5d, [0xb5, 0xbe, 0x6b, 0xb4, 0xa3, 0x23, 0x5d, 0xd1],
            false, false, Read64),
    mstype!("32bit memory write (physical address)",
            0x624c5632, 0x3acc, 0x4b39, [0x87, 0x1f, 0x33, 0xf7, 0x39, 0xe6, 0xf9, 0x3f],
            true, false, Write32),
    mstype!("64bit memory write (physical address)",
            0x4ce4d04d, 0xbddc, 0x4640, [0xb5, 0x0d, 0x00, 0xb3, 0x5f, 0xc0, 0x81, 0x33],
            false, false, Write64),
    mstype!("32bit memory read (virtual address)",
            0x7cc9a0c4, 0x41bc, 0x4a9e, [0x8f, 0x9b, 0x55, 0x3c, 0x0a, 0xae, 0x8b, 0xa8],
            true, false, Read32),
    mstype!("64bit memory read (virtual address)",
            0xc81b6ce6, 0x47a0, 0x482b, [0xb3, 0x8e, 0x28, 0x3a, 0x4c, 0xa3, 0xed, 0x8c],
            false, false, Read64),
    mstype!("32bit memory write (virtual address)",
            0x22d8a589, 0x16a8, 0x4069, [0xb7, 0xdf, 0xdf, 0xee, 0x23, 0xba, 0x55, 0xb6],
            true, false, Write32),
    mstype!("64bit memory write (virtual address)",
            0xde27cf5e, 0xe16b, 0x499c, [0xb1, 0x01, 0x14, 0x06, 0x2f, 0x57, 0x8a, 0xa7],
            false, false, Write64),
    mstype!("32bit memory read (data, physical address)",
            0x74a5e8d8, 0xf8b3, 0x4831, [0xab, 0x0e, 0xac, 0xb0, 0x04, 0x55, 0x6c, 0x0a],
            true, true, DataRead32),
    mstype!("64bit memory read (data, physical address)",
            0x2b58f45a, 0xc2f6, 0x495b, [0xa7, 0xd2, 0x9f, 0xbb, 0xeb, 0xcd, 0x47, 0x10],
            false, true, DataRead64),
    mstype!("32bit memory write (data, physical address)",
            0xf8f41ee8, 0xeeb1, 0x4c02, [0xb9, 0x97, 0xc9, 0x1b, 0x35, 0xd5, 0xd4, 0x26],
            true, true, DataWrite32),
    mstype!("64bit memory write (data, physical address)",
            0x6e943cdd, 0xd2da, 0x4e83, [0x98, 0x4f, 0x58, 0x5c, 0x47, 0xeb, 0x0e, 0x36],
            false, true, DataWrite64),
    mstype!("32bit memory read (data, virtual address)",
            0xbfccbb37, 0xa37a, 0x4007, [0xba, 0x04, 0x53, 0xb7, 0xf1, 0xb8, 0x57, 0x46],
            true, true, DataRead32),
    mstype!("64bit memory read (data, virtual address)",
            0x62629e18, 0x267d, 0x4af9, [0xa5, 0xee, 0xed, 0x48, 0x58, 0x93, 0x51, 0x3a],
            false, true, DataRead64),
    mstype!("32bit memory write (data, virtual address)",
            0x9abe7322, 0x339e, 0x420d, [0x82, 0x24, 0x23, 0x11, 0x3a, 0xa0, 0x5b, 0x8c],
            true, true, DataWrite32),
    mstype!("64bit memory write (data, virtual address)",
            0x157f6fae, 0x0e88, 0x48ba, [0xb8, 0x29, 0x5c, 0x1c, 0x81, 0x8f, 0x56, 0xa9],
            false, true, DataWrite64),
];

/// Look up the built-in stream type for a memory access shape.
pub fn find_memory_type(
    size: ArchitectureSize,
    access: MemoryAccessType,
    address: MemoryAddressType,
    with_data: bool,
) -> &'static MemoryStreamType {
    let index = (size as usize)
        | ((access as usize) << 1)
        | ((address as usize) << 2)
        | ((with_data as usize) << 3);
    &MEMORY_TYPE_TABLE[index]
}
