// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Simtrace v3 container file: header maintenance, the chained frame
//! directory and the frame commit/read protocol.
//!
//! One writer per store. Frames are committed append-only under the file
//! lock: first the frame body is written, then the directory entry makes
//! it visible and the aggregate header statistics are updated. The header
//! block itself is only finalised (checksum, dirty flag cleared) when the
//! store closes; a crash leaves the dirty flag set and such stores are
//! refused on open until a recovery tool exists.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::{Result, SimutraceError};
use crate::simtrace::format::{
    parse_directory_entry, parse_file_header, serialize_file_header, serialize_frame_entry,
    serialize_link_entry, AttributeHeader, DirectoryEntry, FrameHeader, V3Header,
    ATTRIBUTE_HEADER_SIZE, DIRECTORY_DATA_SIZE, DIRECTORY_ENTRY_SIZE, DIRECTORY_TABLE_SIZE,
    FRAME_HEADER_SIZE, HEADER_RESERVED_SPACE, V3_HEADER_OFFSET,
};
use crate::simtrace::frame::{Attribute, Frame};
use crate::types::{
    now_timestamp, StorageLocation, INVALID_CYCLE_COUNT, INVALID_STREAM_ID, INVALID_TIME_STAMP,
};

/// Version stamp of this writer, recorded in the header.
pub const WRITER_VERSION: u32 = (3 << 16) | 1;

/// File offset of the dirty flag byte inside the v3 header.
const DIRTY_FLAG_OFFSET: u64 = (V3_HEADER_OFFSET + 3740) as u64;

struct FileState {
    header: V3Header,
    end_offset: u64,
    read_mode: bool,
    dirty_on_disk: bool,
    /// Offset of the directory currently taking entries.
    current_directory: Option<u64>,
    next_frame_index: u32,
}

pub struct Simtrace3File {
    path: PathBuf,
    file: File,
    state: Mutex<FileState>,
}

impl Simtrace3File {
    /// Creates a new store file, overwriting an existing one.
    pub fn create(path: &Path) -> Result<Simtrace3File> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| SimutraceError::Config(format!("cannot create store {path:?}: {e}")))?;

        let header = V3Header::new(WRITER_VERSION);
        let bytes = serialize_file_header(&header);
        file.write_all_at(&bytes, 0)?;
        file.set_len(HEADER_RESERVED_SPACE)?;

        info!(path = ?path, "Simtrace store created (v3.0)");

        Ok(Simtrace3File {
            path: path.to_path_buf(),
            file,
            state: Mutex::new(FileState {
                header,
                end_offset: HEADER_RESERVED_SPACE,
                read_mode: false,
                dirty_on_disk: true,
                current_directory: None,
                next_frame_index: 0,
            }),
        })
    }

    /// Opens an existing store read-only. Dirty stores are refused: no
    /// recovery path exists in this version.
    pub fn open(path: &Path) -> Result<Simtrace3File> {
        let file = File::options()
            .read(true)
            .open(path)
            .map_err(|e| SimutraceError::Config(format!("cannot open store {path:?}: {e}")))?;

        let mut block = vec![0u8; HEADER_RESERVED_SPACE as usize];
        file.read_exact_at(&mut block, 0)?;
        let header = parse_file_header(&block)?;

        if header.dirty {
            return Err(SimutraceError::Corruption(format!(
                "store {path:?} was not closed cleanly; refusing to open without recovery"
            )));
        }
        if !header.validate_checksum() {
            return Err(SimutraceError::Corruption(format!(
                "store {path:?} has an invalid header checksum"
            )));
        }

        info!(
            path = ?path,
            frames = header.frame_count,
            entries = header.entry_count,
            "Simtrace store opened (v3.0)"
        );

        let end_offset = header.file_size;
        Ok(Simtrace3File {
            path: path.to_path_buf(),
            file,
            state: Mutex::new(FileState {
                header,
                end_offset,
                read_mode: true,
                dirty_on_disk: false,
                current_directory: None,
                next_frame_index: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> V3Header {
        self.state.lock().header.clone()
    }

    pub fn is_read_mode(&self) -> bool {
        self.state.lock().read_mode
    }

    pub fn set_read_mode(&self) {
        self.state.lock().read_mode = true;
    }

    // ───────────────────────── commit protocol ──────────────────────────

    /// Writes a frame and its directory entry, updating the aggregate
    /// header statistics. Returns the absolute frame offset.
    pub fn commit_frame(&self, frame: &mut Frame) -> Result<u64> {
        if frame.header().stream_id == INVALID_STREAM_ID {
            return Err(SimutraceError::Argument("frame".into(), "frame has no stream".into()));
        }

        let mut state = self.state.lock();
        if state.read_mode {
            return Err(SimutraceError::InvalidOperation(format!(
                "store {:?} is read-only",
                self.path
            )));
        }

        match self.commit_frame_locked(&mut state, frame) {
            Ok(offset) => Ok(offset),
            Err(e) => {
                state.read_mode = true;
                error!(
                    path = ?self.path,
                    error = %e,
                    "Failed to write frame; the store might be corrupted, switched to read-only"
                );
                Err(e)
            }
        }
    }

    fn commit_frame_locked(&self, state: &mut FileState, frame: &mut Frame) -> Result<u64> {
        self.mark_dirty(state)?;

        frame.update_checksum();

        // Commit contiguous space first so a failed write cannot tear the
        // directory; the entry is only added after the body is on disk.
        let total_size = frame.header().total_size;
        let frame_offset = state.end_offset;
        state.end_offset += total_size;

        let mut offset = frame_offset;
        let header_bytes = frame.header().serialize();
        self.file.write_all_at(&header_bytes, offset)?;
        offset += FRAME_HEADER_SIZE as u64;

        let count = frame.attributes().len();
        for (i, attribute) in frame.attributes().iter().enumerate() {
            let header_bytes = attribute.header.serialize(i + 1 == count);
            self.file.write_all_at(&header_bytes, offset)?;
            offset += ATTRIBUTE_HEADER_SIZE as u64;
            self.file.write_all_at(&attribute.data, offset)?;
            offset += attribute.data.len() as u64;
        }

        self.add_frame_to_directory(state, frame, frame_offset)?;
        self.add_frame_to_statistics(state, frame);

        debug!(
            path = ?self.path,
            stream = frame.header().stream_id,
            sqn = frame.header().sequence_number as i64,
            size = total_size,
            attributes = count,
            "Written frame to store"
        );

        Ok(frame_offset)
    }

    fn mark_dirty(&self, state: &mut FileState) -> Result<()> {
        state.header.dirty = true;
        if !state.dirty_on_disk {
            self.file.write_all_at(&[0xFF], DIRTY_FLAG_OFFSET)?;
            state.dirty_on_disk = true;
        }
        Ok(())
    }

    fn add_directory(&self, state: &mut FileState) -> Result<()> {
        let offset = state.end_offset;
        state.end_offset += DIRECTORY_DATA_SIZE as u64;
        state.header.file_size += DIRECTORY_DATA_SIZE as u64;
        state.header.uncompressed_file_size += DIRECTORY_DATA_SIZE as u64;

        // Zero-fill the reserved region so iteration terminates.
        self.file.set_len(state.end_offset)?;

        let capacity = state.header.directory_capacity as usize;
        let count = state.header.directory_count as usize;
        if count < DIRECTORY_TABLE_SIZE {
            state.header.directories[count] = offset;
        }
        state.header.directory_count += 1;

        // Chain from the previous directory through its last slot.
        if let Some(current) = state.current_directory {
            let link = serialize_link_entry(offset);
            let link_offset = current + ((capacity - 1) * DIRECTORY_ENTRY_SIZE) as u64;
            self.file.write_all_at(&link, link_offset)?;
        }

        state.current_directory = Some(offset);
        state.next_frame_index = 0;

        debug!(
            path = ?self.path,
            directory = state.header.directory_count - 1,
            offset,
            "Added directory to store"
        );
        Ok(())
    }

    fn add_frame_to_directory(
        &self,
        state: &mut FileState,
        frame: &Frame,
        frame_offset: u64,
    ) -> Result<()> {
        let capacity = state.header.directory_capacity as u32;
        if state.current_directory.is_none() || state.next_frame_index == capacity - 1 {
            self.add_directory(state)?;
        }

        let current = state.current_directory.ok_or_else(|| {
            SimutraceError::InvalidOperation("no frame directory available".into())
        })?;

        let entry = serialize_frame_entry(frame.header(), frame_offset);
        let entry_offset = current + (state.next_frame_index as usize * DIRECTORY_ENTRY_SIZE) as u64;
        self.file.write_all_at(&entry, entry_offset)?;
        state.next_frame_index += 1;
        state.header.frame_count += 1;
        Ok(())
    }

    fn add_frame_to_statistics(&self, state: &mut FileState, frame: &Frame) {
        let fheader = frame.header();
        let header = &mut state.header;

        header.file_size += fheader.total_size;
        header.uncompressed_file_size += frame.uncompressed_size();

        if fheader.start_time < header.start_time {
            header.start_time = fheader.start_time;
        }
        if header.end_time == INVALID_TIME_STAMP
            || (fheader.end_time != INVALID_TIME_STAMP && fheader.end_time > header.end_time)
        {
            header.end_time = fheader.end_time;
        }
        if fheader.start_cycle < header.start_cycle {
            header.start_cycle = fheader.start_cycle;
        }
        if header.end_cycle == INVALID_CYCLE_COUNT
            || (fheader.end_cycle != INVALID_CYCLE_COUNT && fheader.end_cycle > header.end_cycle)
        {
            header.end_cycle = fheader.end_cycle;
        }

        header.entry_count += fheader.entry_count as u64;
        header.raw_entry_count += fheader.raw_entry_count as u64;
    }

    // ───────────────────────── read protocol ────────────────────────────

    /// Loads a frame, its attribute headers and attribute bodies from the
    /// file and validates the header checksum.
    pub fn read_frame(&self, location: &StorageLocation) -> Result<Frame> {
        self.read_frame_at(location.offset, location.size)
    }

    pub fn read_frame_at(&self, offset: u64, size: u64) -> Result<Frame> {
        if size < FRAME_HEADER_SIZE as u64 {
            return Err(SimutraceError::Corruption("frame smaller than its header".into()));
        }
        let mut buffer = vec![0u8; size as usize];
        self.file.read_exact_at(&mut buffer, offset)?;

        let header = FrameHeader::parse(&buffer[..FRAME_HEADER_SIZE])?;
        if !header.validate_checksum() {
            return Err(SimutraceError::Corruption(format!(
                "corrupted frame header <stream: {}, sqn: {}>",
                header.stream_id, header.sequence_number as i64
            )));
        }

        let attribute_count = header.attribute_count as usize;
        let mut frame = Frame::from_header(header);
        let mut position = FRAME_HEADER_SIZE;
        for _ in 0..attribute_count {
            if position + ATTRIBUTE_HEADER_SIZE > buffer.len() {
                return Err(SimutraceError::Corruption("attribute beyond frame bounds".into()));
            }
            let attr_header =
                AttributeHeader::parse(&buffer[position..position + ATTRIBUTE_HEADER_SIZE])?;
            position += ATTRIBUTE_HEADER_SIZE;

            let end = position + attr_header.size as usize;
            if end > buffer.len() {
                return Err(SimutraceError::Corruption("attribute data beyond frame bounds".into()));
            }
            frame.push_parsed_attribute(Attribute {
                header: attr_header,
                data: Bytes::copy_from_slice(&buffer[position..end]),
            });
            position = end;
        }

        Ok(frame)
    }

    /// Walks the directory chain in commit order, validating each frame
    /// entry's checksum.
    pub fn for_each_frame(
        &self,
        mut f: impl FnMut(FrameHeader, u64) -> Result<()>,
    ) -> Result<()> {
        let (directory_count, capacity, first) = {
            let state = self.state.lock();
            (
                state.header.directory_count,
                state.header.directory_capacity as usize,
                state.header.directories[0],
            )
        };

        if directory_count == 0 {
            return Ok(());
        }
        if first == 0 {
            return Err(SimutraceError::Corruption("first directory link corrupted".into()));
        }

        let mut directory = first;
        let mut index = 0usize;
        let mut entry_buffer = [0u8; DIRECTORY_ENTRY_SIZE];
        loop {
            if index >= capacity {
                return Err(SimutraceError::Corruption("directory structure corrupted".into()));
            }

            let offset = directory + (index * DIRECTORY_ENTRY_SIZE) as u64;
            self.file.read_exact_at(&mut entry_buffer, offset)?;

            match parse_directory_entry(&entry_buffer)? {
                DirectoryEntry::Frame { header, offset } => {
                    if !header.validate_checksum() {
                        return Err(SimutraceError::Corruption(format!(
                            "corrupted directory frame entry <stream: {}, sqn: {}>",
                            header.stream_id, header.sequence_number as i64
                        )));
                    }
                    f(header, offset)?;
                    index += 1;
                }
                DirectoryEntry::Link { next_directory } => {
                    directory = next_directory;
                    index = 0;
                }
                DirectoryEntry::End => break,
            }
        }
        Ok(())
    }

    // ───────────────────────── close protocol ───────────────────────────

    /// Stamps the end time, recomputes the checksum and clears the dirty
    /// flag. A store opened read-only is left untouched.
    pub fn finalize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.header.dirty {
            return Ok(());
        }

        state.header.writer_version = WRITER_VERSION;
        state.header.end_time = now_timestamp();
        state.header.update_checksum();
        state.header.dirty = false;

        let bytes = serialize_file_header(&state.header);
        self.file.write_all_at(&bytes, 0)?;
        self.file.sync_all()?;
        state.dirty_on_disk = false;
        state.read_mode = true;

        debug!(path = ?self.path, "Store header finalised");
        Ok(())
    }
}
