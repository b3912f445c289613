// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Memory-trace encoder tests: VPC4 round trips through a full store
//! lifecycle, append-close holes and the hidden stream accounting.

use std::sync::Arc;

use tempfile::TempDir;

use simutrace::config::Config;
use simutrace::entries::{
    find_memory_type, ArchitectureSize, DataWrite64, MemoryAccessMetaData, MemoryAccessType,
    MemoryAddressType, Write32,
};
use simutrace::error::SimutraceError;
use simutrace::storage::stream::Stream;
use simutrace::types::{
    QueryIndexType, SessionId, StreamAccessFlags, StreamDescriptor,
};
use simutrace::worker::StreamWait;
use simutrace::StorageServer;

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.store.simtrace.root = dir.path().to_path_buf();
    config
}

/// Writer formula shared by the round-trip tests; `i` is the global entry
/// index.
fn make_entry(i: u64) -> DataWrite64 {
    DataWrite64 {
        metadata: MemoryAccessMetaData::new(i, true, (i % 7) as u16),
        ip: 0xFFFF_F780_0000_0000u64 + (i % 16),
        address: i,
        data: 0x0123_4567_89AB_CDEFu64.wrapping_mul(i),
    }
}

/// Appends one segment filled with entries `[start, start + count)`.
fn write_segment(stream: &Arc<Stream>, session: SessionId, start: u64, count: u64) -> u32 {
    let (sqn, segment) = stream.append(session, None).expect("append");
    let pool = stream.buffer();

    let payload = pool.segment_mut(segment);
    let entries: &mut [DataWrite64] =
        bytemuck::cast_slice_mut(&mut payload[..count as usize * std::mem::size_of::<DataWrite64>()]);
    for (offset, entry) in entries.iter_mut().enumerate() {
        *entry = make_entry(start + offset as u64);
    }

    pool.update_control(segment, |control| {
        control.raw_entry_count = count as u32;
    });
    sqn
}

/// Performs one empty append/close cycle, leaving a sequence-number hole.
fn append_close_empty(stream: &Arc<Stream>, session: SessionId) {
    let (sqn, _segment) = stream.append(session, None).expect("append");
    stream.close(session, sqn, None, false).expect("close empty");
}

/// Opens a segment and, when a prefetch is still in flight, waits for it.
/// The reference is held either way; the resolved sequence number comes
/// from the slot's control element.
fn open_blocking(
    stream: &Arc<Stream>,
    session: SessionId,
    query: QueryIndexType,
    value: u64,
    flags: StreamAccessFlags,
) -> Result<(u32, u32), SimutraceError> {
    let wait = Arc::new(StreamWait::new());
    let (sqn, segment) = stream.open(session, query, value, flags, Some(&wait))?;
    match sqn {
        Some(sqn) => Ok((sqn, segment)),
        None => {
            assert_ne!(segment, simutrace::types::INVALID_SEGMENT_ID, "open failed");
            assert!(wait.wait(), "pending load reported errors");
            let control = stream.buffer().control(segment);
            Ok((control.link.sequence_number, segment))
        }
    }
}

/// Reads all entries back in order, hopping valid sequence numbers.
fn read_all_entries(stream: &Arc<Stream>, session: SessionId) -> Vec<DataWrite64> {
    let mut entries = Vec::new();
    let flags = StreamAccessFlags::SYNCHRONOUS | StreamAccessFlags::SEQUENTIAL_SCAN;

    let (mut sqn, mut segment) =
        open_blocking(stream, session, QueryIndexType::Index, 0, flags).expect("open first");

    loop {
        let control = stream.buffer().control(segment);
        let count = control.raw_entry_count as usize;
        let payload = stream.buffer().segment(segment);
        let decoded: &[DataWrite64] =
            bytemuck::cast_slice(&payload[..count * std::mem::size_of::<DataWrite64>()]);
        entries.extend_from_slice(decoded);

        stream.close(session, sqn, None, false).expect("close segment");

        match open_blocking(
            stream,
            session,
            QueryIndexType::NextValidSequenceNumber,
            sqn as u64,
            flags,
        ) {
            Ok((next, next_segment)) => {
                sqn = next;
                segment = next_segment;
            }
            Err(SimutraceError::NotFound(_)) => break,
            Err(e) => panic!("ordered read failed: {e}"),
        }
    }

    entries
}

fn register_memory_stream(server: &Arc<StorageServer>, session: SessionId) -> Arc<Stream> {
    let store = server.session_store(session).expect("store");
    let mstype = find_memory_type(
        ArchitectureSize::As64Bit,
        MemoryAccessType::Write,
        MemoryAddressType::Virtual,
        true,
    );
    let descriptor = StreamDescriptor::with_type("Memory Stream", mstype.descriptor());
    let id = store.register_stream(descriptor, 0).expect("register");
    store.get_stream(id).expect("stream")
}

#[test]
fn test_memory_round_trip_single_segment() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:memory.sim", true).expect("create store");
    let stream = register_memory_stream(&server, session);

    let count = 50_000u64;
    let sqn = write_segment(&stream, session, 0, count);

    let wait = Arc::new(StreamWait::new());
    stream.close(session, sqn, Some(&wait), false).expect("close");
    assert!(wait.wait(), "segment encoding reported errors");

    server.close_store(session).expect("close store");

    server.open_store(session, "simtrace:memory.sim").expect("open store");
    let store = server.session_store(session).expect("store");
    let stream = store
        .enumerate_streams(false)
        .into_iter()
        .find(|s| s.name() == "Memory Stream")
        .expect("stream");

    let info = stream.query_information();
    assert_eq!(info.stats.entry_count, count);
    assert_eq!(info.stats.raw_entry_count, count);
    assert!(info.stats.compressed_size > 0, "hidden stream sizes must be reported");

    let entries = read_all_entries(&stream, session);
    assert_eq!(entries.len(), count as usize);
    for (i, entry) in entries.iter().enumerate() {
        let expected = make_entry(i as u64);
        let (entry_ip, entry_address, entry_data, entry_metadata) =
            (entry.ip, entry.address, entry.data, entry.metadata);
        let (expected_ip, expected_address, expected_data, expected_metadata) =
            (expected.ip, expected.address, expected.data, expected.metadata);
        assert_eq!(entry_ip, expected_ip, "ip of entry {i}");
        assert_eq!(entry_address, expected_address, "address of entry {i}");
        assert_eq!(entry_data, expected_data, "data of entry {i}");
        assert_eq!(
            entry_metadata.cycle_count(),
            expected_metadata.cycle_count(),
            "cycle of entry {i}"
        );
        assert_eq!(entry_metadata.tag(), expected_metadata.tag(), "tag of entry {i}");
        assert_eq!(entry_metadata.full_size(), expected_metadata.full_size());
    }

    server.close_store(session).expect("close store");
}

#[test]
fn test_append_close_holes_do_not_surface() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:aca.sim", true).expect("create store");
    let stream = register_memory_stream(&server, session);

    // Write d0 entries, a0 empty append/close cycles, d1 entries, a1
    // cycles. The empty cycles burn sequence numbers that must never
    // surface to a reader.
    let d0 = 1500u64;
    let d1 = 2300u64;

    let sqn0 = write_segment(&stream, session, 0, d0);
    stream.close(session, sqn0, None, false).expect("close d0");

    for _ in 0..3 {
        append_close_empty(&stream, session);
    }

    let sqn1 = write_segment(&stream, session, d0, d1);
    assert!(sqn1 > sqn0 + 3, "empty cycles must consume sequence numbers");
    stream.close(session, sqn1, None, false).expect("close d1");

    for _ in 0..2 {
        append_close_empty(&stream, session);
    }
    assert_eq!(stream.last_sequence_number(), sqn1 + 2);

    server.close_store(session).expect("close store");

    server.open_store(session, "simtrace:aca.sim").expect("open store");
    let store = server.session_store(session).expect("store");
    let stream = store
        .enumerate_streams(false)
        .into_iter()
        .find(|s| s.name() == "Memory Stream")
        .expect("stream");

    let info = stream.query_information();
    assert_eq!(info.stats.entry_count, d0 + d1, "holes must not contribute entries");
    assert_eq!(
        stream.storage_location(sqn0).expect("location").raw_entry_count as u64,
        d0
    );
    assert!(
        stream.storage_location(sqn0 + 1).is_err(),
        "hole sequence numbers must stay absent"
    );

    let entries = read_all_entries(&stream, session);
    assert_eq!(entries.len(), (d0 + d1) as usize);
    for (i, entry) in entries.iter().enumerate() {
        let expected = make_entry(i as u64);
        let (entry_ip, entry_address, entry_data, entry_metadata) =
            (entry.ip, entry.address, entry.data, entry.metadata);
        let (expected_ip, expected_address, expected_data, expected_metadata) =
            (expected.ip, expected.address, expected.data, expected.metadata);
        assert_eq!(entry_ip, expected_ip, "ip of entry {i}");
        assert_eq!(entry_address, expected_address, "address of entry {i}");
        assert_eq!(entry_data, expected_data, "data of entry {i}");
        assert_eq!(entry_metadata.cycle_count(), expected_metadata.cycle_count());
    }

    server.close_store(session).expect("close store");
}

#[test]
fn test_memory_round_trip_32bit_layout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:mem32.sim", true).expect("create store");
    let store = server.session_store(session).expect("store");

    let mstype = find_memory_type(
        ArchitectureSize::As32Bit,
        MemoryAccessType::Write,
        MemoryAddressType::Physical,
        false,
    );
    let descriptor = StreamDescriptor::with_type("Memory Stream 32", mstype.descriptor());
    let id = store.register_stream(descriptor, 0).expect("register");
    let stream = store.get_stream(id).expect("stream");

    let count = 20_000usize;
    let (sqn, segment) = stream.append(session, None).expect("append");
    {
        let pool = stream.buffer();
        let payload = pool.segment_mut(segment);
        let entries: &mut [Write32] =
            bytemuck::cast_slice_mut(&mut payload[..count * std::mem::size_of::<Write32>()]);
        for (i, entry) in entries.iter_mut().enumerate() {
            *entry = Write32 {
                metadata: MemoryAccessMetaData::new(i as u64 * 3, false, (i % 11) as u16),
                ip: 0x0804_8000u32.wrapping_add((i % 32) as u32 * 4),
                address: 0x1000_0000u32.wrapping_add(i as u32 * 8),
            };
        }
        pool.update_control(segment, |control| {
            control.raw_entry_count = count as u32;
        });
    }
    stream.close(session, sqn, None, false).expect("close");
    server.close_store(session).expect("close store");

    server.open_store(session, "simtrace:mem32.sim").expect("open store");
    let store = server.session_store(session).expect("store");
    let stream = store
        .enumerate_streams(false)
        .into_iter()
        .find(|s| s.name() == "Memory Stream 32")
        .expect("stream");

    let (open_sqn, segment) = stream
        .open(session, QueryIndexType::SequenceNumber, 0, StreamAccessFlags::SYNCHRONOUS, None)
        .expect("open");
    assert_eq!(open_sqn, Some(0));

    let payload = stream.buffer().segment(segment);
    let entries: &[Write32] =
        bytemuck::cast_slice(&payload[..count * std::mem::size_of::<Write32>()]);
    for (i, entry) in entries.iter().enumerate() {
        let (entry_ip, entry_address, entry_metadata) = (entry.ip, entry.address, entry.metadata);
        assert_eq!(entry_ip, 0x0804_8000u32.wrapping_add((i % 32) as u32 * 4), "ip {i}");
        assert_eq!(entry_address, 0x1000_0000u32.wrapping_add(i as u32 * 8), "address {i}");
        assert_eq!(entry_metadata.cycle_count(), i as u64 * 3, "cycle {i}");
        assert_eq!(entry_metadata.tag(), (i % 11) as u16, "tag {i}");
    }

    stream.close(session, 0, None, false).expect("close read");
    server.close_store(session).expect("close store");
}

#[test]
fn test_hidden_streams_stay_hidden_and_are_restored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:hidden.sim", true).expect("create store");
    let stream = register_memory_stream(&server, session);

    let sqn = write_segment(&stream, session, 0, 1000);
    stream.close(session, sqn, None, false).expect("close");
    server.close_store(session).expect("close store");

    server.open_store(session, "simtrace:hidden.sim").expect("open store");
    let store = server.session_store(session).expect("store");

    let public = store.enumerate_streams(false);
    assert_eq!(public.len(), 1, "hidden streams must not enumerate");

    let all = store.enumerate_streams(true);
    // One public stream plus the hidden decomposition streams for a
    // 64-bit entry with data: meta, 4 id streams, 4 literal streams.
    assert_eq!(all.len(), 1 + 9);
    assert!(all
        .iter()
        .filter(|s| s.descriptor().hidden)
        .all(|s| s.name().starts_with("stream")));

    server.close_store(session).expect("close store");
}

#[test]
fn test_temporal_order_violation_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:badcycles.sim", true).expect("create store");
    let stream = register_memory_stream(&server, session);

    let (sqn, segment) = stream.append(session, None).expect("append");
    {
        let pool = stream.buffer();
        let payload = pool.segment_mut(segment);
        let entries: &mut [DataWrite64] =
            bytemuck::cast_slice_mut(&mut payload[..2 * std::mem::size_of::<DataWrite64>()]);
        // Reversed cycle counts between first and last entry.
        entries[0] = make_entry(100);
        entries[1] = make_entry(50);
        pool.update_control(segment, |control| {
            control.raw_entry_count = 2;
        });
    }

    let result = stream.close(session, sqn, None, false);
    assert!(matches!(result, Err(SimutraceError::Corruption(_))));
}
