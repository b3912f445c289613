// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Store integration tests: container round trips, enumeration, dirty
//! recovery refusal and the request dispatch path.
//!
//! Run with: `cargo test`

use std::sync::Arc;

use tempfile::TempDir;

use simutrace::config::Config;
use simutrace::error::SimutraceError;
use simutrace::protocol::{Request, Response};
use simutrace::simtrace::container::Simtrace3File;
use simutrace::types::{
    make_variable_entry_size, QueryIndexType, SessionId, StreamAccessFlags, StreamDescriptor,
    INVALID_SESSION_ID,
};
use simutrace::StorageServer;

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.store.simtrace.root = dir.path().to_path_buf();
    config
}

fn write_u64_segment(
    stream: &Arc<simutrace::storage::stream::Stream>,
    session: SessionId,
    values: &[u64],
) -> u32 {
    let (sqn, segment) = stream.append(session, None).expect("append");
    let pool = stream.buffer();

    let payload = pool.segment_mut(segment);
    for (i, value) in values.iter().enumerate() {
        payload[i * 8..(i + 1) * 8].copy_from_slice(&value.to_le_bytes());
    }
    pool.update_control(segment, |control| {
        control.raw_entry_count = values.len() as u32;
    });
    sqn
}

#[test]
fn test_store_round_trip_with_generic_encoder() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:roundtrip.sim", true).expect("create store");
    let store = server.session_store(session).expect("store");

    let descriptor = StreamDescriptor::new("My Data Stream", 8, false);
    let stream_id = store.register_stream(descriptor, 0).expect("register");
    let stream = store.get_stream(stream_id).expect("stream");

    let values: Vec<u64> = (0..10_000u64).map(|i| i.wrapping_mul(0x9E37_79B9)).collect();
    let sqn = write_u64_segment(&stream, session, &values);
    assert_eq!(sqn, 0);

    stream.close(session, sqn, None, false).expect("close segment");
    server.close_store(session).expect("close store");

    // Reopen and read everything back.
    server.open_store(session, "simtrace:roundtrip.sim").expect("open store");
    let store = server.session_store(session).expect("store");
    let stream = store
        .enumerate_streams(false)
        .into_iter()
        .find(|s| s.name() == "My Data Stream")
        .expect("stream after reopen");

    let info = stream.query_information();
    assert_eq!(info.stats.entry_count, values.len() as u64);
    assert_eq!(info.stats.raw_entry_count, values.len() as u64);
    assert_eq!(info.descriptor.type_desc.entry_size, 8);

    let (open_sqn, segment) = stream
        .open(
            session,
            QueryIndexType::Index,
            0,
            StreamAccessFlags::SYNCHRONOUS,
            None,
        )
        .expect("open");
    assert_eq!(open_sqn, Some(0));

    let control = stream.buffer().control(segment);
    assert_eq!(control.raw_entry_count, values.len() as u32);

    let payload = stream.buffer().segment(segment);
    for (i, value) in values.iter().enumerate() {
        let read = u64::from_le_bytes(payload[i * 8..(i + 1) * 8].try_into().expect("u64"));
        assert_eq!(read, *value, "entry {i}");
    }

    stream.close(session, 0, None, false).expect("close read");
    assert!(stream.is_idle(), "no references may remain after the close");
    assert_eq!(stream.buffer_mapping(0), simutrace::types::INVALID_SEGMENT_ID);

    server.close_store(session).expect("close store again");
}

#[test]
fn test_multi_segment_ordering_and_index_queries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:ordered.sim", true).expect("create store");
    let store = server.session_store(session).expect("store");

    let stream_id = store
        .register_stream(StreamDescriptor::new("ordered", 8, false), 0)
        .expect("register");
    let stream = store.get_stream(stream_id).expect("stream");

    let per_segment = 1000u64;
    for segment in 0..3u64 {
        let values: Vec<u64> =
            (segment * per_segment..(segment + 1) * per_segment).collect();
        write_u64_segment(&stream, session, &values);
    }
    stream.close(session, 2, None, false).expect("close last");
    server.close_store(session).expect("close");

    server.open_store(session, "simtrace:ordered.sim").expect("open");
    let store = server.session_store(session).expect("store");
    let stream = store
        .enumerate_streams(false)
        .into_iter()
        .find(|s| s.name() == "ordered")
        .expect("stream");

    // Entry-index queries resolve to the covering segment.
    for (value, expected_sqn) in [(0u64, 0u32), (999, 0), (1000, 1), (2500, 2)] {
        let (sqn, segment) = stream
            .open(session, QueryIndexType::Index, value, StreamAccessFlags::SYNCHRONOUS, None)
            .expect("open by index");
        assert_eq!(sqn, Some(expected_sqn), "index value {value}");

        let control = stream.buffer().control(segment);
        assert_eq!(control.start_index, expected_sqn as u64 * per_segment);
        stream.close(session, expected_sqn, None, false).expect("close");
    }

    // Out-of-range values are NotFound, not in-progress.
    let result = stream.open(
        session,
        QueryIndexType::Index,
        3 * per_segment,
        StreamAccessFlags::SYNCHRONOUS,
        None,
    );
    assert!(matches!(result, Err(SimutraceError::NotFound(_))));

    server.close_store(session).expect("close");
}

#[test]
fn test_variable_size_stream_round_trips_strings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:strings.sim", true).expect("create store");
    let store = server.session_store(session).expect("store");

    let descriptor =
        StreamDescriptor::new("String Stream", make_variable_entry_size(64), false);
    let stream_id = store.register_stream(descriptor, 0).expect("register");
    let stream = store.get_stream(stream_id).expect("stream");

    let strings: [&[u8]; 3] = [&[b'a'; 155], &[b'b'; 56], &[b'c'; 82]];
    let repetitions = 2000usize;

    let (sqn, segment) = stream.append(session, None).expect("append");
    let pool = stream.buffer();
    let payload = pool.segment_mut(segment);

    let mut written = 0usize;
    for i in 0..repetitions {
        let data = strings[i % 3];
        payload[written..written + data.len()].copy_from_slice(data);
        written += data.len();
    }
    pool.update_control(segment, |control| {
        control.raw_entry_count = written as u32;
        control.entry_count = repetitions as u32;
    });

    stream.close(session, sqn, None, false).expect("close");
    server.close_store(session).expect("close store");

    server.open_store(session, "simtrace:strings.sim").expect("open store");
    let store = server.session_store(session).expect("store");
    let stream = store
        .enumerate_streams(false)
        .into_iter()
        .find(|s| s.name() == "String Stream")
        .expect("stream");

    let info = stream.query_information();
    assert_eq!(info.stats.entry_count, repetitions as u64);
    assert_eq!(info.stats.raw_entry_count, written as u64);

    let (open_sqn, segment) = stream
        .open(session, QueryIndexType::SequenceNumber, 0, StreamAccessFlags::SYNCHRONOUS, None)
        .expect("open");
    assert_eq!(open_sqn, Some(0));

    let control = stream.buffer().control(segment);
    assert_eq!(control.raw_entry_count as usize, written);

    let payload = stream.buffer().segment(segment);
    let mut offset = 0usize;
    for i in 0..repetitions {
        let expected = strings[i % 3];
        assert_eq!(&payload[offset..offset + expected.len()], expected, "string {i}");
        offset += expected.len();
    }

    stream.close(session, 0, None, false).expect("close read");
    server.close_store(session).expect("close store");
}

#[test]
fn test_enumerate_streams_after_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:enum.sim", true).expect("create store");
    let store = server.session_store(session).expect("store");

    let names = ["Memory Stream", "My Data Stream", "String Stream"];
    let sizes = [24u32, 8, make_variable_entry_size(16)];
    for (name, size) in names.iter().zip(sizes.iter()) {
        store
            .register_stream(StreamDescriptor::new(name, *size, false), 0)
            .expect("register");
    }
    server.close_store(session).expect("close");

    server.open_store(session, "simtrace:enum.sim").expect("open");
    let store = server.session_store(session).expect("store");

    let streams = store.enumerate_streams(false);
    let mut found: Vec<(String, u32)> = streams
        .iter()
        .map(|s| (s.name().to_string(), s.descriptor().type_desc.entry_size))
        .collect();
    found.sort();

    let mut expected: Vec<(String, u32)> = names
        .iter()
        .zip(sizes.iter())
        .map(|(n, s)| (n.to_string(), *s))
        .collect();
    expected.sort();

    assert_eq!(found, expected);
    server.close_store(session).expect("close");
}

#[test]
fn test_store_enumeration_lists_sim_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:first.sim", true).expect("create");
    server.close_store(session).expect("close");
    server.create_store(session, "simtrace:second.sim", true).expect("create");
    server.close_store(session).expect("close");

    std::fs::write(dir.path().join("ignored.txt"), b"not a store").expect("write");

    let stores = server.enumerate_stores().expect("enumerate");
    assert_eq!(stores, vec!["simtrace:first.sim".to_string(), "simtrace:second.sim".to_string()]);
}

#[test]
fn test_double_store_close_is_an_error_not_corruption() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:double.sim", true).expect("create");
    server.close_store(session).expect("first close");

    let result = server.close_store(session);
    assert!(matches!(result, Err(SimutraceError::InvalidOperation(_))));

    // The store is still reopenable afterwards.
    server.open_store(session, "simtrace:double.sim").expect("reopen");
    server.close_store(session).expect("close");
}

#[test]
fn test_dirty_store_is_refused_on_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("dirty.sim");

    {
        // Created but never finalised: the dirty flag stays set on disk.
        let container = Simtrace3File::create(&path).expect("create");
        let mut frame = simutrace::simtrace::frame::Frame::new(
            0,
            simutrace::types::TypeGuid::ZERO,
            None,
        );
        frame
            .add_attribute(
                simutrace::simtrace::format::SAT_STREAM_DESCRIPTION,
                bytes::Bytes::from(simutrace::simtrace::format::serialize_stream_descriptor(
                    &StreamDescriptor::new("doomed", 8, false),
                )),
            )
            .expect("attribute");
        container.commit_frame(&mut frame).expect("commit");
        // Dropped without finalize().
    }

    let result = Simtrace3File::open(&path);
    assert!(matches!(result, Err(SimutraceError::Corruption(_))));
}

#[test]
fn test_opened_store_refuses_new_streams() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:sealed.sim", true).expect("create");
    let store = server.session_store(session).expect("store");
    store
        .register_stream(StreamDescriptor::new("data", 8, false), 0)
        .expect("register");
    server.close_store(session).expect("close");

    server.open_store(session, "simtrace:sealed.sim").expect("open");
    let store = server.session_store(session).expect("store");
    assert!(store.is_read_only());

    let result = store.register_stream(StreamDescriptor::new("late", 8, false), 0);
    assert!(matches!(result, Err(SimutraceError::InvalidOperation(_))));
    server.close_store(session).expect("close");
}

#[test]
fn test_dispatch_drives_a_full_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");

    let session = match server
        .dispatch(INVALID_SESSION_ID, Request::SessionCreate)
        .expect("session create")
    {
        Response::SessionCreated(id) => id,
        other => panic!("unexpected response {other:?}"),
    };

    server
        .dispatch(session, Request::StoreCreate { path: "simtrace:rpc.sim".into(), overwrite: true })
        .expect("store create");

    let stream = match server
        .dispatch(
            session,
            Request::StreamRegister {
                descriptor: StreamDescriptor::new("rpc stream", 8, false),
                buffer: 0,
            },
        )
        .expect("stream register")
    {
        Response::StreamRegistered(id) => id,
        other => panic!("unexpected response {other:?}"),
    };

    // Buffer surface: the store always has its client pool 0.
    match server.dispatch(session, Request::StreamBufferEnumerate).expect("buffers") {
        Response::BufferList(buffers) => assert_eq!(buffers, vec![0]),
        other => panic!("unexpected response {other:?}"),
    }
    match server
        .dispatch(session, Request::StreamBufferQuery { buffer: 0 })
        .expect("buffer query")
    {
        Response::BufferInfo { segment_size, .. } => {
            assert_eq!(segment_size, simutrace::types::SEGMENT_SIZE as u64)
        }
        other => panic!("unexpected response {other:?}"),
    }

    let (sqn, segment) = match server
        .dispatch(session, Request::StreamAppend { stream })
        .expect("append")
    {
        Response::SegmentAppended { sequence_number, segment } => (sequence_number, segment),
        other => panic!("unexpected response {other:?}"),
    };
    assert_eq!(sqn, 0);

    {
        let store = server.session_store(session).expect("store");
        let stream = store.get_stream(stream).expect("stream");
        let pool = stream.buffer();
        pool.segment_mut(segment)[..8].copy_from_slice(&0xABAD_CAFEu64.to_le_bytes());
        pool.update_control(segment, |control| control.raw_entry_count = 1);
    }

    server
        .dispatch(session, Request::StreamClose { stream, sequence_number: sqn })
        .expect("segment close");
    server.dispatch(session, Request::StoreClose).expect("store close");

    // Reopen through the same surface and read the entry back.
    server
        .dispatch(session, Request::StoreOpen { path: "simtrace:rpc.sim".into() })
        .expect("store open");

    let streams = match server
        .dispatch(session, Request::StreamEnumerate { include_hidden: false })
        .expect("enumerate")
    {
        Response::StreamList(streams) => streams,
        other => panic!("unexpected response {other:?}"),
    };
    assert_eq!(streams.len(), 1);

    match server
        .dispatch(
            session,
            Request::StreamCloseAndOpen {
                stream: streams[0],
                query: QueryIndexType::SequenceNumber,
                value: 0,
                flags: StreamAccessFlags::SYNCHRONOUS,
            },
        )
        .expect("open")
    {
        Response::SegmentOpened { sequence_number, segment } => {
            assert_eq!(sequence_number, Some(0));
            let store = server.session_store(session).expect("store");
            let stream = store.get_stream(streams[0]).expect("stream");
            let payload = stream.buffer().segment(segment);
            assert_eq!(
                u64::from_le_bytes(payload[..8].try_into().expect("u64")),
                0xABAD_CAFE
            );
        }
        other => panic!("unexpected response {other:?}"),
    }

    match server.dispatch(session, Request::StreamQuery { stream: streams[0] }).expect("query") {
        Response::StreamInfo(info) => assert_eq!(info.stats.entry_count, 1),
        other => panic!("unexpected response {other:?}"),
    }

    server.dispatch(session, Request::StoreClose).expect("store close");
    server.dispatch(session, Request::SessionClose).expect("session close");
}

#[test]
fn test_unknown_config_key_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    let ok = server.dispatch(
        session,
        Request::SessionSetConfig {
            key: "server.memmgmt.readAhead".into(),
            value: "2".into(),
        },
    );
    assert!(ok.is_ok());

    let bad = server.dispatch(
        session,
        Request::SessionSetConfig { key: "server.bogus".into(), value: "1".into() },
    );
    assert!(matches!(bad, Err(SimutraceError::Config(_))));
}
