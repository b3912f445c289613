// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Buffer pool behaviour: cookie validation, empty-segment drops, the
//! standby cache and allocation backpressure.

use std::sync::Arc;

use tempfile::TempDir;

use simutrace::config::Config;
use simutrace::error::SimutraceError;
use simutrace::storage::stream::Stream;
use simutrace::types::{QueryIndexType, SessionId, StreamAccessFlags, StreamDescriptor};
use simutrace::worker::StreamWait;
use simutrace::StorageServer;

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.store.simtrace.root = dir.path().to_path_buf();
    config
}

fn write_values(stream: &Arc<Stream>, session: SessionId, values: &[u64]) -> u32 {
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
fn test_cookie_tamper_is_fatal_for_the_segment() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:tamper.sim", true).expect("create");
    let store = server.session_store(session).expect("store");
    let id = store
        .register_stream(StreamDescriptor::new("tamper", 8, false), 0)
        .expect("register");
    let stream = store.get_stream(id).expect("stream");

    let (sqn, segment) = stream.append(session, None).expect("append");
    let pool = stream.buffer();
    pool.segment_mut(segment)[..8].copy_from_slice(&42u64.to_le_bytes());
    pool.update_control(segment, |control| {
        control.raw_entry_count = 1;
        // A stale client redirecting its segment to another stream must
        // be caught by the cookie.
        control.link.sequence_number = control.link.sequence_number.wrapping_add(7);
    });

    let result = stream.close(session, sqn, None, false);
    assert!(matches!(result, Err(SimutraceError::Corruption(_))));
    assert!(store.is_read_only(), "cookie corruption must force the store read-only");
}

#[test]
fn test_empty_segment_is_dropped_silently() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:empty.sim", true).expect("create");
    let store = server.session_store(session).expect("store");
    let id = store
        .register_stream(StreamDescriptor::new("empty", 8, false), 0)
        .expect("register");
    let stream = store.get_stream(id).expect("stream");

    let (sqn, _segment) = stream.append(session, None).expect("append");
    stream.close(session, sqn, None, false).expect("close");

    let info = stream.query_information();
    assert_eq!(info.stats.entry_count, 0);
    assert_eq!(info.stats.raw_entry_count, 0);

    // The dropped sequence number is not openable.
    let result = stream.open(
        session,
        QueryIndexType::SequenceNumber,
        sqn as u64,
        StreamAccessFlags::SYNCHRONOUS,
        None,
    );
    assert!(matches!(result, Err(SimutraceError::NotFound(_))));

    server.close_store(session).expect("close");
}

#[test]
fn test_standby_cache_returns_the_same_slot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:cache.sim", true).expect("create");
    let store = server.session_store(session).expect("store");
    let id = store
        .register_stream(StreamDescriptor::new("cached", 8, false), 0)
        .expect("register");
    let stream = store.get_stream(id).expect("stream");

    let values: Vec<u64> = (0..512u64).collect();
    let sqn = write_values(&stream, session, &values);

    let wait = Arc::new(StreamWait::new());
    stream.close(session, sqn, Some(&wait), false).expect("close");
    assert!(wait.wait());

    // The encoded slot went to the standby cache; the first open must hit
    // it without a decode.
    let pool = stream.buffer();
    assert!(pool.standby_len() > 0, "freed segment should be cached");

    let (open_sqn, first_slot) = stream
        .open(session, QueryIndexType::SequenceNumber, 0, StreamAccessFlags::SYNCHRONOUS, None)
        .expect("first open");
    assert_eq!(open_sqn, Some(0));
    stream.close(session, 0, None, false).expect("close first");

    let (_, second_slot) = stream
        .open(session, QueryIndexType::SequenceNumber, 0, StreamAccessFlags::SYNCHRONOUS, None)
        .expect("second open");
    assert_eq!(first_slot, second_slot, "cache hit must reuse the cached slot");

    let payload = pool.segment(second_slot);
    for (i, value) in values.iter().enumerate() {
        let read = u64::from_le_bytes(payload[i * 8..(i + 1) * 8].try_into().expect("u64"));
        assert_eq!(read, *value);
    }

    stream.close(session, 0, None, false).expect("close second");
    server.close_store(session).expect("close store");
}

#[test]
fn test_read_ahead_serves_the_following_segments() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:scan.sim", true).expect("create");
    let store = server.session_store(session).expect("store");
    let id = store
        .register_stream(StreamDescriptor::new("scan", 8, false), 0)
        .expect("register");
    let stream = store.get_stream(id).expect("stream");

    for segment in 0..3u64 {
        let values: Vec<u64> = (segment * 100..(segment + 1) * 100).collect();
        write_values(&stream, session, &values);
    }
    let wait = Arc::new(StreamWait::new());
    stream.close(session, 2, Some(&wait), false).expect("close last");
    assert!(wait.wait());

    // A sequential scan prefetches the following segments; every segment
    // must still come back intact no matter whether the prefetch or the
    // explicit open wins the race.
    let mut expected = 0u64;
    let mut sqn = 0u32;
    loop {
        let open_wait = Arc::new(StreamWait::new());
        let (open_sqn, segment) = stream
            .open(
                session,
                QueryIndexType::SequenceNumber,
                sqn as u64,
                StreamAccessFlags::SYNCHRONOUS | StreamAccessFlags::SEQUENTIAL_SCAN,
                Some(&open_wait),
            )
            .expect("open");
        match open_sqn {
            Some(resolved) => assert_eq!(resolved, sqn),
            None => {
                // A prefetch for this segment is still in flight; the
                // reference was taken over, so just wait it out.
                assert!(open_wait.wait());
            }
        }

        let payload = stream.buffer().segment(segment);
        for i in 0..100usize {
            let read = u64::from_le_bytes(payload[i * 8..(i + 1) * 8].try_into().expect("u64"));
            assert_eq!(read, expected, "segment {sqn} entry {i}");
            expected += 1;
        }
        stream.close(session, sqn, None, false).expect("close");

        if sqn == 2 {
            break;
        }
        sqn += 1;
    }
    assert_eq!(expected, 300);

    server.close_store(session).expect("close store");
}

#[test]
fn test_backpressure_with_more_producers_than_segments() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StorageServer::new(test_config(&dir)).expect("server");
    let session = server.create_session();

    server.create_store(session, "simtrace:pressure.sim", true).expect("create");
    let store = server.session_store(session).expect("store");

    const PRODUCERS: usize = 5;
    const APPENDS: usize = 3;
    const VALUES: usize = 1000;

    let streams: Vec<Arc<Stream>> = (0..PRODUCERS)
        .map(|i| {
            let id = store
                .register_stream(StreamDescriptor::new(&format!("producer{i}"), 8, false), 0)
                .expect("register");
            store.get_stream(id).expect("stream")
        })
        .collect();

    std::thread::scope(|scope| {
        for stream in &streams {
            scope.spawn(move || {
                let mut last_sqn = 0u32;
                for round in 0..APPENDS {
                    let values: Vec<u64> =
                        (0..VALUES as u64).map(|v| v + round as u64 * VALUES as u64).collect();
                    loop {
                        match stream.append(session, None) {
                            Ok((sqn, segment)) => {
                                let pool = stream.buffer();
                                let payload = pool.segment_mut(segment);
                                for (i, value) in values.iter().enumerate() {
                                    payload[i * 8..(i + 1) * 8]
                                        .copy_from_slice(&value.to_le_bytes());
                                }
                                pool.update_control(segment, |control| {
                                    control.raw_entry_count = values.len() as u32;
                                });
                                last_sqn = sqn;
                                break;
                            }
                            Err(e) if e.is_retryable() => {
                                std::thread::sleep(std::time::Duration::from_millis(50));
                            }
                            Err(e) => panic!("append failed: {e}"),
                        }
                    }
                }

                let wait = Arc::new(StreamWait::new());
                stream.close(session, last_sqn, Some(&wait), false).expect("close");
                assert!(wait.wait(), "pending encodes must succeed");
            });
        }
    });

    // No submitted segment may be lost.
    for stream in &streams {
        let info = stream.query_information();
        assert_eq!(info.stats.entry_count, (APPENDS * VALUES) as u64, "{}", stream.name());
    }

    let retry_limit =
        server.config().server.memmgmt.retry_count as u64 * (PRODUCERS * APPENDS) as u64;
    assert!(
        store.buffer(0).expect("pool").allocation_retries() <= retry_limit,
        "allocation retries exceeded the configured backoff limit"
    );

    server.close_store(session).expect("close store");
}
