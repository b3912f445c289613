// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Wire-facing request/response contract. The transport (sockets, shared
//! memory handle passing, framing) lives outside this crate; it hands the
//! core a decoded request and ships the typed response or error back.

use std::sync::Arc;

use crate::error::{Result, SimutraceError};
use crate::server::StorageServer;
use crate::types::{
    BufferId, QueryIndexType, SegmentId, SessionId, StoreId, StreamAccessFlags, StreamDescriptor,
    StreamId, StreamQueryInformation, StreamSegmentId, INVALID_SESSION_ID,
};

/// Configuration keys a session may override.
const RECOGNISED_CONFIG_KEYS: &[&str] = &[
    "store.simtrace.root",
    "store.simtrace.logStreamStats",
    "server.memmgmt.disableCache",
    "server.memmgmt.readAhead",
    "server.memmgmt.retryCount",
    "server.memmgmt.retrySleep",
    "server.session.closeTimeout",
    "client.memmgmt.poolSize",
];

#[derive(Debug, Clone)]
pub enum Request {
    SessionCreate,
    SessionClose,
    SessionSetConfig { key: String, value: String },

    StoreCreate { path: String, overwrite: bool },
    StoreOpen { path: String },
    StoreClose,

    StreamBufferRegister { num_segments: u32 },
    StreamBufferEnumerate,
    StreamBufferQuery { buffer: BufferId },

    StreamRegister { descriptor: StreamDescriptor, buffer: BufferId },
    StreamEnumerate { include_hidden: bool },
    StreamQuery { stream: StreamId },

    StreamAppend { stream: StreamId },
    StreamCloseAndOpen {
        stream: StreamId,
        query: QueryIndexType,
        value: u64,
        flags: StreamAccessFlags,
    },
    StreamClose { stream: StreamId, sequence_number: StreamSegmentId },
}

#[derive(Debug)]
pub enum Response {
    Done,
    SessionCreated(SessionId),
    StoreAttached(StoreId),
    BufferRegistered(BufferId),
    BufferList(Vec<BufferId>),
    BufferInfo { buffer: BufferId, num_segments: u32, segment_size: u64 },
    StreamRegistered(StreamId),
    StreamList(Vec<StreamId>),
    StreamInfo(Box<StreamQueryInformation>),
    SegmentAppended { sequence_number: StreamSegmentId, segment: SegmentId },
    SegmentOpened { sequence_number: Option<StreamSegmentId>, segment: SegmentId },
}

impl StorageServer {
    /// Executes one request on behalf of `session`. `SessionCreate` is the
    /// only request valid without a session (pass `INVALID_SESSION_ID`).
    pub fn dispatch(self: &Arc<Self>, session: SessionId, request: Request) -> Result<Response> {
        match request {
            Request::SessionCreate => {
                if session != INVALID_SESSION_ID {
                    return Err(SimutraceError::InvalidOperation(
                        "session already established".into(),
                    ));
                }
                Ok(Response::SessionCreated(self.create_session()))
            }
            Request::SessionClose => {
                self.close_session(session)?;
                Ok(Response::Done)
            }
            Request::SessionSetConfig { key, value } => {
                if !RECOGNISED_CONFIG_KEYS.contains(&key.as_str()) {
                    return Err(SimutraceError::Config(format!(
                        "unrecognised configuration key '{key}'"
                    )));
                }
                self.with_session(session, |state| {
                    state.config_overrides.insert(key, value);
                    Ok(())
                })?;
                Ok(Response::Done)
            }

            Request::StoreCreate { path, overwrite } => {
                let id = self.create_store(session, &path, overwrite)?;
                Ok(Response::StoreAttached(id))
            }
            Request::StoreOpen { path } => {
                let id = self.open_store(session, &path)?;
                Ok(Response::StoreAttached(id))
            }
            Request::StoreClose => {
                self.close_store(session)?;
                Ok(Response::Done)
            }

            Request::StreamBufferRegister { num_segments } => {
                let store = self.session_store(session)?;
                let id = store.register_buffer(num_segments, self.config())?;
                Ok(Response::BufferRegistered(id))
            }
            Request::StreamBufferEnumerate => {
                let store = self.session_store(session)?;
                let buffers = store.enumerate_buffers().iter().map(|b| b.id()).collect();
                Ok(Response::BufferList(buffers))
            }
            Request::StreamBufferQuery { buffer } => {
                let store = self.session_store(session)?;
                let pool = store.buffer(buffer)?;
                Ok(Response::BufferInfo {
                    buffer,
                    num_segments: pool.num_segments(),
                    segment_size: pool.segment_size() as u64,
                })
            }

            Request::StreamRegister { descriptor, buffer } => {
                let store = self.session_store(session)?;
                if descriptor.hidden {
                    return Err(SimutraceError::Argument(
                        "descriptor".into(),
                        "hidden streams are reserved for encoders".into(),
                    ));
                }
                let id = store.register_stream(descriptor, buffer)?;
                Ok(Response::StreamRegistered(id))
            }
            Request::StreamEnumerate { include_hidden } => {
                let store = self.session_store(session)?;
                let streams =
                    store.enumerate_streams(include_hidden).iter().map(|s| s.id()).collect();
                Ok(Response::StreamList(streams))
            }
            Request::StreamQuery { stream } => {
                let store = self.session_store(session)?;
                let stream = store.get_stream(stream)?;
                Ok(Response::StreamInfo(Box::new(stream.query_information())))
            }

            Request::StreamAppend { stream } => {
                let store = self.session_store(session)?;
                let stream = store.get_stream(stream)?;
                let (sequence_number, segment) = stream.append(session, None)?;
                Ok(Response::SegmentAppended { sequence_number, segment })
            }
            Request::StreamCloseAndOpen { stream, query, value, flags } => {
                let store = self.session_store(session)?;
                let stream_arc = store.get_stream(stream)?;

                // Release the segment this session still holds on the
                // stream before moving the read cursor.
                let previous = self.with_session(session, |state| {
                    Ok(state.open_segments.remove(&stream))
                })?;
                if let Some(previous) = previous {
                    stream_arc.close(session, previous, None, false)?;
                }

                let (sequence_number, segment) =
                    stream_arc.open(session, query, value, flags, None)?;
                if let Some(sqn) = sequence_number {
                    self.with_session(session, |state| {
                        state.open_segments.insert(stream, sqn);
                        Ok(())
                    })?;
                }
                Ok(Response::SegmentOpened { sequence_number, segment })
            }
            Request::StreamClose { stream, sequence_number } => {
                let store = self.session_store(session)?;
                let stream_arc = store.get_stream(stream)?;
                stream_arc.close(session, sequence_number, None, false)?;
                self.with_session(session, |state| {
                    if state.open_segments.get(&stream) == Some(&sequence_number) {
                        state.open_segments.remove(&stream);
                    }
                    Ok(())
                })?;
                Ok(Response::Done)
            }
        }
    }
}
