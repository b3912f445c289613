// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Simutrace storage server core: clients append trace entries to
//! append-only streams; the server buffers them in 64 MiB segments,
//! encodes each segment (generic compression or the VPC4 memory-trace
//! codec) and persists them into a Simtrace v3 container. Readers open
//! streams by cycle count, wall time, entry index or sequence number and
//! stream decoded segments back.

pub mod config;
pub mod entries;
pub mod error;
pub mod protocol;
pub mod server;
pub mod simtrace;
pub mod storage;
pub mod types;
pub mod worker;

mod hashing;

pub use config::Config;
pub use error::{Result, SimutraceError};
pub use server::StorageServer;
