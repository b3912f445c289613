// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Simtrace v3 backend — container format, frame codec and the encoder
//! implementations.

pub mod container;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod memory;
pub mod vpc4;
