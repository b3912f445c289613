// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

use crate::types::{StreamId, StreamSegmentId};

#[derive(Debug, Error)]
pub enum SimutraceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Operation on stream {stream} is still in progress <sqn: {sequence_number}>")]
    OperationInProgress {
        stream: StreamId,
        sequence_number: StreamSegmentId,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid argument '{0}': {1}")]
    Argument(String, String),

    #[error("Argument '{0}' out of bounds")]
    OutOfBounds(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),
}

pub type Result<T> = std::result::Result<T, SimutraceError>;

impl SimutraceError {
    /// `OperationInProgress` is the only error a caller is expected to
    /// retry; everything else is final for the attempted operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SimutraceError::OperationInProgress { .. })
    }
}
