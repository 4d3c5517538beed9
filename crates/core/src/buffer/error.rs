//! Errors returned by [`LogBuffer`](super::LogBuffer).

use std::io;

use thiserror::Error;

/// Errors that can occur when appending to a [`LogBuffer`](super::LogBuffer).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogBufferError {
    /// The write would push the accumulated entries past the configured
    /// ceiling. Nothing was written.
    #[error(
        "write failed: buffer max size = {max}, current len = {current}, attempted to write len = {attempted}, data == {data}"
    )]
    CapacityExceeded {
        /// Configured maximum size in bytes.
        max: usize,
        /// Bytes accumulated before the rejected write.
        current: usize,
        /// Length of the rejected fragment after trimming.
        attempted: usize,
        /// The rejected fragment, lossily decoded.
        data: String,
    },
}

impl From<LogBufferError> for io::Error {
    fn from(err: LogBufferError) -> Self {
        Self::other(err)
    }
}
