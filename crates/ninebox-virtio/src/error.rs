//! Error types for VirtIO transport plumbing.

use thiserror::Error;

/// Result type alias for VirtIO operations.
pub type Result<T> = std::result::Result<T, VirtioError>;

/// Errors that can occur while driving a virtqueue.
#[derive(Debug, Error)]
pub enum VirtioError {
    /// Device not ready for the attempted operation.
    #[error("device not ready: {0}")]
    NotReady(String),

    /// Invalid queue configuration.
    #[error("invalid queue configuration: {0}")]
    InvalidQueue(String),

    /// A descriptor points outside guest memory or chains illegally.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// A reply does not fit the device-writable descriptors.
    #[error("buffer too small: need {needed}, got {got}")]
    BufferTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        got: usize,
    },
}
