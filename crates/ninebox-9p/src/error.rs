//! Error types for the 9P protocol core.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, NinepError>;

/// Session-fatal protocol errors.
///
/// Everything recoverable is answered on the wire as `Rlerror`; only
/// violations that end the session surface through this type.
#[derive(Debug, Error)]
pub enum NinepError {
    /// The message id is not part of the protocol. The transport must
    /// treat this as a session abort.
    #[error("unknown 9P message type: {0}")]
    UnknownMessage(u8),

    /// The frame was too short to contain the `size[4] type[1] tag[2]`
    /// header.
    #[error("malformed frame header")]
    MalformedHeader,
}
