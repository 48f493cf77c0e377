//! Error types shared by the protocol, transport, and processor layers.

use crate::application_exception::ApplicationException;

/// Failure raised while encoding or decoding structured data.
///
/// `Underrun` is not a failure in the usual sense: it tells the dispatcher
/// that the input does not yet hold a complete message and the read position
/// must be rolled back until more bytes arrive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("input buffer underrun")]
    Underrun,
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("negative size: {0}")]
    NegativeSize(i32),
    #[error("size {size} exceeds limit {limit}")]
    SizeLimit { size: usize, limit: usize },
    #[error("bad protocol version: {0:#010x}")]
    BadVersion(u32),
    #[error("maximum nesting depth exceeded")]
    DepthLimit,
}

impl ProtocolError {
    /// Returns `true` for the "not enough bytes yet" retry signal.
    #[must_use]
    pub fn is_underrun(&self) -> bool {
        matches!(self, Self::Underrun)
    }
}

/// Errors surfaced by a [`Processor`](crate::processor::Processor).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Application(#[from] ApplicationException),
    #[error("handler failed: {0}")]
    Handler(#[from] anyhow::Error),
    /// The message body could not be decoded, so its end is unknown. Any
    /// exception reply has already been written; the caller must drop the
    /// unread rest of the message before reading the next one.
    #[error("undecodable message dropped: {0}")]
    Discarded(#[source] ProtocolError),
}

impl Error {
    /// Returns `true` if this error is the buffer-underrun retry signal.
    #[must_use]
    pub fn is_underrun(&self) -> bool {
        matches!(self, Self::Protocol(e) if e.is_underrun())
    }

    /// Returns `true` if the current message must be skipped to resynchronise.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::Discarded(_))
    }
}

/// Result alias for protocol-level operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underrun_detected_through_wrapper() {
        let err: Error = ProtocolError::Underrun.into();
        assert!(err.is_underrun());

        let err: Error = ProtocolError::InvalidData("x".into()).into();
        assert!(!err.is_underrun());

        let err = Error::Discarded(ProtocolError::Underrun);
        assert!(!err.is_underrun());
        assert!(err.is_discarded());
    }

    #[test]
    fn bad_version_formats_as_hex() {
        let err = ProtocolError::BadVersion(0x8002_0000);
        assert_eq!(err.to_string(), "bad protocol version: 0x80020000");
    }
}
