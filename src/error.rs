//! Error types for bridge-backend.
//!
//! Only connection-level failures are surfaced as errors. Problems confined
//! to a single stream are answered on that stream and never reach the caller,
//! and caller contract violations panic.

use thiserror::Error;

use crate::protocol::StreamKey;

/// A frame payload that could not be decoded.
///
/// Any decode error is fatal for the connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A read ran past the end of the payload.
    #[error("read of {len} bytes at offset {offset} is out of bounds")]
    OutOfBounds { offset: usize, len: usize },

    /// A table points at a vtable that is truncated or misplaced.
    #[error("malformed vtable for table at offset {0}")]
    InvalidVtable(usize),

    /// The frame type is not Header, Body or Abort.
    #[error("unrecognized frame type {0}")]
    UnknownFrameType(i8),

    /// The HTTP version is not one the protocol defines.
    #[error("unrecognized HTTP version {0}")]
    UnknownVersion(i8),

    /// A header frame without the method/URI line.
    #[error("header frame carries no request line")]
    MissingRequestLine,
}

/// Connection-level failure reported by [`Backend::recv`](crate::Backend::recv).
///
/// By the time one of these is returned the connection has been closed and
/// every in-flight request on it abandoned.
#[derive(Debug, Error)]
pub enum BackendError {
    /// I/O error while establishing the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `recv` called without a connection.
    #[error("not connected")]
    NotConnected,

    /// The peer closed the connection or the transport failed.
    #[error("connection closed")]
    Closed,

    /// The peer sent a payload that does not decode.
    #[error("protocol error: {0}")]
    Protocol(#[from] DecodeError),

    /// The peer announced a frame larger than we accept.
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    /// A header frame arrived for a stream that is still alive.
    #[error("header frame for live stream {0}")]
    DuplicateStream(StreamKey),
}

/// Log a caller contract violation and panic.
///
/// These indicate that the bookkeeping of the reassembly table can no longer
/// be trusted, so they are never turned into recoverable errors.
#[track_caller]
pub(crate) fn usage_error(msg: &str) -> ! {
    tracing::error!(reason = msg, "Usage error");
    panic!("{msg}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::OutOfBounds { offset: 12, len: 8 };
        assert_eq!(err.to_string(), "read of 8 bytes at offset 12 is out of bounds");
        assert_eq!(
            DecodeError::UnknownFrameType(9).to_string(),
            "unrecognized frame type 9"
        );
    }

    #[test]
    fn test_backend_error_from_decode() {
        let err: BackendError = DecodeError::MissingRequestLine.into();
        assert!(matches!(err, BackendError::Protocol(DecodeError::MissingRequestLine)));
        assert!(err.to_string().contains("request line"));
    }

    #[test]
    fn test_duplicate_stream_display() {
        let err = BackendError::DuplicateStream(StreamKey::new(3, 9));
        assert_eq!(err.to_string(), "header frame for live stream 3:9");
    }
}
