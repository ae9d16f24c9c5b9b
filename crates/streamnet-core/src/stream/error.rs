//! Stream error types.
//!
//! Blocking reads and writes never fail: backpressure suspends the caller.
//! Only the non-blocking write path reports an error, and it hands the
//! rejected item back.

use std::fmt;

/// Why a non-blocking stream operation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The ring buffer is at capacity.
    Full,

    /// The reader was opened and has since been closed.
    Closed,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "stream is full"),
            Self::Closed => write!(f, "stream reader is closed"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Error returned from [`StreamWriter::try_write`](super::StreamWriter::try_write).
#[derive(Debug)]
pub struct TryWriteError<T> {
    /// The item that could not be written.
    pub item: T,
    /// The error that occurred.
    pub error: StreamError,
}

impl<T> TryWriteError<T> {
    /// Creates a new error indicating the stream is full.
    #[must_use]
    pub fn full(item: T) -> Self {
        Self {
            item,
            error: StreamError::Full,
        }
    }

    /// Creates a new error indicating the reader is gone.
    #[must_use]
    pub fn closed(item: T) -> Self {
        Self {
            item,
            error: StreamError::Closed,
        }
    }

    /// Returns true if the error is due to a full stream.
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self.error, StreamError::Full)
    }

    /// Returns true if the error is due to a closed reader.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.error, StreamError::Closed)
    }

    /// Consumes the error and returns the item that could not be written.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> fmt::Display for TryWriteError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "try_write failed: {}", self.error)
    }
}

impl<T: fmt::Debug> std::error::Error for TryWriteError<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_display() {
        assert_eq!(StreamError::Full.to_string(), "stream is full");
        assert_eq!(StreamError::Closed.to_string(), "stream reader is closed");
    }

    #[test]
    fn test_try_write_error() {
        let err = TryWriteError::full(7);
        assert!(err.is_full());
        assert!(!err.is_closed());
        assert_eq!(err.to_string(), "try_write failed: stream is full");
        assert_eq!(err.into_inner(), 7);

        let err = TryWriteError::closed("rec");
        assert!(err.is_closed());
        assert_eq!(err.into_inner(), "rec");
    }
}
