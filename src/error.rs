use std::fmt;
use std::io;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error returned by every fallible `msocket` API.
///
/// Modeled as a `kind` plus an optional wrapped system error, the same shape
/// the library has used since its earliest (pre-1.0) revisions: a closed
/// enum for the caller to match on, with the underlying `io::Error`
/// preserved for diagnostics when one exists.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<io::Error>,
}

/// The taxonomy of failures a synchronous `msocket` call can report.
///
/// `PeerClosed` and `HandlerRejected` are not returned from any public
/// function; they describe background-thread outcomes that are delivered
/// as callbacks (`tcp_disconnected`, a `Closing` transition) rather than
/// `Result::Err`. They are part of this enum so log messages and internal
/// bookkeeping have a single vocabulary for every way a connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A null/absent handle, bad address family, bad mode value, unparseable
    /// numeric address, or a precondition violation (wrong state, mode
    /// already active).
    InvalidArgument,
    /// Allocation failure growing the receive buffer or copying a handler
    /// table.
    OutOfMemory,
    /// A kernel-level failure: `socket`, `bind`, `listen`, `connect`,
    /// `accept`, `send`, `recv`.
    SystemCall,
    /// The peer closed the connection in an orderly fashion. Not user-visible
    /// as an `Err`; delivered as `tcp_disconnected`.
    PeerClosed,
    /// `tcp_data` returned non-zero. Not user-visible as an `Err`; the
    /// connection silently transitions to `Closing`.
    HandlerRejected,
}

impl Error {
    /// Build an `InvalidArgument` error with no wrapped system error.
    pub fn invalid_argument(msg: &'static str) -> Error {
        Error {
            kind: ErrorKind::InvalidArgument,
            source: Some(io::Error::new(io::ErrorKind::InvalidInput, msg)),
        }
    }

    /// Build an `OutOfMemory` error.
    pub fn out_of_memory() -> Error {
        Error {
            kind: ErrorKind::OutOfMemory,
            source: None,
        }
    }

    /// Wrap a kernel-level failure.
    pub fn system_call(err: io::Error) -> Error {
        Error {
            kind: ErrorKind::SystemCall,
            source: Some(err),
        }
    }

    /// The category of this failure.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// `true` if this error wraps `io::ErrorKind::WouldBlock`: the caller
    /// may retry once the handle is readable/writable again.
    pub fn would_block(&self) -> bool {
        matches!(
            self.source.as_ref().map(io::Error::kind),
            Some(io::ErrorKind::WouldBlock)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.source) {
            (ErrorKind::InvalidArgument, Some(e)) => write!(f, "invalid argument: {e}"),
            (ErrorKind::InvalidArgument, None) => write!(f, "invalid argument"),
            (ErrorKind::OutOfMemory, _) => write!(f, "out of memory"),
            (ErrorKind::SystemCall, Some(e)) => write!(f, "system call failed: {e}"),
            (ErrorKind::SystemCall, None) => write!(f, "system call failed"),
            (ErrorKind::PeerClosed, _) => write!(f, "peer closed the connection"),
            (ErrorKind::HandlerRejected, _) => write!(f, "handler rejected the received data"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::system_call(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_source() {
        let err = Error::system_call(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(err.kind(), ErrorKind::SystemCall);
        assert!(err.to_string().contains("reset"));
    }

    #[test]
    fn would_block_detection() {
        let err = Error::system_call(io::Error::new(io::ErrorKind::WouldBlock, "wb"));
        assert!(err.would_block());
        let err = Error::invalid_argument("bad");
        assert!(!err.would_block());
    }
}
