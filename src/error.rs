//! Error taxonomy for the file-descriptor transaction engine.
//!
//! Four kinds of errors can cross the engine boundary: a passthrough kernel
//! errno, a request to restart the transaction in irrevocable mode, a
//! concurrency conflict that the caller must resolve by aborting, and an
//! internal resource failure. See spec §7.

use std::fmt;

/// An error produced by a call into the file-descriptor transaction engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The kernel returned `-1` with this errno; the caller may propagate
    /// it to userspace unchanged.
    Errno(nix::errno::Errno),
    /// The attempted operation has no undo support under the transaction's
    /// current concurrency-control mode. The host should restart the
    /// transaction in irrevocable (`NoUndo`) mode.
    Revocable,
    /// A concurrent transaction precludes success. The caller must abort
    /// and may retry.
    Conflict,
    /// An internal allocation or lock-primitive failure. Non-recoverable
    /// in the sense of spec §7: the engine cannot make forward progress
    /// and the host must decide how to proceed.
    OutOfMemory,
}

impl Error {
    /// Returns true if this error means "abort the transaction", as
    /// opposed to `Revocable` which means "restart irrevocably".
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict)
    }

    /// Returns true if this error is a plain kernel errno passthrough.
    pub fn errno(&self) -> Option<nix::errno::Errno> {
        match self {
            Error::Errno(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Errno(e) => write!(f, "errno: {e}"),
            Error::Revocable => write!(f, "operation has no undo in the current cc mode"),
            Error::Conflict => write!(f, "conflict with a concurrent transaction"),
            Error::OutOfMemory => write!(f, "internal resource allocation failed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Errno(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Error::Errno(nix::errno::Errno::from_raw(errno)),
            None => Error::OutOfMemory,
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;
