//! The event log's vocabulary: which call happened, and a handle to its
//! ancillary log entry (spec §3.7, design notes "The event log").

use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Which syscall an event log entry replays or reverses.
///
/// Ordering matches the original's `apply[]`/`undo[]` jump tables
/// (`fildes_tx.c`) purely for familiarity; Rust dispatches on this via
/// `match`, not a raw function-pointer array, so the ordering carries no
/// runtime significance here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum CallKind {
    Close,
    Open,
    Pread,
    Pwrite,
    Lseek,
    Read,
    Write,
    Fcntl,
    Fsync,
    Sync,
    Dup,
    Pipe,
    Socket,
    Listen,
    Connect,
    Accept,
    Send,
    Recv,
    Shutdown,
    Bind,
    Select,
}

/// A handle into one of the per-call ancillary tables (`ioop`, `seekop`,
/// `fcntlop`, `openop`, `pipeop`). Opaque to everything but the call's own
/// `exec`/`apply`/`undo` implementation.
pub type Cookie = usize;

/// One entry in a transaction's event log: which call, and a cookie
/// identifying its ancillary data.
#[derive(Debug, Clone, Copy)]
pub struct FdEvent {
    pub call: CallKind,
    pub fildes: i32,
    pub cookie: Cookie,
}
