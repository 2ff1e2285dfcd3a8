//! Ancillary per-call log entries (spec §3.6, §3.7, design notes "The
//! event log"). Each [`crate::call::FdEvent`] cookie indexes into one of
//! these tables; `apply`/`undo` read the entry back out by cookie.

use std::path::PathBuf;

use nix::fcntl::FcntlArg;

/// A buffered `read`/`pread` or `write`/`pwrite`.
///
/// `bufoff` indexes into the owning `ofd_tx`'s `write_buf` arena for
/// writes; reads don't need a buffer (the kernel read lands straight in
/// the caller's buffer) so `bufoff` is unused for them (spec §3.6).
#[derive(Debug, Clone, Copy)]
pub struct IoOp {
    pub offset: i64,
    pub nbyte: usize,
    pub bufoff: usize,
    pub is_write: bool,
}

/// A buffered `lseek`, recorded so `undo` could restore the previous
/// shadow offset if it ever needed to (currently a no-op per spec §4.5,
/// kept for symmetry with the apply side, which replays the new position
/// against the kernel descriptor).
#[derive(Debug, Clone, Copy)]
pub struct SeekOp {
    pub from: i64,
    pub offset: i64,
    pub whence: nix::unistd::Whence,
}

/// What an `fcntl` call changed, so `undo` can restore it.
#[derive(Debug, Clone, Copy)]
pub enum FcntlOp {
    /// `F_SETFD`: previous `FD_CLOEXEC` bit.
    SetFd { old_cloexec: bool },
    /// `F_SETFL`: previous status flags.
    SetFl { old_flags: i32 },
    /// `F_SETOWN`: previous owner pid.
    SetOwn { old_owner: libc::pid_t },
}

/// An `open` call: whether the created path should be unlinked on undo,
/// and the path/inode needed to verify that before doing so (spec §4.5
/// "open"'s undo: "verified by stat+fstat comparison").
#[derive(Debug, Clone)]
pub struct OpenOp {
    pub path: PathBuf,
    pub unlink_on_undo: bool,
    pub created_ino: u64,
    pub created_dev: u64,
}

/// A `pipe` call: both ends, so undo can close them together.
#[derive(Debug, Clone, Copy)]
pub struct PipeOp {
    pub read_fildes: i32,
    pub write_fildes: i32,
}

/// Per-transaction ancillary storage for every call kind that needs more
/// than a cookie's worth of bookkeeping. Indexed by the cookie carried in
/// the matching [`crate::call::FdEvent`].
#[derive(Debug, Default)]
pub struct OpLog {
    pub ioops: Vec<IoOp>,
    pub seekops: Vec<SeekOp>,
    pub fcntlops: Vec<FcntlOp>,
    pub openops: Vec<OpenOp>,
    pub pipeops: Vec<PipeOp>,
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ioop(&mut self, op: IoOp) -> usize {
        self.ioops.push(op);
        self.ioops.len() - 1
    }

    pub fn push_seekop(&mut self, op: SeekOp) -> usize {
        self.seekops.push(op);
        self.seekops.len() - 1
    }

    pub fn push_fcntlop(&mut self, op: FcntlOp) -> usize {
        self.fcntlops.push(op);
        self.fcntlops.len() - 1
    }

    pub fn push_openop(&mut self, op: OpenOp) -> usize {
        self.openops.push(op);
        self.openops.len() - 1
    }

    pub fn push_pipeop(&mut self, op: PipeOp) -> usize {
        self.pipeops.push(op);
        self.pipeops.len() - 1
    }
}

/// Converts a public `FcntlArg` command tag into the `F_SETxxx` it
/// mirrors, for log entries that need to name the operation kind
/// independent of its (borrowed) argument value.
pub fn is_set_command(arg: &FcntlArg) -> bool {
    matches!(arg, FcntlArg::F_SETFD(_) | FcntlArg::F_SETFL(_) | FcntlArg::F_SETOWN(_))
}
