//! Identity of the kernel file object behind a file descriptor (spec §3.1).

use std::os::unix::io::RawFd;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::fstat;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A process-stable tuple identifying the underlying kernel file object
/// behind a fildes.
///
/// Equality is lexicographic over `(dev, ino, mode, fifo_flags)`. For
/// FIFOs, `fifo_flags` carries the `O_RDONLY`/`O_WRONLY` bit so that the
/// read end and the write end of the same pipe are treated as distinct
/// identities (spec §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FileId {
    dev: u64,
    ino: u64,
    mode: u32,
    fifo_flags: i32,
}

impl FileId {
    /// The sentinel identifying an unused file-table slot.
    pub const EMPTY: FileId = FileId { dev: 0, ino: 0, mode: 0, fifo_flags: 0 };

    /// Returns true if this is the empty sentinel.
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Computes the file-id of a live fildes by calling `fstat` and, for
    /// FIFOs, `fcntl(F_GETFL)` to recover the open-for-read/write bit.
    pub fn of_fildes(fildes: RawFd) -> Result<FileId> {
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) };
        let st = fstat(fd)?;
        let mode = st.st_mode;
        let is_fifo = (mode & libc::S_IFMT) == libc::S_IFIFO;
        let fifo_flags = if is_fifo {
            let flags = fcntl(fd, FcntlArg::F_GETFL)?;
            OFlag::from_bits_truncate(flags).bits() & (OFlag::O_RDONLY | OFlag::O_WRONLY | OFlag::O_RDWR).bits()
        } else {
            0
        };
        Ok(FileId { dev: st.st_dev as u64, ino: st.st_ino as u64, mode: mode as u32, fifo_flags })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_empty() {
        assert!(FileId::EMPTY.is_empty());
    }

    #[test]
    fn distinct_files_compare_unequal() {
        let a = FileId { dev: 1, ino: 2, mode: 0, fifo_flags: 0 };
        let b = FileId { dev: 1, ino: 3, mode: 0, fifo_flags: 0 };
        assert_ne!(a, b);
    }

    #[test]
    fn fifo_ends_are_distinct_identities() {
        let read_end = FileId { dev: 1, ino: 2, mode: 0, fifo_flags: libc::O_RDONLY };
        let write_end = FileId { dev: 1, ino: 2, mode: 0, fifo_flags: libc::O_WRONLY };
        assert_ne!(read_end, write_end);
    }
}
