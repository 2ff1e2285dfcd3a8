//! File records and per-field locking (spec §3.2, §4.1).
//!
//! A [`File`] is the per-unique-kernel-object record interned by a
//! [`filetab::FileTab`] (one table per variant, spec §3.3). Its identity
//! is carried by [`crate::fileid::FileId`], never by which fildes
//! currently reference it (spec §9 "Cyclic ownership").

pub mod filetab;

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use parking_lot::RwLock;

use crate::config::CcMode;
use crate::fileid::FileId;
use crate::rangelock::PageTree;
use crate::rwlock::PicotmRwLock;

/// Which of the five file variants a record holds (spec §3.2 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum FileType {
    RegFile = 0,
    Dir = 1,
    Fifo = 2,
    ChrDev = 3,
    Socket = 4,
}

impl FileType {
    pub const COUNT: usize = 5;
}

/// Field indices for each variant's independent rwlock array (spec §3.2
/// table "Field sets per variant").
pub mod fields {
    pub const REGFILE_MODE: usize = 0;
    pub const REGFILE_OFFSET: usize = 1;
    pub const REGFILE_SIZE: usize = 2;
    pub const REGFILE_STATE: usize = 3;
    pub const REGFILE_NFIELDS: usize = 4;

    pub const DIR_STATE: usize = 0;
    pub const DIR_NFIELDS: usize = 1;

    pub const FIFO_MODE: usize = 0;
    pub const FIFO_READ_END: usize = 1;
    pub const FIFO_WRITE_END: usize = 2;
    pub const FIFO_STATE: usize = 3;
    pub const FIFO_NFIELDS: usize = 4;

    pub const CHRDEV_MODE: usize = 0;
    pub const CHRDEV_OFFSET: usize = 1;
    pub const CHRDEV_STATE: usize = 2;
    pub const CHRDEV_NFIELDS: usize = 3;

    pub const SOCKET_MODE: usize = 0;
    pub const SOCKET_RECV_END: usize = 1;
    pub const SOCKET_SEND_END: usize = 2;
    pub const SOCKET_STATE: usize = 3;
    pub const SOCKET_NFIELDS: usize = 4;
}

struct CoreState {
    id: FileId,
    ref_count: usize,
}

/// The part of a file record common to every variant: reference count,
/// current file-id, and the internal latch that protects both (spec
/// §3.2 "Attributes").
///
/// Invariant I1 (spec §8.2): `ref_count > 0 <=> id` is non-empty. Both
/// are changed together under `state`'s write lock, so the invariant
/// never observes an intermediate state from another thread.
pub struct FileCore {
    state: RwLock<CoreState>,
    cc_mode: AtomicU8,
}

/// Outcome of comparing a candidate id against a table slot during
/// interning (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOutcome {
    /// The slot's id matched and a reference was taken.
    Matched,
    /// The slot was dead (empty id) and has been initialized with the
    /// given id; a reference was taken.
    Reused,
    /// The slot holds a different live id; no reference was taken.
    NoMatch,
}

impl FileCore {
    pub fn new_dead() -> Self {
        Self {
            state: RwLock::new(CoreState { id: FileId::EMPTY, ref_count: 0 }),
            cc_mode: AtomicU8::new(CcMode::TwoPL as u8),
        }
    }

    /// Lock-free(ish) read of the CC mode (spec §4.1 "Lock-free read of
    /// the CC mode"): only changes while `state`'s writer latch is held,
    /// by `init_with_id`, so an `Acquire` load here always observes a
    /// fully-initialized value.
    pub fn cc_mode(&self) -> CcMode {
        match self.cc_mode.load(Ordering::Acquire) {
            0 => CcMode::NoUndo,
            _ => CcMode::TwoPL,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.read().ref_count > 0
    }

    pub fn id(&self) -> FileId {
        self.state.read().id
    }

    /// Attempts to match this slot against `id` and, on a match, take a
    /// reference. Used during the reader-latch scan of `ref_fildes`
    /// (spec §4.3 step 2).
    pub fn cmp_and_ref(&self, id: FileId) -> RefOutcome {
        let mut st = self.state.write();
        if st.ref_count > 0 && st.id == id {
            st.ref_count += 1;
            RefOutcome::Matched
        } else {
            RefOutcome::NoMatch
        }
    }

    /// Attempts to reuse this slot if it is dead, taking the first
    /// reference and setting the default CC mode for the file type (spec
    /// §4.3 step 3, §3.2 "Lifecycle").
    pub fn try_reuse_dead(&self, id: FileId, default_cc: CcMode) -> RefOutcome {
        let mut st = self.state.write();
        if st.ref_count == 0 {
            st.id = id;
            st.ref_count = 1;
            self.cc_mode.store(default_cc as u8, Ordering::Release);
            RefOutcome::Reused
        } else if st.id == id {
            st.ref_count += 1;
            RefOutcome::Matched
        } else {
            RefOutcome::NoMatch
        }
    }

    /// Releases one reference. Returns true if the record became dead
    /// (ref count hit zero) as a result.
    pub fn unref(&self) -> bool {
        let mut st = self.state.write();
        debug_assert!(st.ref_count > 0, "unref of a dead file record");
        st.ref_count -= 1;
        if st.ref_count == 0 {
            st.id = FileId::EMPTY;
            true
        } else {
            false
        }
    }
}

/// Sentinel meaning "no transaction has synced the shared offset from the
/// kernel yet".
const OFFSET_UNSYNCED: i64 = i64::MIN;

/// A regular file: has an offset, a size, and a byte-range lock map.
pub struct RegFile {
    pub core: FileCore,
    pub fields: [PicotmRwLock; fields::REGFILE_NFIELDS],
    pub rangelock: PageTree,
    shared_offset: AtomicI64,
}

impl RegFile {
    pub fn new_dead() -> Self {
        Self {
            core: FileCore::new_dead(),
            fields: std::array::from_fn(|_| PicotmRwLock::new()),
            rangelock: PageTree::new(),
            shared_offset: AtomicI64::new(OFFSET_UNSYNCED),
        }
    }

    /// Returns the shared shadow offset, fetching it from the kernel via
    /// `lseek(fildes, 0, SEEK_CUR)` the first time any transaction touches
    /// this record (spec §3.6: "local_offset is a shadow of the file
    /// position ... initialized from the shared offset at first
    /// reference").
    pub fn synced_offset(&self, fildes: std::os::unix::io::RawFd) -> crate::error::Result<i64> {
        let cur = self.shared_offset.load(Ordering::Acquire);
        if cur != OFFSET_UNSYNCED {
            return Ok(cur);
        }
        let real = nix::unistd::lseek(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) },
            0,
            nix::unistd::Whence::SeekCur,
        )?;
        match self.shared_offset.compare_exchange(
            OFFSET_UNSYNCED,
            real,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(real),
            Err(winner) => Ok(winner),
        }
    }

    pub fn set_shared_offset(&self, value: i64) {
        self.shared_offset.store(value, Ordering::Release);
    }
}

/// A directory: only a STATE field is tracked (spec §3.2 table).
pub struct Dir {
    pub core: FileCore,
    pub fields: [PicotmRwLock; fields::DIR_NFIELDS],
}

impl Dir {
    pub fn new_dead() -> Self {
        Self { core: FileCore::new_dead(), fields: std::array::from_fn(|_| PicotmRwLock::new()) }
    }
}

/// A FIFO: read end and write end are distinct fields since their
/// identities differ too (spec §3.1).
pub struct Fifo {
    pub core: FileCore,
    pub fields: [PicotmRwLock; fields::FIFO_NFIELDS],
}

impl Fifo {
    pub fn new_dead() -> Self {
        Self { core: FileCore::new_dead(), fields: std::array::from_fn(|_| PicotmRwLock::new()) }
    }
}

/// A character device. Carries the same offset-shadowing machinery as
/// [`RegFile`] but no byte-range lock map: device reads/writes don't
/// contend over disjoint ranges the way regular-file I/O does.
pub struct ChrDev {
    pub core: FileCore,
    pub fields: [PicotmRwLock; fields::CHRDEV_NFIELDS],
    shared_offset: AtomicI64,
}

impl ChrDev {
    pub fn new_dead() -> Self {
        Self {
            core: FileCore::new_dead(),
            fields: std::array::from_fn(|_| PicotmRwLock::new()),
            shared_offset: AtomicI64::new(OFFSET_UNSYNCED),
        }
    }

    pub fn synced_offset(&self, fildes: std::os::unix::io::RawFd) -> crate::error::Result<i64> {
        let cur = self.shared_offset.load(Ordering::Acquire);
        if cur != OFFSET_UNSYNCED {
            return Ok(cur);
        }
        let real = nix::unistd::lseek(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) },
            0,
            nix::unistd::Whence::SeekCur,
        )?;
        match self.shared_offset.compare_exchange(
            OFFSET_UNSYNCED,
            real,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(real),
            Err(winner) => Ok(winner),
        }
    }

    pub fn set_shared_offset(&self, value: i64) {
        self.shared_offset.store(value, Ordering::Release);
    }
}

/// A socket.
pub struct Socket {
    pub core: FileCore,
    pub fields: [PicotmRwLock; fields::SOCKET_NFIELDS],
}

impl Socket {
    pub fn new_dead() -> Self {
        Self { core: FileCore::new_dead(), fields: std::array::from_fn(|_| PicotmRwLock::new()) }
    }
}
