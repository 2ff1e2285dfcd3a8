//! Descriptor slots and their state machine (spec §3.4, §4.4).
//!
//! One [`FdTable`] exists per engine instance and is indexed by the raw
//! fildes itself — slot `i` describes whatever kernel descriptor `i`
//! currently names. This mirrors the source's `fd[MAXNUMFD]` array;
//! here the table grows lazily instead of being sized up front.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::file::FileType;

/// Lifecycle state of one descriptor slot (spec §4.4 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdState {
    Unused,
    InUse,
    Closing,
}

struct FdSlot {
    state: FdState,
    ref_count: usize,
    binding: Option<(FileType, usize)>,
}

/// One descriptor slot: state, reference count, and the file record it is
/// currently bound to, all under one mutex (spec §3.4 "Attributes").
///
/// The version counter lives outside the mutex as a separate atomic: it
/// only ever increases, so transactions comparing their acquisition-time
/// snapshot against the live value (§4.4 "validate") need no lock.
pub struct Fd {
    inner: Mutex<FdSlot>,
    version: AtomicU64,
}

impl Fd {
    fn new() -> Self {
        Self {
            inner: Mutex::new(FdSlot { state: FdState::Unused, ref_count: 0, binding: None }),
            version: AtomicU64::new(0),
        }
    }

    /// `ref_state(fildes, want_new)` from spec §4.4's table: binds (or
    /// re-references) this slot to `(file_type, file_slot_index)`.
    /// `want_new` corresponds to the `WANTNEW` flag: a fresh binding is
    /// required (used by `open`/`pipe`/`dup`/`accept`/`socket`, which must
    /// never alias an existing transaction's reference to the same slot).
    pub fn ref_state(&self, file_type: FileType, file_slot_index: usize, want_new: bool) -> Result<u64> {
        let mut slot = self.inner.lock();
        match slot.state {
            FdState::Unused => {
                slot.state = FdState::InUse;
                slot.ref_count = 1;
                slot.binding = Some((file_type, file_slot_index));
                Ok(self.version.load(Ordering::Acquire))
            }
            FdState::InUse if !want_new => {
                slot.ref_count += 1;
                Ok(self.version.load(Ordering::Acquire))
            }
            FdState::InUse | FdState::Closing => Err(Error::Conflict),
        }
    }

    /// Moves `InUse` to `Closing`. Does not drop the reference the caller
    /// already holds; that happens through the normal `unref` path at
    /// commit/rollback (spec §4.4: "no decrement yet").
    pub fn close(&self) -> Result<()> {
        let mut slot = self.inner.lock();
        match slot.state {
            FdState::InUse => {
                slot.state = FdState::Closing;
                Ok(())
            }
            FdState::Closing => Err(Error::Conflict),
            FdState::Unused => Err(Error::Conflict),
        }
    }

    /// Drops one reference. Returns true if this was the last reference
    /// and the slot was `Closing`, meaning the caller must now issue the
    /// real `close(fildes)` (spec §4.4: "Closing, last unref() -> Unused,
    /// kernel close(fildes)").
    pub fn unref(&self) -> bool {
        let mut slot = self.inner.lock();
        debug_assert!(slot.ref_count > 0, "unref of an unreferenced fd slot");
        slot.ref_count -= 1;
        if slot.ref_count == 0 {
            let was_closing = slot.state == FdState::Closing;
            slot.state = FdState::Unused;
            slot.binding = None;
            was_closing
        } else {
            false
        }
    }

    /// Marks that fildes-local state (e.g. `FD_CLOEXEC`) changed, bumping
    /// the version other transactions validate against (spec §3.5
    /// "LOCALSTATE").
    pub fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn state(&self) -> FdState {
        self.inner.lock().state
    }

    pub fn binding(&self) -> Option<(FileType, usize)> {
        self.inner.lock().binding
    }
}

/// The process-wide table of descriptor slots, indexed by raw fildes.
///
/// Grows lazily up to the process's `RLIMIT_NOFILE`; a fildes beyond that
/// limit cannot exist, so the table never needs to grow further than the
/// kernel itself would allow.
pub struct FdTable {
    slots: parking_lot::RwLock<Vec<Arc<Fd>>>,
    rlimit: u64,
}

impl FdTable {
    pub fn new() -> Self {
        let rlimit = nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
            .map(|(soft, _hard)| soft)
            .unwrap_or(65536);
        Self { slots: parking_lot::RwLock::new(Vec::new()), rlimit }
    }

    /// Returns the slot for `fildes`, growing the table if necessary.
    pub fn slot(&self, fildes: RawFd) -> Result<Arc<Fd>> {
        if fildes < 0 || fildes as u64 >= self.rlimit {
            return Err(Error::Errno(nix::errno::Errno::EBADF));
        }
        let idx = fildes as usize;
        {
            let slots = self.slots.read();
            if let Some(slot) = slots.get(idx) {
                return Ok(slot.clone());
            }
        }
        let mut slots = self.slots.write();
        while slots.len() <= idx {
            slots.push(Arc::new(Fd::new()));
        }
        Ok(slots[idx].clone())
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slot_refs_as_in_use() {
        let table = FdTable::new();
        let slot = table.slot(3).unwrap();
        assert_eq!(slot.state(), FdState::Unused);
        slot.ref_state(FileType::RegFile, 0, false).unwrap();
        assert_eq!(slot.state(), FdState::InUse);
        assert_eq!(slot.binding(), Some((FileType::RegFile, 0)));
    }

    #[test]
    fn want_new_conflicts_on_existing_reference() {
        let table = FdTable::new();
        let slot = table.slot(3).unwrap();
        slot.ref_state(FileType::RegFile, 0, false).unwrap();
        assert_eq!(slot.ref_state(FileType::RegFile, 0, true), Err(Error::Conflict));
    }

    #[test]
    fn close_then_last_unref_returns_to_unused_and_signals_kernel_close() {
        let table = FdTable::new();
        let slot = table.slot(3).unwrap();
        slot.ref_state(FileType::RegFile, 0, false).unwrap();
        slot.close().unwrap();
        assert_eq!(slot.state(), FdState::Closing);
        assert!(slot.unref());
        assert_eq!(slot.state(), FdState::Unused);
    }

    #[test]
    fn shared_reference_unref_does_not_close_until_last() {
        let table = FdTable::new();
        let slot = table.slot(3).unwrap();
        slot.ref_state(FileType::RegFile, 0, false).unwrap();
        slot.ref_state(FileType::RegFile, 0, false).unwrap();
        slot.close().unwrap();
        assert!(!slot.unref());
        assert_eq!(slot.state(), FdState::Closing);
        assert!(slot.unref());
        assert_eq!(slot.state(), FdState::Unused);
    }

    #[test]
    fn ref_state_on_closing_conflicts() {
        let table = FdTable::new();
        let slot = table.slot(3).unwrap();
        slot.ref_state(FileType::RegFile, 0, false).unwrap();
        slot.close().unwrap();
        assert_eq!(slot.ref_state(FileType::RegFile, 0, false), Err(Error::Conflict));
    }
}
