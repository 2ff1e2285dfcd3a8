//! Per-field rwlock primitive and the per-transaction local-state tracker
//! that sits on top of it (spec §3.2, §4.1).
//!
//! A [`PicotmRwLock`] is the lock behind one field of a [`crate::file`]
//! record (`FILE_MODE`, `FILE_OFFSET`, ...). It never blocks: acquisition
//! either succeeds immediately or fails, and the caller turns a failure
//! into [`crate::error::Error::Conflict`]. [`LocalLockState`] is the
//! per-transaction bookkeeping that ensures a transaction performs at
//! most one global lock operation per field even if it touches that field
//! many times, and releases exactly what it acquired.

use std::sync::atomic::{AtomicU32, Ordering};

const WRITER_BIT: u32 = 1 << 31;
const COUNT_MASK: u32 = !WRITER_BIT;

/// A non-blocking reader/writer lock over one field of a file record.
///
/// Encoded as a single `AtomicU32`: the top bit marks a writer as present,
/// the remaining bits are the reader count. This mirrors the source's
/// `struct rwlock` (`rwlock.h`), which packs a spinlock-guarded reader
/// count and writer-thread id into one small structure; here the whole
/// thing collapses to one lock-free word since Rust's atomics make the
/// spinlock unnecessary.
#[derive(Debug)]
pub struct PicotmRwLock {
    state: AtomicU32,
}

impl PicotmRwLock {
    pub const fn new() -> Self {
        Self { state: AtomicU32::new(0) }
    }

    /// Attempts to acquire a read reference. Never blocks.
    pub fn try_rdlock(&self) -> bool {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur & WRITER_BIT != 0 {
                return false;
            }
            let count = cur & COUNT_MASK;
            if count == COUNT_MASK {
                // Reader count has saturated; treat as contention rather
                // than wrapping into the writer bit.
                return false;
            }
            let next = cur + 1;
            if self
                .state
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Releases one read reference.
    pub fn rdunlock(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & COUNT_MASK > 0, "rdunlock without a held read reference");
    }

    /// Attempts to acquire the write lock from an unheld state.
    pub fn try_wrlock(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER_BIT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Attempts to upgrade a held read reference to the write lock. Only
    /// succeeds if the caller is the sole reader (global count == 1);
    /// spec §4.1: "Upgrade ... permitted only if the transaction is the
    /// single reader; otherwise fails with Conflict."
    pub fn try_upgrade(&self) -> bool {
        self.state
            .compare_exchange(1, WRITER_BIT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the write lock.
    pub fn wrunlock(&self) {
        let prev = self.state.swap(0, Ordering::Release);
        debug_assert!(prev & WRITER_BIT != 0, "wrunlock without a held write lock");
    }
}

impl Default for PicotmRwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-transaction, per-field lock state: whether this transaction has
/// not touched the field, holds a read reference, or holds the write
/// lock on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldLockState {
    #[default]
    Unlocked,
    RdLocked,
    WrLocked,
}

/// Tracks, for one transaction, which of `N` fields it has locked and how.
///
/// Calling `rdlock`/`wrlock` on a field this transaction already holds at
/// the requested level or higher is a no-op against the global lock
/// (spec §4.1: "acquiring a field performs at most one kernel-visible
/// lock op even if the transaction re-locks the same field").
#[derive(Debug)]
pub struct LocalLockState<const N: usize> {
    state: [FieldLockState; N],
}

impl<const N: usize> LocalLockState<N> {
    pub fn new() -> Self {
        Self { state: [FieldLockState::Unlocked; N] }
    }

    pub fn state_of(&self, field: usize) -> FieldLockState {
        self.state[field]
    }

    /// Acquires (or confirms) a read reference on `field`.
    pub fn rdlock(&mut self, fields: &[PicotmRwLock; N], field: usize) -> bool {
        match self.state[field] {
            FieldLockState::RdLocked | FieldLockState::WrLocked => true,
            FieldLockState::Unlocked => {
                if fields[field].try_rdlock() {
                    self.state[field] = FieldLockState::RdLocked;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Acquires (or confirms, or upgrades into) the write lock on `field`.
    pub fn wrlock(&mut self, fields: &[PicotmRwLock; N], field: usize) -> bool {
        match self.state[field] {
            FieldLockState::WrLocked => true,
            FieldLockState::RdLocked => {
                if fields[field].try_upgrade() {
                    self.state[field] = FieldLockState::WrLocked;
                    true
                } else {
                    false
                }
            }
            FieldLockState::Unlocked => {
                if fields[field].try_wrlock() {
                    self.state[field] = FieldLockState::WrLocked;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Releases every field this transaction holds, in reverse field
    /// order, and resets local state to `Unlocked`.
    pub fn unlock_all(&mut self, fields: &[PicotmRwLock; N]) {
        for field in (0..N).rev() {
            match self.state[field] {
                FieldLockState::RdLocked => fields[field].rdunlock(),
                FieldLockState::WrLocked => fields[field].wrunlock(),
                FieldLockState::Unlocked => {}
            }
            self.state[field] = FieldLockState::Unlocked;
        }
    }
}

impl<const N: usize> Default for LocalLockState<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_readers_then_conflicting_writer() {
        let lock = PicotmRwLock::new();
        assert!(lock.try_rdlock());
        assert!(lock.try_rdlock());
        assert!(!lock.try_wrlock());
        lock.rdunlock();
        lock.rdunlock();
        assert!(lock.try_wrlock());
    }

    #[test]
    fn sole_reader_can_upgrade() {
        let lock = PicotmRwLock::new();
        assert!(lock.try_rdlock());
        assert!(lock.try_upgrade());
        lock.wrunlock();
    }

    #[test]
    fn second_reader_blocks_upgrade() {
        let lock = PicotmRwLock::new();
        assert!(lock.try_rdlock());
        assert!(lock.try_rdlock());
        assert!(!lock.try_upgrade());
    }

    #[test]
    fn local_state_dedupes_relock() {
        let fields: [PicotmRwLock; 2] = [PicotmRwLock::new(), PicotmRwLock::new()];
        let mut local = LocalLockState::<2>::new();
        assert!(local.rdlock(&fields, 0));
        assert!(local.rdlock(&fields, 0));
        // A second, independent local tracker must see the field as busy
        // only via the write path (global reader count is 1, so another
        // transaction's read succeeds but write does not).
        assert!(!fields[0].try_wrlock());
        local.unlock_all(&fields);
        assert!(fields[0].try_wrlock());
    }
}
