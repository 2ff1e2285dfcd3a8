//! Per-transaction descriptor entry (spec §3.5, §4.4).

use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::config::CcMode;
use crate::error::{Error, Result};
use crate::fd::{FdState, FdTable};
use crate::file::FileType;
use crate::oplog::FcntlOp;

bitflags! {
    /// Per-transaction flags on an `fd_tx` (spec §3.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdTxFlags: u32 {
        /// Set when this transaction modified fildes-local state
        /// (currently only `F_SETFD`'s `FD_CLOEXEC` bit). Forces a
        /// version check at commit (spec §4.4).
        const LOCALSTATE = 1 << 0;
    }
}

/// One transaction's view of one fildes: which file it resolved to, what
/// concurrency-control mode applies, and the bookkeeping needed to
/// validate the binding is still good at commit time.
///
/// Lazily initialized: `fildes < 0` means "this entry holds no
/// reference" (spec §3.5).
pub struct FdTx {
    fildes: RawFd,
    file_type: FileType,
    file_slot_index: usize,
    cc_mode: CcMode,
    flags: FdTxFlags,
    fd_version_at_acquire: u64,
    self_closed: bool,
    pub fcntl_ops: Vec<FcntlOp>,
}

impl FdTx {
    pub fn empty() -> Self {
        Self {
            fildes: -1,
            file_type: FileType::RegFile,
            file_slot_index: 0,
            cc_mode: CcMode::TwoPL,
            flags: FdTxFlags::empty(),
            fd_version_at_acquire: 0,
            self_closed: false,
            fcntl_ops: Vec::new(),
        }
    }

    pub fn holds_ref(&self) -> bool {
        self.fildes >= 0
    }

    pub fn fildes(&self) -> RawFd {
        self.fildes
    }

    pub fn file_slot_index(&self) -> usize {
        self.file_slot_index
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn cc_mode(&self) -> CcMode {
        self.cc_mode
    }

    /// Binds this entry to `fildes`, either taking a fresh reference or
    /// confirming the one already held (spec §4.4 table's `ref_state`
    /// transitions). `want_new` forces a fresh binding (`open`, `pipe`,
    /// `dup`, `accept`, `socket`).
    pub fn ref_fildes(
        &mut self,
        fd_table: &FdTable,
        fildes: RawFd,
        file_type: FileType,
        file_slot_index: usize,
        cc_mode: CcMode,
        want_new: bool,
    ) -> Result<()> {
        if self.holds_ref() {
            debug_assert_eq!(self.fildes, fildes);
            return Ok(());
        }
        let slot = fd_table.slot(fildes)?;
        let version = slot.ref_state(file_type, file_slot_index, want_new)?;
        self.fildes = fildes;
        self.file_type = file_type;
        self.file_slot_index = file_slot_index;
        self.cc_mode = cc_mode;
        self.fd_version_at_acquire = version;
        self.flags = if want_new { FdTxFlags::LOCALSTATE } else { FdTxFlags::empty() };
        Ok(())
    }

    /// Marks this transaction as having modified fildes-local state
    /// (`F_SETFD`), bumping the shared version counter (spec §4.5
    /// "fcntl"'s `F_SETFD` special case).
    pub fn mark_localstate(&mut self, fd_table: &FdTable) -> Result<()> {
        self.flags |= FdTxFlags::LOCALSTATE;
        fd_table.slot(self.fildes)?.bump_version();
        Ok(())
    }

    /// Transitions the bound slot to `Closing` (spec §4.5 "close").
    pub fn signal_close(&mut self, fd_table: &FdTable) -> Result<()> {
        fd_table.slot(self.fildes)?.close()?;
        self.self_closed = true;
        Ok(())
    }

    /// Commit-time validation (spec §4.4): conflicts if another
    /// transaction closed this fildes out from under us, or if we
    /// touched fildes-local state and someone else's `F_SETFD` raced
    /// past our snapshot.
    pub fn validate(&self, fd_table: &FdTable) -> Result<()> {
        if !self.holds_ref() {
            return Ok(());
        }
        let slot = fd_table.slot(self.fildes)?;
        if slot.state() == FdState::Closing && !self.self_closed {
            return Err(Error::Conflict);
        }
        if self.flags.contains(FdTxFlags::LOCALSTATE) && slot.version() > self.fd_version_at_acquire {
            return Err(Error::Conflict);
        }
        Ok(())
    }

    /// Releases the reference this entry holds, cascading into the
    /// `Closing -> Unused` kernel `close` if this was the last one (spec
    /// §4.6 step 7 / §4.7 step 3). Returns true if the caller must now
    /// issue the real `close(fildes)`.
    pub fn unref(&mut self, fd_table: &FdTable) -> Result<bool> {
        if !self.holds_ref() {
            return Ok(false);
        }
        let must_close = fd_table.slot(self.fildes)?.unref();
        self.fildes = -1;
        self.self_closed = false;
        self.flags = FdTxFlags::empty();
        Ok(must_close)
    }
}

impl Default for FdTx {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_then_validate_ok() {
        let table = FdTable::new();
        let mut tx = FdTx::empty();
        tx.ref_fildes(&table, 5, FileType::RegFile, 0, CcMode::TwoPL, false).unwrap();
        assert!(tx.validate(&table).is_ok());
    }

    #[test]
    fn foreign_close_is_a_conflict() {
        let table = FdTable::new();
        let mut tx = FdTx::empty();
        tx.ref_fildes(&table, 5, FileType::RegFile, 0, CcMode::TwoPL, false).unwrap();
        table.slot(5).unwrap().close().unwrap();
        assert_eq!(tx.validate(&table), Err(Error::Conflict));
    }

    #[test]
    fn self_close_is_not_a_conflict() {
        let table = FdTable::new();
        let mut tx = FdTx::empty();
        tx.ref_fildes(&table, 5, FileType::RegFile, 0, CcMode::TwoPL, false).unwrap();
        tx.signal_close(&table).unwrap();
        assert!(tx.validate(&table).is_ok());
    }

    #[test]
    fn localstate_bump_by_another_tx_conflicts() {
        let table = FdTable::new();
        let mut tx = FdTx::empty();
        tx.ref_fildes(&table, 5, FileType::RegFile, 0, CcMode::TwoPL, true).unwrap();
        table.slot(5).unwrap().bump_version();
        assert_eq!(tx.validate(&table), Err(Error::Conflict));
    }
}
