//! Directory `ofd_tx` (spec §3.2 field table: only `STATE` is tracked).
//!
//! None of the calls in scope (spec §1) read or write directory content;
//! a directory's `ofd_tx` exists only so `open`, `close`, and `fcntl` on a
//! directory fildes have somewhere to hang their field lock and so the
//! file-table invariants (§8, I1/I2) apply uniformly across variants.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg};

use crate::error::{Error, Result};
use crate::file::{fields, Dir};

use super::OfdTxCommon;

pub struct DirTx {
    pub file: Arc<Dir>,
    pub common: OfdTxCommon<{ fields::DIR_NFIELDS }>,
}

impl DirTx {
    pub fn new(file: Arc<Dir>) -> Self {
        Self { file, common: OfdTxCommon::new() }
    }

    pub fn bind(&mut self) {
        if !self.common.is_referenced() {
            self.common.bind(self.file.core.cc_mode(), 0);
        }
    }

    fn fd(fildes: RawFd) -> BorrowedFd<'static> {
        unsafe { BorrowedFd::borrow_raw(fildes) }
    }

    pub fn exec_fcntl_getfd(&mut self, fildes: RawFd) -> Result<i32> {
        if !self.common.local_lock.rdlock(&self.file.fields, fields::DIR_STATE) {
            return Err(Error::Conflict);
        }
        Ok(fcntl(Self::fd(fildes), FcntlArg::F_GETFD)?)
    }

    pub fn pre_commit(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn apply(&mut self, _fildes: RawFd) -> Result<()> {
        Ok(())
    }

    pub fn undo(&mut self, _fildes: RawFd) -> Result<()> {
        Ok(())
    }

    pub fn update_cc(&mut self) {
        self.common.local_lock.unlock_all(&self.file.fields);
    }

    pub fn clear_cc(&mut self) {
        self.update_cc();
    }

    pub fn finish(&mut self) -> bool {
        let was_referenced = self.common.is_referenced();
        self.common.unbind();
        if was_referenced { self.file.core.unref() } else { false }
    }
}
