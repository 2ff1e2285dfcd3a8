//! FIFO `ofd_tx` (spec §3.2 field table, §4.5).
//!
//! A pipe has no byte-range lock map and no seekable offset: `lseek`
//! always fails with `ESPIPE` (spec §4.5 "lseek on FIFO/socket/pipe").
//! Reading consumes bytes from the kernel's pipe buffer the moment the
//! real `read(2)` runs, which cannot be undone — so, unlike a regular
//! file's `pread`, a FIFO read has no 2PL form and is `NoUndo`-only
//! (spec §1 Non-goals: "operations that have no meaningful undo in
//! non-irrevocable mode ... force the transaction into irrevocable
//! mode"). Writes are buffered exactly like a regular file's, since
//! nothing reaches the kernel until commit.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg};

use crate::config::CcMode;
use crate::error::{Error, Result};
use crate::file::{fields, Fifo};
use crate::oplog::{FcntlOp, IoOp};

use super::OfdTxCommon;

pub struct FifoTx {
    pub file: Arc<Fifo>,
    pub is_read_end: bool,
    pub common: OfdTxCommon<{ fields::FIFO_NFIELDS }>,
}

impl FifoTx {
    pub fn new(file: Arc<Fifo>, is_read_end: bool) -> Self {
        Self { file, is_read_end, common: OfdTxCommon::new() }
    }

    pub fn bind(&mut self) {
        if !self.common.is_referenced() {
            self.common.bind(self.file.core.cc_mode(), 0);
        }
    }

    fn fd(fildes: RawFd) -> BorrowedFd<'static> {
        unsafe { BorrowedFd::borrow_raw(fildes) }
    }

    fn end_field(&self) -> usize {
        if self.is_read_end { fields::FIFO_READ_END } else { fields::FIFO_WRITE_END }
    }

    /// `read` (spec §4.5 design notes: no undo support for stream reads,
    /// so this call is irrevocable-only).
    pub fn exec_read(&mut self, fildes: RawFd, buf: &mut [u8]) -> Result<usize> {
        if self.common.cc_mode != CcMode::NoUndo {
            return Err(Error::Revocable);
        }
        if !self.common.local_lock.wrlock(&self.file.fields, self.end_field()) {
            return Err(Error::Conflict);
        }
        Ok(nix::unistd::read(Self::fd(fildes), buf)?)
    }

    /// `write`: buffered exactly like a regular file's (spec §4.5
    /// "write (regfile, 2PL)", applied here to the write end).
    pub fn exec_write(&mut self, fildes: RawFd, buf: &[u8]) -> Result<usize> {
        if !self.common.local_lock.wrlock(&self.file.fields, self.end_field()) {
            return Err(Error::Conflict);
        }
        if self.common.cc_mode == CcMode::NoUndo {
            return Ok(nix::unistd::write(Self::fd(fildes), buf)?);
        }
        let bufoff = self.common.stage_write(buf);
        self.common.oplog.push_ioop(IoOp { offset: 0, nbyte: buf.len(), bufoff, is_write: true });
        Ok(buf.len())
    }

    /// `lseek` always fails (spec §4.5 "lseek on FIFO/socket/pipe").
    pub fn exec_lseek(&self) -> Result<i64> {
        Err(Error::Errno(nix::errno::Errno::ESPIPE))
    }

    pub fn exec_fcntl_getfd(&mut self, fildes: RawFd) -> Result<i32> {
        if !self.common.local_lock.rdlock(&self.file.fields, fields::FIFO_STATE) {
            return Err(Error::Conflict);
        }
        Ok(fcntl(Self::fd(fildes), FcntlArg::F_GETFD)?)
    }

    pub fn exec_fcntl_setfl(&mut self, fildes: RawFd, new_flags: i32) -> Result<()> {
        if self.common.cc_mode != CcMode::NoUndo {
            return Err(Error::Revocable);
        }
        if !self.common.local_lock.wrlock(&self.file.fields, fields::FIFO_STATE) {
            return Err(Error::Conflict);
        }
        let old_flags = fcntl(Self::fd(fildes), FcntlArg::F_GETFL)?;
        fcntl(Self::fd(fildes), FcntlArg::F_SETFL(nix::fcntl::OFlag::from_bits_truncate(new_flags)))?;
        self.common.oplog.push_fcntlop(FcntlOp::SetFl { old_flags });
        Ok(())
    }

    pub fn pre_commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Replays buffered writes against the kernel pipe at commit (spec
    /// §4.6 step 4).
    pub fn apply(&mut self, fildes: RawFd) -> Result<()> {
        for op in &self.common.oplog.ioops {
            if op.nbyte == 0 {
                continue;
            }
            nix::unistd::write(Self::fd(fildes), &self.common.write_buf[op.bufoff..op.bufoff + op.nbyte])?;
        }
        Ok(())
    }

    /// Nothing reached the kernel before commit (spec §4.7 preamble).
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
