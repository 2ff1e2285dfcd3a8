//! Character-device `ofd_tx` (spec §3.2 field table, §4.5).
//!
//! Shares `FILE_OFFSET`/`FILE_MODE`/`STATE` with a regular file but has no
//! byte-range lock map (spec §3.2 table; `file::ChrDev` carries no
//! `rangelock` field) — the field lock on `FILE_OFFSET` alone arbitrates
//! concurrent positional I/O on the device.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::Whence;

use crate::config::CcMode;
use crate::error::{Error, Result};
use crate::file::{fields, ChrDev};
use crate::oplog::{FcntlOp, IoOp, SeekOp};

use super::OfdTxCommon;

pub struct ChrDevTx {
    pub file: Arc<ChrDev>,
    pub common: OfdTxCommon<{ fields::CHRDEV_NFIELDS }>,
}

impl ChrDevTx {
    pub fn new(file: Arc<ChrDev>) -> Self {
        Self { file, common: OfdTxCommon::new() }
    }

    pub fn bind(&mut self, fildes: RawFd) -> Result<()> {
        if !self.common.is_referenced() {
            let offset = self.file.synced_offset(fildes)?;
            self.common.bind(self.file.core.cc_mode(), offset);
        }
        Ok(())
    }

    fn fd(fildes: RawFd) -> BorrowedFd<'static> {
        unsafe { BorrowedFd::borrow_raw(fildes) }
    }

    pub fn exec_read(&mut self, fildes: RawFd, buf: &mut [u8]) -> Result<usize> {
        if !self.common.local_lock.wrlock(&self.file.fields, fields::CHRDEV_OFFSET) {
            return Err(Error::Conflict);
        }
        let n = nix::unistd::pread(Self::fd(fildes), buf, self.common.local_offset)?;
        self.common.local_offset += n as i64;
        if self.common.cc_mode == CcMode::NoUndo {
            self.file.set_shared_offset(self.common.local_offset);
        }
        Ok(n)
    }

    pub fn exec_write(&mut self, fildes: RawFd, buf: &[u8]) -> Result<usize> {
        if !self.common.local_lock.wrlock(&self.file.fields, fields::CHRDEV_OFFSET) {
            return Err(Error::Conflict);
        }
        if self.common.cc_mode == CcMode::NoUndo {
            let n = nix::unistd::pwrite(Self::fd(fildes), buf, self.common.local_offset)?;
            nix::unistd::lseek(Self::fd(fildes), self.common.local_offset + n as i64, Whence::SeekSet)?;
            self.common.local_offset += n as i64;
            self.file.set_shared_offset(self.common.local_offset);
            return Ok(n);
        }
        let bufoff = self.common.stage_write(buf);
        self.common.oplog.push_ioop(IoOp { offset: self.common.local_offset, nbyte: buf.len(), bufoff, is_write: true });
        self.common.local_offset += buf.len() as i64;
        Ok(buf.len())
    }

    pub fn exec_lseek(&mut self, fildes: RawFd, offset: i64, whence: Whence) -> Result<i64> {
        if offset == 0 && whence == Whence::SeekCur {
            if !self.common.local_lock.rdlock(&self.file.fields, fields::CHRDEV_OFFSET) {
                return Err(Error::Conflict);
            }
            return Ok(self.common.local_offset);
        }
        if !self.common.local_lock.wrlock(&self.file.fields, fields::CHRDEV_OFFSET) {
            return Err(Error::Conflict);
        }
        let from = self.common.local_offset;
        let absolute = match whence {
            Whence::SeekSet => offset,
            Whence::SeekCur => from + offset,
            Whence::SeekEnd => {
                let st = nix::sys::stat::fstat(Self::fd(fildes))?;
                st.st_size + offset
            }
            _ => return Err(Error::Errno(nix::errno::Errno::EINVAL)),
        };
        if absolute < 0 {
            return Err(Error::Errno(nix::errno::Errno::EINVAL));
        }
        self.common.oplog.push_seekop(SeekOp { from, offset: absolute, whence });
        self.common.local_offset = absolute;
        if self.common.cc_mode == CcMode::NoUndo {
            nix::unistd::lseek(Self::fd(fildes), absolute, Whence::SeekSet)?;
            self.file.set_shared_offset(absolute);
        }
        Ok(absolute)
    }

    pub fn exec_fcntl_getfl(&mut self, fildes: RawFd) -> Result<i32> {
        if !self.common.local_lock.rdlock(&self.file.fields, fields::CHRDEV_STATE) {
            return Err(Error::Conflict);
        }
        Ok(fcntl(Self::fd(fildes), FcntlArg::F_GETFL)?)
    }

    pub fn exec_fcntl_setfl(&mut self, fildes: RawFd, new_flags: i32) -> Result<()> {
        if self.common.cc_mode != CcMode::NoUndo {
            return Err(Error::Revocable);
        }
        if !self.common.local_lock.wrlock(&self.file.fields, fields::CHRDEV_STATE) {
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

    pub fn apply(&mut self, fildes: RawFd) -> Result<()> {
        for op in &self.common.oplog.ioops {
            if !op.is_write || op.nbyte == 0 {
                continue;
            }
            nix::unistd::pwrite(Self::fd(fildes), &self.common.write_buf[op.bufoff..op.bufoff + op.nbyte], op.offset)?;
        }
        nix::unistd::lseek(Self::fd(fildes), self.common.local_offset, Whence::SeekSet)?;
        self.file.set_shared_offset(self.common.local_offset);
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
