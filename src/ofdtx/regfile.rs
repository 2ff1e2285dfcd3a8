//! Regular-file `ofd_tx` (spec §4.5's representative contracts).

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::unistd::Whence;

use crate::config::CcMode;
use crate::error::{Error, Result};
use crate::file::{fields, RegFile};
use crate::oplog::{IoOp, SeekOp};

use super::OfdTxCommon;

pub struct RegFileTx {
    pub file: Arc<RegFile>,
    pub common: OfdTxCommon<{ fields::REGFILE_NFIELDS }>,
}

impl RegFileTx {
    pub fn new(file: Arc<RegFile>) -> Self {
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

    /// `read` (spec §4.5 "read (regfile, 2PL)").
    pub fn exec_read(&mut self, fildes: RawFd, buf: &mut [u8], record_size: usize) -> Result<usize> {
        if !self.common.local_lock.wrlock(&self.file.fields, fields::REGFILE_OFFSET) {
            return Err(Error::Conflict);
        }
        self.common.rangelock.acquire_read(&self.file.rangelock, record_size, self.common.local_offset, buf.len())?;
        let n = nix::unistd::pread(Self::fd(fildes), buf, self.common.local_offset)?;
        let n = self.overlay_pending_writes(self.common.local_offset, buf, n);
        let bufoff = self.common.stage_write(&[]);
        self.common.oplog.push_ioop(IoOp { offset: self.common.local_offset, nbyte: n, bufoff, is_write: false });
        self.common.local_offset += n as i64;
        if self.common.cc_mode == CcMode::NoUndo {
            self.file.set_shared_offset(self.common.local_offset);
        }
        Ok(n)
    }

    /// `write` (spec §4.5 "write (regfile, 2PL)").
    pub fn exec_write(&mut self, fildes: RawFd, buf: &[u8], record_size: usize) -> Result<usize> {
        if !self.common.local_lock.wrlock(&self.file.fields, fields::REGFILE_OFFSET) {
            return Err(Error::Conflict);
        }
        self.common.rangelock.acquire_write(record_size, self.common.local_offset, buf.len());
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

    /// `pread`/`pwrite`: same locking shape as read/write but the caller's
    /// offset is used directly and `local_offset` is untouched (spec
    /// §4.5).
    pub fn exec_pread(&mut self, fildes: RawFd, buf: &mut [u8], offset: i64, record_size: usize) -> Result<usize> {
        self.common.rangelock.acquire_read(&self.file.rangelock, record_size, offset, buf.len())?;
        let n = nix::unistd::pread(Self::fd(fildes), buf, offset)?;
        Ok(self.overlay_pending_writes(offset, buf, n))
    }

    pub fn exec_pwrite(&mut self, fildes: RawFd, buf: &[u8], offset: i64, record_size: usize) -> Result<usize> {
        self.common.rangelock.acquire_write(record_size, offset, buf.len());
        if self.common.cc_mode == CcMode::NoUndo {
            return Ok(nix::unistd::pwrite(Self::fd(fildes), buf, offset)?);
        }
        let bufoff = self.common.stage_write(buf);
        self.common.oplog.push_ioop(IoOp { offset, nbyte: buf.len(), bufoff, is_write: true });
        Ok(buf.len())
    }

    /// `lseek` (spec §4.5).
    pub fn exec_lseek(&mut self, fildes: RawFd, offset: i64, whence: Whence) -> Result<i64> {
        if offset == 0 && whence == Whence::SeekCur {
            if !self.common.local_lock.rdlock(&self.file.fields, fields::REGFILE_OFFSET) {
                return Err(Error::Conflict);
            }
            return Ok(self.common.local_offset);
        }
        if !self.common.local_lock.wrlock(&self.file.fields, fields::REGFILE_OFFSET) {
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

    pub fn exec_fsync(&mut self, fildes: RawFd) -> Result<()> {
        if self.common.cc_mode == CcMode::NoUndo {
            nix::unistd::fsync(Self::fd(fildes))?;
        }
        Ok(())
    }

    pub fn exec_sync(&mut self, fildes: RawFd) -> Result<()> {
        nix::unistd::fsync(Self::fd(fildes))?;
        Ok(())
    }

    /// Overlays bytes this transaction has itself written, but not yet
    /// committed, onto a just-read buffer (spec §4.5 "Overlay bytes from
    /// write_ops that intersect the range" — the range is
    /// `[read_offset, +buf.len())`, independent of how much the kernel
    /// `pread` actually returned). A buffered write past the kernel's
    /// current EOF must still be visible to this transaction's own read
    /// (spec §8 property 6, "Local visibility ... regardless of the
    /// kernel file"), so any gap between `kernel_len` and the start of
    /// such a write is zero-filled rather than left as whatever garbage
    /// `buf` held on entry. Returns the total number of bytes now valid
    /// in `buf`, which may exceed `kernel_len`.
    fn overlay_pending_writes(&self, read_offset: i64, buf: &mut [u8], kernel_len: usize) -> usize {
        let read_end = read_offset + buf.len() as i64;
        let mut highest_end = read_offset + kernel_len as i64;
        for op in &self.common.oplog.ioops {
            if !op.is_write {
                continue;
            }
            let write_end = (op.offset + op.nbyte as i64).min(read_end);
            if op.offset < read_end && write_end > read_offset {
                highest_end = highest_end.max(write_end);
            }
        }
        let total = (highest_end - read_offset) as usize;
        if total > kernel_len {
            buf[kernel_len..total].fill(0);
        }
        for op in &self.common.oplog.ioops {
            if !op.is_write {
                continue;
            }
            let write_start = op.offset;
            let write_end = op.offset + op.nbyte as i64;
            let lo = write_start.max(read_offset);
            let hi = write_end.min(read_end);
            if lo >= hi {
                continue;
            }
            let src = &self.common.write_buf[op.bufoff + (lo - write_start) as usize..op.bufoff + (hi - write_start) as usize];
            let dst = &mut buf[(lo - read_offset) as usize..(hi - read_offset) as usize];
            dst.copy_from_slice(src);
        }
        total
    }

    /// Finalizes deferred write range locks in ascending offset order
    /// (spec §4.6 step 2).
    pub fn pre_commit(&mut self) -> Result<()> {
        self.common.rangelock.pre_commit(&self.file.rangelock)
    }

    /// Replays every buffered ioop/seekop against the kernel descriptor
    /// (spec §4.6 step 4). Batched per call kind by the caller.
    pub fn apply(&mut self, fildes: RawFd) -> Result<()> {
        for op in &self.common.oplog.ioops {
            if !op.is_write || op.nbyte == 0 {
                continue;
            }
            nix::unistd::pwrite(Self::fd(fildes), &self.common.write_buf[op.bufoff..op.bufoff + op.nbyte], op.offset)?;
        }
        for op in &self.common.oplog.seekops {
            let _ = op;
        }
        nix::unistd::lseek(Self::fd(fildes), self.common.local_offset, Whence::SeekSet)?;
        self.file.set_shared_offset(self.common.local_offset);
        Ok(())
    }

    /// Nothing became globally visible before commit, so undo is a no-op
    /// (spec §4.5 "write"'s undo, §4.7 preamble).
    pub fn undo(&mut self, _fildes: RawFd) -> Result<()> {
        Ok(())
    }

    pub fn update_cc(&mut self) {
        self.common.local_lock.unlock_all(&self.file.fields);
        self.common.rangelock.release_all(&self.file.rangelock);
    }

    pub fn clear_cc(&mut self) {
        self.update_cc();
    }

    pub fn finish(&mut self) -> bool {
        let was_referenced = self.common.is_referenced();
        self.common.unbind();
        if was_referenced {
            self.file.core.unref()
        } else {
            false
        }
    }
}
