//! Socket `ofd_tx` (spec §3.2 field table, §4.5 "listen"/"send"/"recv"/
//! "shutdown", §4 [ADDED] "bind").
//!
//! `RECV_END`/`SEND_END` play the role `FILE_OFFSET` plays for a regular
//! file: independent locks so a transaction can read while another
//! writes. Like a FIFO, consuming bytes from a socket's receive buffer
//! cannot be undone, so `recv` is `NoUndo`-only; `send` is buffered like
//! a regular-file write. `connect`/`shutdown`/`bind` have no meaningful
//! undo at all and are always `NoUndo`-only (spec §4.5).

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;

use crate::config::CcMode;
use crate::error::{Error, Result};
use crate::file::{fields, Socket};
use crate::oplog::IoOp;

use super::OfdTxCommon;

pub struct SocketTx {
    pub file: Arc<Socket>,
    pub common: OfdTxCommon<{ fields::SOCKET_NFIELDS }>,
}

impl SocketTx {
    pub fn new(file: Arc<Socket>) -> Self {
        Self { file, common: OfdTxCommon::new() }
    }

    pub fn bind_tx(&mut self) {
        if !self.common.is_referenced() {
            self.common.bind(self.file.core.cc_mode(), 0);
        }
    }

    fn fd(fildes: RawFd) -> BorrowedFd<'static> {
        unsafe { BorrowedFd::borrow_raw(fildes) }
    }

    /// `recv`: irrevocable only (spec §9 design notes; consuming from a
    /// socket's receive queue cannot be put back on abort).
    pub fn exec_recv(&mut self, fildes: RawFd, buf: &mut [u8], flags: i32) -> Result<usize> {
        if self.common.cc_mode != CcMode::NoUndo {
            return Err(Error::Revocable);
        }
        if !self.common.local_lock.wrlock(&self.file.fields, fields::SOCKET_RECV_END) {
            return Err(Error::Conflict);
        }
        let ret = unsafe {
            libc::recv(fildes, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
        };
        Ok(Errno::result(ret)? as usize)
    }

    /// `send` (spec §4.5: "Buffered in write_buf ... flags != 0 forces
    /// NoUndo").
    pub fn exec_send(&mut self, fildes: RawFd, buf: &[u8], flags: i32) -> Result<usize> {
        if !self.common.local_lock.wrlock(&self.file.fields, fields::SOCKET_SEND_END) {
            return Err(Error::Conflict);
        }
        if self.common.cc_mode == CcMode::NoUndo || flags != 0 {
            let ret = unsafe {
                libc::send(fildes, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
            };
            return Ok(Errno::result(ret)? as usize);
        }
        let bufoff = self.common.stage_write(buf);
        self.common.oplog.push_ioop(IoOp { offset: 0, nbyte: buf.len(), bufoff, is_write: true });
        Ok(buf.len())
    }

    /// `shutdown`: `NoUndo`-only (spec §4.5).
    pub fn exec_shutdown(&self, fildes: RawFd, how: nix::sys::socket::Shutdown) -> Result<()> {
        if self.common.cc_mode != CcMode::NoUndo {
            return Err(Error::Revocable);
        }
        nix::sys::socket::shutdown(fildes, how)?;
        Ok(())
    }

    /// `connect`: `NoUndo`-only (spec §4.5).
    pub fn exec_connect(&self, fildes: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> Result<()> {
        if self.common.cc_mode != CcMode::NoUndo {
            return Err(Error::Revocable);
        }
        let ret = unsafe { libc::connect(fildes, addr, addrlen) };
        Errno::result(ret)?;
        Ok(())
    }

    /// `bind`: `NoUndo`-only (spec §4 [ADDED] "bind()").
    pub fn exec_bind(&self, fildes: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> Result<()> {
        if self.common.cc_mode != CcMode::NoUndo {
            return Err(Error::Revocable);
        }
        let ret = unsafe { libc::bind(fildes, addr, addrlen) };
        Errno::result(ret)?;
        Ok(())
    }

    /// `listen` (spec §4.5 "listen (socket 2PL-extended)"): verifies
    /// `SOCK_STREAM` under a write lock on `STATE`, and preflights a
    /// non-blocking socket with a 10-second `select` so a caller that
    /// isn't actually about to service connections fails with `Conflict`
    /// instead of silently listening on a socket nobody will drain.
    pub fn exec_listen(&mut self, fildes: RawFd, backlog: i32) -> Result<()> {
        if !self.common.local_lock.wrlock(&self.file.fields, fields::SOCKET_STATE) {
            return Err(Error::Conflict);
        }
        let sock_type: libc::c_int = unsafe {
            let mut val: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let ret = libc::getsockopt(
                fildes,
                libc::SOL_SOCKET,
                libc::SO_TYPE,
                &mut val as *mut _ as *mut libc::c_void,
                &mut len,
            );
            Errno::result(ret)?;
            val
        };
        if sock_type != libc::SOCK_STREAM {
            return Err(Error::Errno(nix::errno::Errno::EOPNOTSUPP));
        }
        let oflags = nix::fcntl::fcntl(Self::fd(fildes), nix::fcntl::FcntlArg::F_GETFL)?;
        let nonblocking = nix::fcntl::OFlag::from_bits_truncate(oflags).contains(nix::fcntl::OFlag::O_NONBLOCK);
        if nonblocking {
            self.preflight_select(fildes, Duration::from_secs(10))?;
        }
        if self.common.cc_mode == CcMode::NoUndo {
            nix::sys::socket::listen(Self::fd(fildes), backlog_arg(backlog))?;
        }
        Ok(())
    }

    /// Uses the raw `poll(2)` syscall rather than `nix::poll`'s typed
    /// wrapper: the caller's fildes is not one this engine's `PollFd`
    /// machinery tracks, so there is nothing gained from the typed API
    /// here beyond the plain libc call (spec §4.5 "listen": "briefly
    /// `select` it with a 10-sec timeout").
    fn preflight_select(&self, fildes: RawFd, timeout: Duration) -> Result<()> {
        let mut pfd = libc::pollfd { fd: fildes, events: libc::POLLIN, revents: 0 };
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        let n = Errno::result(ret)?;
        if n == 0 {
            return Err(Error::Conflict);
        }
        Ok(())
    }

    pub fn pre_commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// `listen`'s real syscall runs here for the 2PL path; buffered
    /// `send`s are flushed (spec §4.6 step 4).
    pub fn apply(&mut self, fildes: RawFd) -> Result<()> {
        for op in &self.common.oplog.ioops {
            if !op.is_write || op.nbyte == 0 {
                continue;
            }
            let ret = unsafe {
                libc::send(
                    fildes,
                    self.common.write_buf[op.bufoff..op.bufoff + op.nbyte].as_ptr() as *const libc::c_void,
                    op.nbyte,
                    0,
                )
            };
            Errno::result(ret)?;
        }
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

fn backlog_arg(backlog: i32) -> usize {
    backlog.max(0) as usize
}
